use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::config::LiveConfig;

type HmacSha256 = Hmac<Sha256>;

/// Result of a live order submit. `ok = false` carries the failure string
/// that ends up on the `live_trade` event; the ledger is never mutated on
/// failure.
#[derive(Debug, Clone)]
pub struct LiveOrderResult {
    pub ok: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

impl LiveOrderResult {
    fn fail(error: &str) -> Self {
        Self {
            ok: false,
            order_id: None,
            error: Some(error.to_string()),
        }
    }
}

/// Pre-provisioned CLOB API credentials, env-only.
#[derive(Debug, Clone)]
struct ApiCreds {
    address: String,
    key: String,
    secret: String,
    passphrase: String,
}

impl ApiCreds {
    fn from_env() -> Option<Self> {
        let address = std::env::var("FUNDER").ok().filter(|s| !s.is_empty())?;
        let key = std::env::var("API_KEY").ok().filter(|s| !s.is_empty())?;
        let secret = std::env::var("API_SECRET").ok().filter(|s| !s.is_empty())?;
        let passphrase = std::env::var("API_PASSPHRASE")
            .ok()
            .filter(|s| !s.is_empty())?;
        Some(Self {
            address,
            key,
            secret,
            passphrase,
        })
    }
}

#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    token_id: &'a str,
    side: &'a str,
    price: Decimal,
    size: Decimal,
    #[serde(rename = "orderType")]
    order_type: &'a str,
    #[serde(rename = "postOnly", skip_serializing_if = "std::ops::Not::not")]
    post_only: bool,
    owner: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID")]
    order_id: Option<String>,
    id: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    error: Option<String>,
}

/// Live CLOB order bridge.
///
/// Uses L2 (API key) auth exclusively: HMAC-SHA256 signed headers built
/// from env credentials. Paper mode never constructs one of these paths;
/// `dry_run` short-circuits before any network call.
pub struct LiveExecutor {
    cfg: LiveConfig,
    http: reqwest::Client,
    creds: Option<ApiCreds>,
}

impl LiveExecutor {
    pub fn new(cfg: LiveConfig) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");

        let creds = ApiCreds::from_env();
        if cfg.enabled && !cfg.dry_run && creds.is_none() {
            warn!("live execution enabled but API creds are missing from env");
        }

        Self { cfg, http, creds }
    }

    fn l2_signature(
        secret: &str,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, String> {
        let key = URL_SAFE
            .decode(secret)
            .map_err(|e| format!("bad_api_secret: {e}"))?;
        let mut mac =
            HmacSha256::new_from_slice(&key).map_err(|e| format!("bad_api_secret: {e}"))?;
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// Submit one order. Never panics; every failure mode maps to an error
    /// string surfaced on the `live_trade` event.
    pub async fn place(
        &self,
        token_id: &str,
        side: &str,
        price: f64,
        size: f64,
        post_only: bool,
    ) -> LiveOrderResult {
        if !self.cfg.enabled {
            return LiveOrderResult::fail("live_disabled");
        }
        if token_id.is_empty() {
            return LiveOrderResult::fail("token_id_missing");
        }
        if price <= 0.0 || size <= 0.0 {
            return LiveOrderResult::fail("invalid_price_or_size");
        }

        if self.cfg.dry_run {
            return LiveOrderResult {
                ok: true,
                order_id: Some("dry_run".into()),
                error: None,
            };
        }

        let Some(creds) = &self.creds else {
            return LiveOrderResult::fail("api_creds_missing");
        };

        let (Some(price_dec), Some(size_dec)) =
            (Decimal::from_f64(price), Decimal::from_f64(size))
        else {
            return LiveOrderResult::fail("invalid_price_or_size");
        };

        let payload = OrderPayload {
            token_id,
            side,
            price: price_dec.round_dp(4),
            size: size_dec.round_dp(6),
            order_type: if post_only {
                "POST_ONLY"
            } else {
                &self.cfg.order_type
            },
            post_only,
            owner: &creds.key,
        };
        let body = match serde_json::to_string(&payload) {
            Ok(b) => b,
            Err(e) => return LiveOrderResult::fail(&format!("post_order_failed: {e}")),
        };

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let path = "/order";
        let signature = match Self::l2_signature(&creds.secret, &timestamp, "POST", path, &body) {
            Ok(s) => s,
            Err(e) => return LiveOrderResult::fail(&format!("post_order_failed: {e}")),
        };

        let url = format!("{}{}", self.cfg.clob_host, path);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("POLY_ADDRESS", &creds.address)
            .header("POLY_API_KEY", &creds.key)
            .header("POLY_PASSPHRASE", &creds.passphrase)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_SIGNATURE", signature)
            .body(body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => return LiveOrderResult::fail(&format!("post_order_failed: {e}")),
        };

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return LiveOrderResult::fail(&format!("post_order_failed: http {status}: {text}"));
        }

        match serde_json::from_str::<OrderResponse>(&text) {
            Ok(parsed) => {
                if let Some(err) = parsed.error.or(parsed.error_msg).filter(|e| !e.is_empty()) {
                    return LiveOrderResult::fail(&format!("post_order_failed: {err}"));
                }
                let order_id = parsed.order_id.or(parsed.id);
                info!("live order accepted: {:?}", order_id);
                LiveOrderResult {
                    ok: true,
                    order_id,
                    error: None,
                }
            }
            Err(_) => LiveOrderResult {
                ok: true,
                order_id: None,
                error: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(enabled: bool, dry_run: bool) -> LiveExecutor {
        let cfg = LiveConfig {
            enabled,
            dry_run,
            ..LiveConfig::default()
        };
        LiveExecutor::new(cfg)
    }

    #[tokio::test]
    async fn disabled_refuses_orders() {
        let ex = executor(false, true);
        let res = ex.place("tok", "BUY", 0.5, 10.0, false).await;
        assert!(!res.ok);
        assert_eq!(res.error.as_deref(), Some("live_disabled"));
    }

    #[tokio::test]
    async fn missing_token_and_bad_prices_are_rejected() {
        let ex = executor(true, true);
        let res = ex.place("", "BUY", 0.5, 10.0, false).await;
        assert_eq!(res.error.as_deref(), Some("token_id_missing"));
        let res = ex.place("tok", "BUY", 0.0, 10.0, false).await;
        assert_eq!(res.error.as_deref(), Some("invalid_price_or_size"));
        let res = ex.place("tok", "SELL", 0.5, -1.0, false).await;
        assert_eq!(res.error.as_deref(), Some("invalid_price_or_size"));
    }

    #[tokio::test]
    async fn dry_run_short_circuits() {
        let ex = executor(true, true);
        let res = ex.place("tok", "BUY", 0.5, 10.0, true).await;
        assert!(res.ok);
        assert_eq!(res.order_id.as_deref(), Some("dry_run"));
    }

    #[test]
    fn signature_is_deterministic() {
        let secret = URL_SAFE.encode(b"super-secret-key");
        let a = LiveExecutor::l2_signature(&secret, "1700000000", "POST", "/order", "{}").unwrap();
        let b = LiveExecutor::l2_signature(&secret, "1700000000", "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        let c = LiveExecutor::l2_signature(&secret, "1700000001", "POST", "/order", "{}").unwrap();
        assert_ne!(a, c);
    }
}
