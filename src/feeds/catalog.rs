use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::models::market::{bucket_slug, MarketRef, Timeframe};

/// Keywords used by the broad-rescue path when focused discovery finds
/// nothing.
pub const RESCUE_KEYWORDS: [&str; 6] = ["btc", "bitcoin", "up or down", "15m", "15 min", "15-minute"];

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Some(dt);
    }
    // Naive timestamps from the API are UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

fn value_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn string_or_json_array(v: &Value) -> Vec<String> {
    match v {
        Value::Array(arr) => arr.iter().map(value_str).collect(),
        // Gamma encodes token ids and prices as JSON-in-a-string.
        Value::String(s) => serde_json::from_str::<Vec<Value>>(s)
            .map(|arr| arr.iter().map(value_str).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Parse one Gamma market object into a reference, tolerating the API's
/// mixed encodings. Returns None when the two outcome tokens are missing.
pub fn ref_from_value(m: &Value) -> Option<MarketRef> {
    let token_ids = string_or_json_array(m.get("clobTokenIds").unwrap_or(&Value::Null));
    if token_ids.len() < 2 || token_ids[0].is_empty() || token_ids[1].is_empty() {
        return None;
    }

    let prices = string_or_json_array(m.get("outcomePrices").unwrap_or(&Value::Null));
    let yes_hint = prices
        .first()
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0);
    let no_hint = prices
        .get(1)
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0);

    let ev0 = m
        .get("events")
        .and_then(|e| e.as_array())
        .and_then(|a| a.first())
        .cloned()
        .unwrap_or(Value::Null);
    let field = |key: &str| -> String {
        let own = value_str(m.get(key).unwrap_or(&Value::Null));
        if !own.is_empty() {
            return own;
        }
        value_str(ev0.get(key).unwrap_or(&Value::Null))
    };

    let end_date = field("endDate");
    let event_start = {
        let own = value_str(m.get("eventStartTime").unwrap_or(&Value::Null));
        if !own.is_empty() {
            own
        } else {
            value_str(ev0.get("startTime").unwrap_or(&Value::Null))
        }
    };

    Some(MarketRef {
        market_id: value_str(m.get("id").unwrap_or(&Value::Null)),
        question: value_str(m.get("question").unwrap_or(&Value::Null)),
        slug: field("slug"),
        yes_token: token_ids[0].clone(),
        no_token: token_ids[1].clone(),
        accepting_orders: m
            .get("acceptingOrders")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        liquidity_hint: m
            .get("liquidityNum")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        yes_price_hint: yes_hint,
        no_price_hint: no_hint,
        end_time: parse_datetime(&end_date),
        event_start_time: parse_datetime(&event_start),
        resolution_source: field("resolutionSource"),
    })
}

/// Coarse topic classification for the secondary-group diversity cap.
pub fn topic_bucket(question: &str, slug: &str) -> &'static str {
    let hay = format!("{} {}", question, slug).to_lowercase();
    if hay.contains("super bowl") {
        "super_bowl"
    } else if hay.contains("nba") {
        "nba"
    } else if hay.contains("nfl") {
        "nfl"
    } else if hay.contains("election") || hay.contains("president") {
        "politics"
    } else if hay.contains("fed") || hay.contains("cpi") || hay.contains("rate") {
        "macro"
    } else {
        "other"
    }
}

/// Rolling slugs `prefix<bucket>` around the current bucket boundary, for
/// prefixes carrying the timeframe tag.
pub fn generated_bucket_slugs(
    prefixes: &[String],
    timeframe: Timeframe,
    windows: i64,
    lookback_windows: i64,
    now_unix: i64,
) -> Vec<String> {
    let bucket = timeframe.bucket_seconds() as i64;
    let base = (now_unix / bucket) * bucket;
    let mut slugs = Vec::new();
    for p in prefixes {
        if !p.to_lowercase().contains(timeframe.tag()) {
            continue;
        }
        for k in -lookback_windows..=windows {
            slugs.push(bucket_slug(p, (base + bucket * k) as u64));
        }
    }
    slugs
}

/// Market catalog client over the Gamma REST API.
pub struct CatalogClient {
    base_url: String,
    http: reqwest::Client,
    calls: AtomicU64,
}

impl CatalogClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(6))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn reset_call_count(&self) {
        self.calls.store(0, Ordering::Relaxed);
    }

    async fn get_markets(&self, params: &[(&str, String)]) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/markets", self.base_url);
        let resp = self.http.get(&url).query(params).send().await?;
        let arr: Vec<Value> = resp.error_for_status()?.json().await?;
        Ok(arr)
    }

    /// Active markets, optionally filtered by focus keywords over
    /// question + slug.
    pub async fn fetch_active_refs(
        &self,
        limit: usize,
        focus_keywords: &[String],
    ) -> Result<Vec<MarketRef>> {
        let arr = self
            .get_markets(&[
                ("active", "true".into()),
                ("closed", "false".into()),
                ("limit", limit.to_string()),
            ])
            .await?;

        let kws: Vec<String> = focus_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| k.to_lowercase())
            .collect();
        let refs = arr
            .iter()
            .filter(|m| {
                if kws.is_empty() {
                    return true;
                }
                let hay = format!(
                    "{} {}",
                    value_str(m.get("question").unwrap_or(&Value::Null)),
                    value_str(m.get("slug").unwrap_or(&Value::Null))
                )
                .to_lowercase();
                kws.iter().any(|k| hay.contains(k))
            })
            .filter_map(ref_from_value)
            .collect();
        Ok(refs)
    }

    /// Explicit slug lookups; per-slug failures are skipped.
    pub async fn fetch_refs_by_slugs(&self, slugs: &[String]) -> Vec<MarketRef> {
        let mut refs = Vec::new();
        for slug in slugs.iter().filter(|s| !s.is_empty()) {
            match self.get_markets(&[("slug", slug.clone())]).await {
                Ok(arr) => refs.extend(arr.iter().filter_map(ref_from_value)),
                Err(e) => debug!("slug lookup failed for {slug}: {e}"),
            }
        }
        refs
    }

    /// Prefix listing over the active (or full) market set, sorted
    /// latest-ending first so rolling series pick the newest window.
    pub async fn fetch_refs_by_slug_prefixes(
        &self,
        prefixes: &[String],
        limit: usize,
        active_only: bool,
    ) -> Result<Vec<MarketRef>> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = vec![("limit", limit.to_string())];
        if active_only {
            params.push(("active", "true".into()));
            params.push(("closed", "false".into()));
        }
        let arr = self.get_markets(&params).await?;

        let prefs: Vec<String> = prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.to_lowercase())
            .collect();
        let mut refs: Vec<MarketRef> = arr
            .iter()
            .filter(|m| {
                let slug = value_str(m.get("slug").unwrap_or(&Value::Null)).to_lowercase();
                prefs.iter().any(|p| slug.starts_with(p))
            })
            .filter_map(ref_from_value)
            .collect();

        refs.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        Ok(refs)
    }

    /// Discover rolling markets by generating bucket slugs around now.
    pub async fn fetch_refs_by_generated_slugs(
        &self,
        prefixes: &[String],
        timeframe: Timeframe,
        windows: i64,
        lookback_windows: i64,
    ) -> Vec<MarketRef> {
        let slugs = generated_bucket_slugs(
            prefixes,
            timeframe,
            windows,
            lookback_windows,
            Utc::now().timestamp(),
        );
        self.fetch_refs_by_slugs(&slugs).await
    }

    /// Secondary-group discovery: active non-BTC markets resolving within
    /// the horizon, most liquid first.
    pub async fn fetch_alt_refs(&self, horizon_days: i64) -> Result<Vec<MarketRef>> {
        let broad = self.fetch_active_refs(700, &[]).await?;
        let now = Utc::now();
        let horizon = now + Duration::days(horizon_days);
        let mut cands: Vec<MarketRef> = broad
            .into_iter()
            .filter(|r| !r.is_btc())
            .filter(|r| match r.end_time {
                Some(end) => end > now && end <= horizon,
                None => false,
            })
            .collect();
        cands.sort_by(|a, b| b.liquidity_hint.total_cmp(&a.liquidity_hint));
        Ok(cands)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedWindowPrices {
    open: Option<f64>,
    current: Option<f64>,
    fetched_ts: f64,
}

const PRICE_CACHE_TTL_OK: f64 = 120.0;
const PRICE_CACHE_TTL_MISS: f64 = 20.0;
const PRICE_FORCE_REFRESH_S: f64 = 60.0;

/// Resolution-price client for BTC windows (`openPrice` is the target,
/// `closePrice` tracks current while the window is active). Cached per
/// window with a shorter TTL while the open price is still unknown.
pub struct CryptoPriceClient {
    base_url: String,
    http: reqwest::Client,
    cache: DashMap<String, CachedWindowPrices>,
}

impl CryptoPriceClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(6))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            cache: DashMap::new(),
        }
    }

    pub async fn window_prices(
        &self,
        event_start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        variant: &str,
    ) -> (Option<f64>, Option<f64>) {
        let Some(start) = event_start else {
            return (None, None);
        };
        let start_iso = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end_iso = end
            .map(|e| e.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let key = format!("{start_iso}|{end_iso}|{variant}");
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;

        if let Some(cached) = self.cache.get(&key).map(|c| *c) {
            let ttl = if cached.open.is_some() {
                PRICE_CACHE_TTL_OK
            } else {
                PRICE_CACHE_TTL_MISS
            };
            // At least one refresh per minute for rolling windows.
            if now - cached.fetched_ts <= ttl.min(PRICE_FORCE_REFRESH_S) {
                return (cached.open, cached.current);
            }
        }

        let mut open = None;
        let mut current = None;
        let url = format!("{}/crypto/crypto-price", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("symbol", "BTC"),
                ("eventStartTime", &start_iso),
                ("endDate", &end_iso),
                ("variant", variant),
            ])
            .send()
            .await;
        if let Ok(resp) = resp {
            if resp.status().is_success() {
                if let Ok(obj) = resp.json::<Value>().await {
                    open = obj.get("openPrice").and_then(|v| v.as_f64());
                    current = obj.get("closePrice").and_then(|v| v.as_f64());
                }
            }
        }

        self.cache.insert(
            key,
            CachedWindowPrices {
                open,
                current,
                fetched_ts: now,
            },
        );
        (open, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_parses_string_encoded_token_ids() {
        let m = json!({
            "id": "0x123",
            "question": "Bitcoin Up or Down - June 5, 3:45PM ET",
            "slug": "btc-updown-15m-1770933900",
            "clobTokenIds": "[\"111\", \"222\"]",
            "outcomePrices": "[\"0.52\", \"0.48\"]",
            "acceptingOrders": true,
            "liquidityNum": 1234.5,
            "endDate": "2026-06-05T19:45:00Z",
            "eventStartTime": "2026-06-05T19:30:00Z",
            "resolutionSource": "https://data.chain.link/streams/btc-usd"
        });
        let r = ref_from_value(&m).unwrap();
        assert_eq!(r.yes_token, "111");
        assert_eq!(r.no_token, "222");
        assert!((r.yes_price_hint - 0.52).abs() < 1e-9);
        assert!(r.end_time.is_some());
        assert!(r.is_btc());
    }

    #[test]
    fn ref_falls_back_to_event_fields() {
        let m = json!({
            "id": 42,
            "question": "Some question",
            "clobTokenIds": ["a", "b"],
            "events": [{
                "slug": "event-slug",
                "endDate": "2026-06-05T19:45:00Z",
                "startTime": "2026-06-05T19:30:00Z"
            }]
        });
        let r = ref_from_value(&m).unwrap();
        assert_eq!(r.market_id, "42");
        assert_eq!(r.slug, "event-slug");
        assert!(r.event_start_time.is_some());
    }

    #[test]
    fn ref_without_tokens_is_dropped() {
        let m = json!({"id": "1", "question": "q", "clobTokenIds": "[]"});
        assert!(ref_from_value(&m).is_none());
    }

    #[test]
    fn generated_slugs_cover_window_range() {
        let prefixes = vec!["btc-updown-15m-".to_string(), "btc-updown-5m-".to_string()];
        let now = 1_770_933_700i64; // inside the bucket starting 1770933600
        let slugs = generated_bucket_slugs(&prefixes, Timeframe::FifteenMin, 2, 1, now);
        // Only the 15m prefix matches the 15m timeframe; window -1..=2.
        assert_eq!(slugs.len(), 4);
        assert!(slugs.contains(&"btc-updown-15m-1770932700".to_string()));
        assert!(slugs.contains(&"btc-updown-15m-1770933600".to_string()));
        assert!(slugs.contains(&"btc-updown-15m-1770935400".to_string()));

        // "15m" also contains the "5m" tag, so 5m generation covers both
        // prefixes (lookups for the wrong series simply miss).
        let slugs5 = generated_bucket_slugs(&prefixes, Timeframe::FiveMin, 1, 0, now);
        assert!(slugs5.iter().any(|s| s.starts_with("btc-updown-5m-")));
        assert!(slugs5
            .iter()
            .filter(|s| s.starts_with("btc-updown-5m-"))
            .all(|s| s.ends_with("00")));
    }

    #[test]
    fn topic_buckets() {
        assert_eq!(topic_bucket("Will the Fed cut rates?", ""), "macro");
        assert_eq!(topic_bucket("", "nba-finals-2026"), "nba");
        assert_eq!(topic_bucket("Who wins the election?", ""), "politics");
        assert_eq!(topic_bucket("Something else", "misc"), "other");
    }

    #[test]
    fn datetime_parsing_variants() {
        assert!(parse_datetime("2026-06-05T19:45:00Z").is_some());
        assert!(parse_datetime("2026-06-05T19:45:00+00:00").is_some());
        assert!(parse_datetime("2026-06-05T19:45:00").is_some());
        assert!(parse_datetime("").is_none());
        assert!(parse_datetime("not a date").is_none());
    }
}
