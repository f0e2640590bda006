use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::models::market::SpotSample;

const HISTORY_SECONDS: f64 = 700.0;
const RECONNECT_BACKOFF_S: u64 = 2;

/// One spot update pushed to downstream consumers (event-log forwarder).
#[derive(Debug, Clone)]
pub struct SpotTick {
    pub chainlink: Option<f64>,
    pub binance: Option<f64>,
    pub ts: f64,
    pub symbol: String,
}

#[derive(Debug, Default)]
struct SpotState {
    chainlink: Option<f64>,
    binance: Option<f64>,
    last_ts: f64,
    history: VecDeque<SpotSample>,
}

/// Live BTC spot feed: the oracle stream is authoritative for resolution,
/// the exchange stream is the fast reference. Maintains a rolling window
/// of blended samples for the forecaster.
pub struct SpotFeed {
    url: String,
    state: Arc<Mutex<SpotState>>,
    tick_tx: broadcast::Sender<SpotTick>,
}

impl SpotFeed {
    pub fn new(url: &str) -> Self {
        let (tick_tx, _) = broadcast::channel(1024);
        Self {
            url: url.to_string(),
            state: Arc::new(Mutex::new(SpotState::default())),
            tick_tx,
        }
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<SpotTick> {
        self.tick_tx.subscribe()
    }

    /// Latest (oracle, exchange) prices.
    pub fn live_prices(&self) -> (Option<f64>, Option<f64>) {
        let st = self.state.lock();
        (st.chainlink, st.binance)
    }

    /// Copy out the blended history for signal computation.
    pub fn signal_window(&self) -> Vec<SpotSample> {
        self.state.lock().history.iter().copied().collect()
    }

    /// Blended sample closest to `ts`, if within `max_delta_s`.
    pub fn price_near_ts(&self, ts: f64, max_delta_s: f64) -> Option<f64> {
        let st = self.state.lock();
        let mut best: Option<(f64, f64)> = None;
        for s in &st.history {
            let dt = (s.ts - ts).abs();
            if best.map(|(d, _)| dt < d).unwrap_or(true) {
                best = Some((dt, s.price));
            }
        }
        best.filter(|(d, _)| *d <= max_delta_s).map(|(_, p)| p)
    }

    /// Fold one symbol update into state. Exposed for the ws task and for
    /// tests; `symbol` is `btc/usd` (oracle) or `btcusdt` (exchange).
    pub fn record(&self, symbol: &str, price: f64, now_ts: f64) {
        if price <= 0.0 {
            return;
        }
        let tick = {
            let mut st = self.state.lock();
            match symbol {
                "btc/usd" => st.chainlink = Some(price),
                "btcusdt" => st.binance = Some(price),
                _ => return,
            }
            st.last_ts = now_ts;

            let blended = match (st.chainlink, st.binance) {
                (Some(cl), Some(bi)) => 0.4 * cl + 0.6 * bi,
                (Some(cl), None) => cl,
                (None, Some(bi)) => bi,
                (None, None) => return,
            };
            let chainlink = st.chainlink;
            let binance = st.binance;
            st.history.push_back(SpotSample {
                ts: now_ts,
                price: blended,
                chainlink,
                binance,
            });
            while st
                .history
                .front()
                .is_some_and(|s| now_ts - s.ts > HISTORY_SECONDS)
            {
                st.history.pop_front();
            }

            SpotTick {
                chainlink: st.chainlink,
                binance: st.binance,
                ts: now_ts,
                symbol: symbol.to_string(),
            }
        };
        let _ = self.tick_tx.send(tick);
    }

    /// Spawn the websocket reader; reconnects with a fixed backoff.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let feed = self.clone();

        tokio::spawn(async move {
            if Url::parse(&feed.url).is_err() {
                warn!("invalid spot ws url: {}", feed.url);
                return;
            }
            let sub_msg = json!({
                "action": "subscribe",
                "subscriptions": [
                    {
                        "topic": "crypto_prices_chainlink",
                        "type": "*",
                        "filters": "{\"symbol\":\"btc/usd\"}",
                    },
                    {
                        "topic": "crypto_prices",
                        "type": "update",
                        "filters": "{\"symbol\":\"btcusdt\"}",
                    },
                ],
            })
            .to_string();

            loop {
                let conn = tokio::select! {
                    result = connect_async(&feed.url) => result,
                    _ = shutdown.recv() => return,
                };

                match conn {
                    Ok((ws_stream, _)) => {
                        info!("spot ws connected");
                        let (mut write, mut read) = ws_stream.split();
                        if write.send(Message::Text(sub_msg.clone())).await.is_err() {
                            warn!("spot ws subscribe failed");
                        } else {
                            let mut ping =
                                tokio::time::interval(tokio::time::Duration::from_secs(20));
                            ping.tick().await; // immediate first tick
                            loop {
                                tokio::select! {
                                    msg = read.next() => match msg {
                                        Some(Ok(Message::Text(text))) => feed.on_message(&text),
                                        Some(Ok(_)) => {}
                                        Some(Err(e)) => {
                                            warn!("spot ws error: {e}");
                                            break;
                                        }
                                        None => {
                                            warn!("spot ws stream ended");
                                            break;
                                        }
                                    },
                                    _ = ping.tick() => {
                                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                                            break;
                                        }
                                    }
                                    _ = shutdown.recv() => return,
                                }
                            }
                        }
                    }
                    Err(e) => warn!("spot ws connect failed: {e}"),
                }

                tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_BACKOFF_S)).await;
            }
        });
    }

    fn on_message(&self, raw: &str) {
        let Ok(obj) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(payload) = obj.get("payload").and_then(|p| p.as_object()) else {
            return;
        };
        // Snapshot messages arrive as a payload.data list without a symbol.
        if payload.get("data").is_some_and(|d| d.is_array()) {
            return;
        }
        let symbol = payload
            .get("symbol")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_lowercase();
        let Some(price) = payload.get("value").and_then(|v| v.as_f64()) else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.record(&symbol, price, now);
    }
}

/// One-shot secondary-source price probe (coinbase/kraken/bybit), used for
/// impulse when configured. Short timeout; failures return None.
pub async fn fetch_alt_price(http: &reqwest::Client, source: &str) -> Option<f64> {
    let result = match source {
        "coinbase" => {
            let v: Value = http
                .get("https://api.exchange.coinbase.com/products/BTC-USD/ticker")
                .timeout(std::time::Duration::from_millis(1500))
                .send()
                .await
                .ok()?
                .json()
                .await
                .ok()?;
            v.get("price")?.as_str()?.parse::<f64>().ok()
        }
        "kraken" => {
            let v: Value = http
                .get("https://api.kraken.com/0/public/Ticker?pair=XBTUSD")
                .timeout(std::time::Duration::from_millis(1500))
                .send()
                .await
                .ok()?
                .json()
                .await
                .ok()?;
            let result = v.get("result")?.as_object()?;
            let first = result.values().next()?;
            first.get("c")?.get(0)?.as_str()?.parse::<f64>().ok()
        }
        "bybit" => {
            let v: Value = http
                .get("https://api.bybit.com/v5/market/tickers?category=spot&symbol=BTCUSDT")
                .timeout(std::time::Duration::from_millis(1500))
                .send()
                .await
                .ok()?
                .json()
                .await
                .ok()?;
            let list = v.get("result")?.get("list")?.as_array()?;
            list.first()?
                .get("lastPrice")?
                .as_str()?
                .parse::<f64>()
                .ok()
        }
        _ => {
            debug!("unknown alt price source: {source}");
            None
        }
    };
    result.filter(|p| *p > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blending_weights_sources() {
        let feed = Arc::new(SpotFeed::new("wss://example.invalid"));
        feed.record("btc/usd", 65_000.0, 1.0);
        feed.record("btcusdt", 65_100.0, 2.0);
        let window = feed.signal_window();
        assert_eq!(window.len(), 2);
        // First sample: oracle only.
        assert!((window[0].price - 65_000.0).abs() < 1e-9);
        // Second: 0.4 * 65000 + 0.6 * 65100.
        assert!((window[1].price - 65_060.0).abs() < 1e-9);
        assert_eq!(feed.live_prices(), (Some(65_000.0), Some(65_100.0)));
    }

    #[test]
    fn history_window_is_bounded() {
        let feed = Arc::new(SpotFeed::new("wss://example.invalid"));
        feed.record("btcusdt", 65_000.0, 0.0);
        feed.record("btcusdt", 65_010.0, 800.0);
        let window = feed.signal_window();
        assert_eq!(window.len(), 1);
        assert!((window[0].price - 65_010.0).abs() < 1e-9);
    }

    #[test]
    fn price_near_ts_respects_max_delta() {
        let feed = Arc::new(SpotFeed::new("wss://example.invalid"));
        feed.record("btcusdt", 65_000.0, 100.0);
        feed.record("btcusdt", 65_050.0, 200.0);
        assert!((feed.price_near_ts(110.0, 60.0).unwrap() - 65_000.0).abs() < 1e-9);
        assert!(feed.price_near_ts(500.0, 60.0).is_none());
    }

    #[test]
    fn parse_stream_payloads() {
        let feed = Arc::new(SpotFeed::new("wss://example.invalid"));
        feed.on_message(r#"{"payload":{"symbol":"BTC/USD","value":64950.5}}"#);
        feed.on_message(r#"{"payload":{"symbol":"btcusdt","value":64980.25}}"#);
        // Snapshot lists and junk are ignored.
        feed.on_message(r#"{"payload":{"data":[1,2,3]}}"#);
        feed.on_message("not json");
        let (cl, bi) = feed.live_prices();
        assert_eq!(cl, Some(64_950.5));
        assert_eq!(bi, Some(64_980.25));
    }

    #[test]
    fn nonpositive_prices_ignored() {
        let feed = Arc::new(SpotFeed::new("wss://example.invalid"));
        feed.record("btcusdt", 0.0, 1.0);
        assert!(feed.signal_window().is_empty());
    }
}
