use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use crate::models::market::MarketRef;

const TICK_HISTORY_CAP: usize = 5000;
const TICK_EMIT_MIN_INTERVAL_S: f64 = 0.25;
const READ_TIMEOUT_S: u64 = 5;
const PING_INTERVAL_S: u64 = 20;
const RECONNECT_BACKOFF_S: u64 = 2;

/// Throttled per-market tick pushed to downstream consumers.
#[derive(Debug, Clone)]
pub struct BookTick {
    pub market_id: String,
    pub market_name: String,
    pub best_ask_yes: Option<f64>,
    pub best_ask_no: Option<f64>,
    pub ask_sum_no_fees: Option<f64>,
    pub ws_asset_id: String,
    pub ws_ts: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct WsStats {
    pub asset_count: usize,
    pub tracked_count: usize,
    pub last_msg_ts: f64,
    pub alive: bool,
}

/// Per-market stream activity over a trailing window.
#[derive(Debug, Clone, Copy)]
pub struct BookMetrics {
    pub updates_per_min: f64,
    pub ask_volatility: f64,
    pub last_sum: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Quote {
    bid: Option<f64>,
    ask: Option<f64>,
}

#[derive(Debug, Clone)]
struct TokenMeta {
    market_id: String,
    market_name: String,
    yes_token: String,
    no_token: String,
}

#[derive(Debug, Clone, Copy)]
struct TickEntry {
    ts: f64,
    yes_ask: Option<f64>,
    no_ask: Option<f64>,
    sum: Option<f64>,
}

#[derive(Default)]
struct BookState {
    assets: HashSet<String>,
    needs_subscribe: bool,
    best: HashMap<String, Quote>,
    meta: HashMap<String, TokenMeta>,
    history: HashMap<String, VecDeque<TickEntry>>,
    last_emit: HashMap<String, f64>,
    last_msg_ts: f64,
}

fn num(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Exchange order-book stream: best bid/ask per asset token plus a bounded
/// per-market tick history. The reader task holds the lock only for short
/// map updates; consumers copy values out.
pub struct BookFeed {
    url: String,
    state: Arc<Mutex<BookState>>,
    notify: Arc<Notify>,
    tick_tx: broadcast::Sender<BookTick>,
}

impl BookFeed {
    pub fn new(url: &str) -> Self {
        let (tick_tx, _) = broadcast::channel(1024);
        Self {
            url: url.to_string(),
            state: Arc::new(Mutex::new(BookState::default())),
            notify: Arc::new(Notify::new()),
            tick_tx,
        }
    }

    /// Queue additional asset subscriptions; idempotent.
    pub fn subscribe_assets<I, S>(&self, asset_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut st = self.state.lock();
        for a in asset_ids {
            let a = a.into();
            if !a.is_empty() && st.assets.insert(a) {
                st.needs_subscribe = true;
            }
        }
    }

    /// Map tokens back to their market so ticks carry market identity.
    pub fn set_token_meta(&self, refs: &[MarketRef]) {
        let mut st = self.state.lock();
        for r in refs {
            let meta = TokenMeta {
                market_id: r.market_id.clone(),
                market_name: r.question.clone(),
                yes_token: r.yes_token.clone(),
                no_token: r.no_token.clone(),
            };
            if !r.yes_token.is_empty() {
                st.meta.insert(r.yes_token.clone(), meta.clone());
            }
            if !r.no_token.is_empty() {
                st.meta.insert(r.no_token.clone(), meta.clone());
            }
        }
    }

    pub fn get_best(&self, asset_id: &str) -> (Option<f64>, Option<f64>) {
        let st = self.state.lock();
        match st.best.get(asset_id) {
            Some(q) => (q.bid, q.ask),
            None => (None, None),
        }
    }

    pub fn stats(&self) -> WsStats {
        let st = self.state.lock();
        WsStats {
            asset_count: st.assets.len(),
            tracked_count: st.best.len(),
            last_msg_ts: st.last_msg_ts,
            alive: true,
        }
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<BookTick> {
        self.tick_tx.subscribe()
    }

    /// Block until a stream message newer than `after_ts` arrives (or the
    /// timeout passes); returns the latest message timestamp either way.
    /// This is the scheduler's event-driven wake.
    pub async fn wait_for_update(&self, after_ts: f64, timeout: std::time::Duration) -> f64 {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let st = self.state.lock();
            if st.last_msg_ts > after_ts {
                return st.last_msg_ts;
            }
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.state.lock().last_msg_ts
    }

    /// Per-market update rate and ask range over the trailing window.
    pub fn market_metrics(&self, window_seconds: u64) -> HashMap<String, BookMetrics> {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let window = window_seconds.max(1) as f64;
        let mut st = self.state.lock();
        let mut out = HashMap::new();

        for (market_id, dq) in st.history.iter_mut() {
            while dq.front().is_some_and(|e| now - e.ts > window) {
                dq.pop_front();
            }
            if dq.is_empty() {
                continue;
            }
            let range = |get: fn(&TickEntry) -> Option<f64>| -> f64 {
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for e in dq.iter() {
                    if let Some(v) = get(e) {
                        min = min.min(v);
                        max = max.max(v);
                    }
                }
                if max >= min {
                    max - min
                } else {
                    0.0
                }
            };
            let yes_vol = range(|e| e.yes_ask);
            let no_vol = range(|e| e.no_ask);
            let last_sum = dq.iter().rev().find_map(|e| e.sum);

            out.insert(
                market_id.clone(),
                BookMetrics {
                    updates_per_min: dq.len() as f64 * 60.0 / window,
                    ask_volatility: yes_vol + no_vol,
                    last_sum,
                    samples: dq.len(),
                },
            );
        }
        out
    }

    /// Spawn the websocket reader. Reconnects re-send the full
    /// subscription set, so no already-processed update is reordered.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let feed = self.clone();

        tokio::spawn(async move {
            if Url::parse(&feed.url).is_err() {
                warn!("invalid book ws url: {}", feed.url);
                return;
            }
            loop {
                let conn = tokio::select! {
                    result = connect_async(&feed.url) => result,
                    _ = shutdown.recv() => return,
                };

                match conn {
                    Ok((ws_stream, _)) => {
                        info!("book ws connected");
                        let (mut write, mut read) = ws_stream.split();

                        if let Some(payload) = feed.subscribe_payload(true) {
                            let _ = write.send(Message::Text(payload)).await;
                        }

                        let mut ping =
                            tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_S));
                        ping.tick().await;

                        loop {
                            tokio::select! {
                                msg = tokio::time::timeout(
                                    std::time::Duration::from_secs(READ_TIMEOUT_S),
                                    read.next(),
                                ) => match msg {
                                    Ok(Some(Ok(Message::Text(text)))) => feed.on_message(&text),
                                    Ok(Some(Ok(_))) => {}
                                    Ok(Some(Err(e))) => {
                                        warn!("book ws error: {e}");
                                        break;
                                    }
                                    Ok(None) => {
                                        warn!("book ws stream ended");
                                        break;
                                    }
                                    // Idle read window; fall through to the
                                    // subscribe check below.
                                    Err(_) => {}
                                },
                                _ = ping.tick() => {
                                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                                        break;
                                    }
                                }
                                _ = shutdown.recv() => return,
                            }

                            if feed.take_subscribe_flag() {
                                if let Some(payload) = feed.subscribe_payload(false) {
                                    let _ = write.send(Message::Text(payload)).await;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("book ws connect failed: {e}"),
                }

                tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_BACKOFF_S)).await;
            }
        });
    }

    fn subscribe_payload(&self, full: bool) -> Option<String> {
        let st = self.state.lock();
        if st.assets.is_empty() {
            return None;
        }
        let assets: Vec<&String> = st.assets.iter().collect();
        let mut payload = json!({
            "assets_ids": assets,
            "custom_feature_enabled": true,
        });
        if full {
            payload["type"] = json!("MARKET");
        } else {
            payload["operation"] = json!("subscribe");
        }
        Some(payload.to_string())
    }

    fn take_subscribe_flag(&self) -> bool {
        let mut st = self.state.lock();
        std::mem::take(&mut st.needs_subscribe)
    }

    pub(crate) fn on_message(&self, raw: &str) {
        let Ok(obj) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        {
            let mut st = self.state.lock();
            st.last_msg_ts = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        }
        self.notify.notify_waiters();

        let items: Vec<&Value> = match &obj {
            Value::Array(arr) => arr.iter().collect(),
            other => vec![other],
        };
        for it in items {
            let Some(event_type) = it.get("event_type").and_then(|v| v.as_str()) else {
                continue;
            };
            match event_type.to_lowercase().as_str() {
                "best_bid_ask" => {
                    let aid = it.get("asset_id").and_then(|v| v.as_str()).unwrap_or("");
                    self.store(aid, num(it.get("best_bid")), num(it.get("best_ask")));
                }
                "book" => {
                    let aid = it.get("asset_id").and_then(|v| v.as_str()).unwrap_or("");
                    let empty = Vec::new();
                    let bids = it
                        .get("bids")
                        .or_else(|| it.get("buys"))
                        .and_then(|v| v.as_array())
                        .unwrap_or(&empty);
                    let asks = it
                        .get("asks")
                        .or_else(|| it.get("sells"))
                        .and_then(|v| v.as_array())
                        .unwrap_or(&empty);
                    let bid = bids
                        .iter()
                        .map(|l| num(l.get("price")))
                        .filter(|p| *p > 0.0)
                        .fold(0.0, f64::max);
                    let ask = asks
                        .iter()
                        .map(|l| num(l.get("price")))
                        .filter(|p| *p > 0.0)
                        .fold(f64::INFINITY, f64::min);
                    let ask = if ask.is_finite() { ask } else { 0.0 };
                    self.store(aid, bid, ask);
                }
                "price_change" => {
                    for ch in it
                        .get("price_changes")
                        .and_then(|v| v.as_array())
                        .map(|a| a.as_slice())
                        .unwrap_or(&[])
                    {
                        let aid = ch.get("asset_id").and_then(|v| v.as_str()).unwrap_or("");
                        self.store(aid, num(ch.get("best_bid")), num(ch.get("best_ask")));
                    }
                }
                _ => {}
            }
        }
    }

    /// Apply one best-quote update; zeros mean "no level" and leave the
    /// previous value in place.
    fn store(&self, asset_id: &str, bid: f64, ask: f64) {
        if asset_id.is_empty() {
            return;
        }
        let tick = {
            let mut st = self.state.lock();
            let q = st.best.entry(asset_id.to_string()).or_default();
            if bid > 0.0 {
                q.bid = Some(bid);
            }
            if ask > 0.0 {
                q.ask = Some(ask);
            }

            let Some(meta) = st.meta.get(asset_id).cloned() else {
                return;
            };
            let yes_ask = st.best.get(&meta.yes_token).and_then(|q| q.ask);
            let no_ask = st.best.get(&meta.no_token).and_then(|q| q.ask);
            let sum = match (yes_ask, no_ask) {
                (Some(y), Some(n)) => Some(y + n),
                _ => None,
            };
            let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

            let dq = st.history.entry(meta.market_id.clone()).or_default();
            if dq.len() >= TICK_HISTORY_CAP {
                dq.pop_front();
            }
            dq.push_back(TickEntry {
                ts: now,
                yes_ask,
                no_ask,
                sum,
            });

            let last = st.last_emit.get(&meta.market_id).copied().unwrap_or(0.0);
            if now - last < TICK_EMIT_MIN_INTERVAL_S {
                return;
            }
            st.last_emit.insert(meta.market_id.clone(), now);
            BookTick {
                market_id: meta.market_id,
                market_name: meta.market_name,
                best_ask_yes: yes_ask,
                best_ask_no: no_ask,
                ask_sum_no_fees: sum,
                ws_asset_id: asset_id.to_string(),
                ws_ts: now,
            }
        };
        let _ = self.tick_tx.send(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_with_market() -> Arc<BookFeed> {
        let feed = Arc::new(BookFeed::new("wss://example.invalid"));
        feed.set_token_meta(&[MarketRef {
            market_id: "m1".into(),
            question: "Bitcoin Up or Down".into(),
            slug: "btc-updown-15m-1".into(),
            yes_token: "yes-tok".into(),
            no_token: "no-tok".into(),
            accepting_orders: true,
            liquidity_hint: 0.0,
            yes_price_hint: 0.0,
            no_price_hint: 0.0,
            end_time: None,
            event_start_time: None,
            resolution_source: String::new(),
        }]);
        feed
    }

    #[test]
    fn best_bid_ask_message_replaces_both() {
        let feed = feed_with_market();
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0.47","best_ask":"0.49"}"#,
        );
        assert_eq!(feed.get_best("yes-tok"), (Some(0.47), Some(0.49)));

        // Zeros leave the previous values alone.
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0","best_ask":"0.48"}"#,
        );
        assert_eq!(feed.get_best("yes-tok"), (Some(0.47), Some(0.48)));
    }

    #[test]
    fn book_message_extracts_best_levels() {
        let feed = feed_with_market();
        feed.on_message(
            r#"{"event_type":"book","asset_id":"yes-tok",
                "bids":[{"price":"0.40","size":"1"},{"price":"0.45","size":"1"},{"price":"0","size":"9"}],
                "asks":[{"price":"0.55","size":"1"},{"price":"0.52","size":"1"}]}"#,
        );
        assert_eq!(feed.get_best("yes-tok"), (Some(0.45), Some(0.52)));
    }

    #[test]
    fn price_change_applies_each_entry() {
        let feed = feed_with_market();
        feed.on_message(
            r#"{"event_type":"price_change","price_changes":[
                {"asset_id":"yes-tok","best_bid":"0.46","best_ask":"0.48"},
                {"asset_id":"no-tok","best_bid":"0.50","best_ask":"0.53"}]}"#,
        );
        assert_eq!(feed.get_best("yes-tok"), (Some(0.46), Some(0.48)));
        assert_eq!(feed.get_best("no-tok"), (Some(0.50), Some(0.53)));
    }

    #[test]
    fn ticks_are_throttled_per_market() {
        let feed = feed_with_market();
        let mut rx = feed.subscribe_ticks();
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0.47","best_ask":"0.49"}"#,
        );
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"no-tok","best_bid":"0.49","best_ask":"0.50"}"#,
        );
        // Both updates land within 250ms: exactly one tick is emitted.
        let first = rx.try_recv().expect("first tick");
        assert_eq!(first.market_id, "m1");
        assert!(rx.try_recv().is_err());

        // History still records every update.
        let metrics = feed.market_metrics(600);
        assert_eq!(metrics.get("m1").unwrap().samples, 2);
    }

    #[test]
    fn metrics_track_ask_range_and_sum() {
        let feed = feed_with_market();
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0.40","best_ask":"0.44"}"#,
        );
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"no-tok","best_bid":"0.50","best_ask":"0.54"}"#,
        );
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0.42","best_ask":"0.50"}"#,
        );
        let metrics = feed.market_metrics(600);
        let m = metrics.get("m1").unwrap();
        // yes range 0.50-0.44 plus no range 0 (single value).
        assert!((m.ask_volatility - 0.06).abs() < 1e-9);
        assert_eq!(m.last_sum, Some(0.50 + 0.54));
        assert_eq!(m.samples, 3);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let feed = feed_with_market();
        feed.subscribe_assets(["a".to_string(), "b".to_string()]);
        assert!(feed.take_subscribe_flag());
        feed.subscribe_assets(["a".to_string()]);
        assert!(!feed.take_subscribe_flag());
        assert_eq!(feed.stats().asset_count, 2);
    }

    #[tokio::test]
    async fn wait_for_update_wakes_on_message() {
        let feed = feed_with_market();
        let waiter = feed.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_update(0.0, std::time::Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        feed.on_message(
            r#"{"event_type":"best_bid_ask","asset_id":"yes-tok","best_bid":"0.47","best_ask":"0.49"}"#,
        );
        let ts = handle.await.unwrap();
        assert!(ts > 0.0);
    }

    #[tokio::test]
    async fn wait_for_update_times_out_quietly() {
        let feed = feed_with_market();
        let ts = feed
            .wait_for_update(0.0, std::time::Duration::from_millis(30))
            .await;
        assert_eq!(ts, 0.0);
    }
}
