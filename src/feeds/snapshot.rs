use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::ScoringConfig;
use crate::models::market::{BookLevel, MarketRef, MarketRow, MarketSnapshot, RowSignal};

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

impl RawLevel {
    fn level(&self) -> BookLevel {
        BookLevel {
            price: self.price.parse().unwrap_or(0.0),
            size: self.size.parse().unwrap_or(0.0),
        }
    }
}

fn best_ask(levels: &[BookLevel]) -> f64 {
    let min = levels
        .iter()
        .map(|l| l.price)
        .filter(|p| *p > 0.0)
        .fold(f64::INFINITY, f64::min);
    if min.is_finite() {
        min
    } else {
        0.0
    }
}

fn best_bid(levels: &[BookLevel]) -> f64 {
    levels
        .iter()
        .map(|l| l.price)
        .filter(|p| *p > 0.0)
        .fold(0.0, f64::max)
}

fn depth_usd(levels: &[BookLevel], n: usize) -> f64 {
    levels.iter().take(n).map(|l| l.price * l.size).sum()
}

/// REST order-book snapshot fetcher (C4's input side).
pub struct SnapshotClient {
    base_url: String,
    http: reqwest::Client,
    calls: AtomicU64,
}

impl SnapshotClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(std::time::Duration::from_secs(15))
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

    async fn fetch_book_sides(&self, token_id: &str) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/book", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let raw: RawBook = resp.json().await.ok()?;
        Some((
            raw.bids.iter().map(RawLevel::level).collect(),
            raw.asks.iter().map(RawLevel::level).collect(),
        ))
    }

    /// Compose snapshots for every ref. Books that fail to fetch, have a
    /// zero side, or look dead (near-1 asks, near-0 bids, tiny depth) are
    /// dropped.
    pub async fn fetch_snapshots(&self, refs: &[MarketRef]) -> Vec<MarketSnapshot> {
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            let Some((yes_bids, yes_asks)) = self.fetch_book_sides(&r.yes_token).await else {
                debug!("no yes book for {}", r.market_id);
                continue;
            };
            let Some((no_bids, no_asks)) = self.fetch_book_sides(&r.no_token).await else {
                debug!("no no book for {}", r.market_id);
                continue;
            };
            if let Some(s) = compose_snapshot(r, yes_bids, yes_asks, no_bids, no_asks) {
                out.push(s);
            }
        }
        out
    }
}

/// Build one snapshot from raw book sides, applying the zero-side and
/// dead-book filters.
pub fn compose_snapshot(
    r: &MarketRef,
    yes_bids: Vec<BookLevel>,
    yes_asks: Vec<BookLevel>,
    no_bids: Vec<BookLevel>,
    no_asks: Vec<BookLevel>,
) -> Option<MarketSnapshot> {
    let yes_bid = best_bid(&yes_bids);
    let yes_ask = best_ask(&yes_asks);
    let no_bid = best_bid(&no_bids);
    let no_ask = best_ask(&no_asks);

    if yes_ask <= 0.0 || no_ask <= 0.0 {
        return None;
    }
    // A crossed book is stale or garbage data, never a tradable state.
    if yes_bid > yes_ask || no_bid > no_ask {
        return None;
    }

    // Keep thin-but-real books visible; drop only truly dead ones.
    let top3_depth = depth_usd(&yes_bids, 3) + depth_usd(&no_bids, 3);
    if yes_ask >= 0.985 && no_ask >= 0.985 && yes_bid <= 0.015 && no_bid <= 0.015 && top3_depth < 25.0
    {
        return None;
    }

    let depth = depth_usd(&yes_bids, 5) + depth_usd(&no_bids, 5);

    Some(MarketSnapshot {
        market_id: r.market_id.clone(),
        token_id: r.yes_token.clone(),
        question: r.question.clone(),
        yes_bid,
        yes_ask,
        no_bid,
        no_ask,
        depth_usd: depth.max(r.liquidity_hint),
        accepting_orders: r.accepting_orders,
        yes_hint: r.yes_price_hint,
        no_hint: r.no_price_hint,
        yes_asks: yes_asks.into_iter().take(12).collect(),
        no_asks: no_asks.into_iter().take(12).collect(),
    })
}

/// Derive the per-cycle row for one snapshot. Signal classification is
/// strict (`< 1.0`); opportunity emission elsewhere uses `<= 1.0`.
pub fn build_row(s: &MarketSnapshot, r: Option<&MarketRef>, scoring: &ScoringConfig) -> MarketRow {
    let ask_sum_no_fees = s.yes_ask + s.no_ask;
    let ask_sum_with_fees =
        ask_sum_no_fees + (scoring.fee_bps + scoring.slippage_bps) / 10_000.0;
    let signal = if ask_sum_with_fees < 1.0 {
        RowSignal::Opportunity
    } else if ask_sum_no_fees < 1.0 {
        RowSignal::Watch
    } else {
        RowSignal::NoOpportunity
    };

    let spread_sum = (s.yes_ask - s.yes_bid) + (s.no_ask - s.no_bid);
    let quality_score = (s.depth_usd + 1.0) / (spread_sum + 0.01).max(0.01);

    MarketRow {
        market_id: s.market_id.clone(),
        market_name: s.question.clone(),
        slug: r.map(|r| r.slug.clone()).unwrap_or_default(),
        best_bid_yes: s.yes_bid,
        best_bid_no: s.no_bid,
        best_ask_yes: s.yes_ask,
        best_ask_no: s.no_ask,
        ask_sum_no_fees,
        ask_sum_with_fees,
        signal,
        depth_usd: s.depth_usd,
        spread_sum,
        quality_score,
        end_ts: r.and_then(|r| r.end_ts()),
        t_left_s: None,
        btc_target: None,
        btc_current: None,
        btc_current_binance: None,
        btc_price_source: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mref() -> MarketRef {
        MarketRef {
            market_id: "m1".into(),
            question: "Bitcoin Up or Down".into(),
            slug: "btc-updown-15m-1".into(),
            yes_token: "y".into(),
            no_token: "n".into(),
            accepting_orders: true,
            liquidity_hint: 0.0,
            yes_price_hint: 0.0,
            no_price_hint: 0.0,
            end_time: None,
            event_start_time: None,
            resolution_source: String::new(),
        }
    }

    fn lv(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    #[test]
    fn arb_display_row_classifies_opportunity() {
        // yes_ask 0.52, no_ask 0.47, fee 50bps + slip 25bps.
        let s = compose_snapshot(
            &mref(),
            vec![lv(0.50, 100.0)],
            vec![lv(0.52, 100.0)],
            vec![lv(0.45, 100.0)],
            vec![lv(0.47, 100.0)],
        )
        .unwrap();
        let row = build_row(&s, Some(&mref()), &ScoringConfig::default());
        assert!((row.ask_sum_no_fees - 0.99).abs() < 1e-9);
        assert!((row.ask_sum_with_fees - 0.9975).abs() < 1e-9);
        assert_eq!(row.signal, RowSignal::Opportunity);
    }

    #[test]
    fn watch_and_no_opportunity_bands() {
        let s = compose_snapshot(
            &mref(),
            vec![lv(0.49, 100.0)],
            vec![lv(0.51, 100.0)],
            vec![lv(0.46, 100.0)],
            vec![lv(0.485, 100.0)],
        )
        .unwrap();
        // sum = 0.995, with fees 1.0025 → WATCH.
        let row = build_row(&s, None, &ScoringConfig::default());
        assert_eq!(row.signal, RowSignal::Watch);

        let s = compose_snapshot(
            &mref(),
            vec![lv(0.50, 100.0)],
            vec![lv(0.54, 100.0)],
            vec![lv(0.46, 100.0)],
            vec![lv(0.50, 100.0)],
        )
        .unwrap();
        let row = build_row(&s, None, &ScoringConfig::default());
        assert_eq!(row.signal, RowSignal::NoOpportunity);
    }

    #[test]
    fn zero_side_drops_snapshot() {
        assert!(compose_snapshot(
            &mref(),
            vec![lv(0.50, 100.0)],
            vec![], // no asks
            vec![lv(0.45, 100.0)],
            vec![lv(0.47, 100.0)],
        )
        .is_none());
    }

    #[test]
    fn dead_book_is_filtered() {
        // Near-1 asks, near-0 bids, tiny depth.
        assert!(compose_snapshot(
            &mref(),
            vec![lv(0.01, 10.0)],
            vec![lv(0.99, 10.0)],
            vec![lv(0.01, 10.0)],
            vec![lv(0.99, 10.0)],
        )
        .is_none());

        // Same prices but real depth behind the bids survive.
        assert!(compose_snapshot(
            &mref(),
            vec![lv(0.01, 5000.0)],
            vec![lv(0.99, 10.0)],
            vec![lv(0.01, 5000.0)],
            vec![lv(0.99, 10.0)],
        )
        .is_some());
    }

    #[test]
    fn crossed_book_is_dropped() {
        assert!(compose_snapshot(
            &mref(),
            vec![lv(0.55, 100.0)], // bid above ask
            vec![lv(0.50, 100.0)],
            vec![lv(0.45, 100.0)],
            vec![lv(0.47, 100.0)],
        )
        .is_none());
    }

    #[test]
    fn best_levels_ignore_nonpositive_prices() {
        let asks = vec![lv(0.0, 5.0), lv(0.55, 5.0), lv(0.52, 5.0)];
        assert!((best_ask(&asks) - 0.52).abs() < 1e-9);
        let bids = vec![lv(0.0, 5.0), lv(0.41, 5.0), lv(0.45, 5.0)];
        assert!((best_bid(&bids) - 0.45).abs() < 1e-9);
    }
}
