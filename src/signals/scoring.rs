use serde::Serialize;

use crate::config::ScoringConfig;
use crate::models::market::{BookLevel, MarketSnapshot, TradeSide};

/// A ranked buy candidate for one side of one market.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub market_id: String,
    pub side: TradeSide,
    pub edge_bps: f64,
    pub expected_price: f64,
    pub size_usd: f64,
}

/// Average fill price for buying `target_size_usd` notional off an ask
/// ladder. Unfilled tail is punished at the fallback price so thin books
/// rank worse than their top-of-book suggests.
fn bookwalk_buy_price(asks: &[BookLevel], target_size_usd: f64, fallback_price: f64) -> f64 {
    let mut remaining = target_size_usd.max(0.0);
    let mut total_cost = 0.0;
    let mut total_qty = 0.0;

    for lvl in asks {
        if lvl.price <= 0.0 || lvl.size <= 0.0 {
            continue;
        }
        let lvl_notional = lvl.price * lvl.size;
        let take_notional = remaining.min(lvl_notional);
        total_cost += take_notional;
        total_qty += take_notional / lvl.price;
        remaining -= take_notional;
        if remaining <= 1e-9 {
            break;
        }
    }

    if total_qty <= 0.0 {
        return if fallback_price > 0.0 { fallback_price } else { 1.0 };
    }

    if remaining > 0.0 {
        let fallback = if fallback_price > 0.0 { fallback_price } else { 1.0 };
        total_cost += remaining;
        total_qty += remaining / fallback.max(1e-6);
    }

    (total_cost / total_qty.max(1e-9)).clamp(0.0, 1.0)
}

/// Top-of-book buy prices for each side, taking the cheaper of the direct
/// ask and the parity route (1 − opposite bid).
pub fn effective_buy_prices(s: &MarketSnapshot) -> (f64, f64) {
    let yes_direct = if s.yes_ask > 0.0 { s.yes_ask } else { 1.0 };
    let no_direct = if s.no_ask > 0.0 { s.no_ask } else { 1.0 };
    let yes_via_parity = if s.no_bid > 0.0 { 1.0 - s.no_bid } else { 1.0 };
    let no_via_parity = if s.yes_bid > 0.0 { 1.0 - s.yes_bid } else { 1.0 };
    (
        yes_direct.min(yes_via_parity).clamp(0.0, 1.0),
        no_direct.min(no_via_parity).clamp(0.0, 1.0),
    )
}

/// Depth-aware executable buy prices for `target_size_usd`, floored by the
/// parity alternative.
pub fn depth_aware_buy_prices(s: &MarketSnapshot, target_size_usd: f64) -> (f64, f64) {
    let (yes_top, no_top) = effective_buy_prices(s);

    let yes_book = bookwalk_buy_price(&s.yes_asks, target_size_usd, yes_top);
    let no_book = bookwalk_buy_price(&s.no_asks, target_size_usd, no_top);

    let yes_via_parity = if s.no_bid > 0.0 { 1.0 - s.no_bid } else { 1.0 };
    let no_via_parity = if s.yes_bid > 0.0 { 1.0 - s.yes_bid } else { 1.0 };

    (
        yes_book.min(yes_via_parity).clamp(0.0, 1.0),
        no_book.min(no_via_parity).clamp(0.0, 1.0),
    )
}

/// Rank both sides of every snapshot by fee-adjusted edge against 0.50.
pub fn rank_candidates(snapshots: &[MarketSnapshot], scoring: &ScoringConfig) -> Vec<Opportunity> {
    let mut out = Vec::with_capacity(snapshots.len() * 2);

    for s in snapshots {
        if !s.accepting_orders {
            continue;
        }
        let (yes_buy, no_buy) = depth_aware_buy_prices(s, scoring.target_size_usd);

        let edge_yes_bps = (0.5 - yes_buy) * 10_000.0 - scoring.fee_bps - scoring.slippage_bps;
        let edge_no_bps = (0.5 - no_buy) * 10_000.0 - scoring.fee_bps - scoring.slippage_bps;

        let base_size = (s.depth_usd * 0.005).clamp(10.0, 50.0);
        out.push(Opportunity {
            market_id: s.market_id.clone(),
            side: TradeSide::BuyYes,
            edge_bps: edge_yes_bps,
            expected_price: yes_buy,
            size_usd: base_size,
        });
        out.push(Opportunity {
            market_id: s.market_id.clone(),
            side: TradeSide::BuyNo,
            edge_bps: edge_no_bps,
            expected_price: no_buy,
            size_usd: base_size,
        });
    }

    out.sort_by(|a, b| b.edge_bps.total_cmp(&a.edge_bps));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            market_id: "m1".into(),
            token_id: "y".into(),
            question: "q".into(),
            yes_bid: 0.47,
            yes_ask: 0.49,
            no_bid: 0.49,
            no_ask: 0.53,
            depth_usd: 3000.0,
            accepting_orders: true,
            yes_hint: 0.0,
            no_hint: 0.0,
            yes_asks: vec![
                BookLevel { price: 0.49, size: 20.0 },
                BookLevel { price: 0.52, size: 100.0 },
            ],
            no_asks: vec![BookLevel { price: 0.53, size: 200.0 }],
        }
    }

    #[test]
    fn parity_route_floors_buy_price() {
        let mut s = snapshot();
        s.no_bid = 0.60; // 1 - 0.60 = 0.40 beats the 0.49 direct ask
        let (yes_buy, _) = effective_buy_prices(&s);
        assert!((yes_buy - 0.40).abs() < 1e-9);
    }

    #[test]
    fn bookwalk_averages_through_levels() {
        let s = snapshot();
        // $20 fills fully inside the 0.49 level: avg price stays 0.49.
        let (yes_buy, _) = depth_aware_buy_prices(&s, 9.0);
        assert!((yes_buy - 0.49).abs() < 1e-6);
        // Larger size walks into the 0.52 level and the average rises.
        let (yes_big, _) = depth_aware_buy_prices(&s, 30.0);
        assert!(yes_big > 0.49);
        assert!(yes_big < 0.52 + 1e-9);
    }

    #[test]
    fn ranked_desc_by_edge() {
        let scoring = ScoringConfig::default();
        let ranked = rank_candidates(&[snapshot()], &scoring);
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].edge_bps >= ranked[1].edge_bps);
    }

    #[test]
    fn non_accepting_skipped() {
        let mut s = snapshot();
        s.accepting_orders = false;
        assert!(rank_candidates(&[s], &ScoringConfig::default()).is_empty());
    }
}
