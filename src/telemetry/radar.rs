use serde::Serialize;

use crate::models::market::MarketSnapshot;
use crate::signals::scoring::depth_aware_buy_prices;

/// Tradability scoring of everything we can see, best first.
#[derive(Debug, Clone, Serialize)]
pub struct RadarRow {
    pub market_id: String,
    pub market_name: String,
    pub score: f64,
    pub quality: &'static str,
    pub depth_usd: f64,
    pub spread_yes: f64,
    pub spread_no: f64,
    pub yes_mid: f64,
    pub no_mid: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InefficiencyRow {
    pub market_id: String,
    pub market_name: String,
    pub yes_no_exec_sum: f64,
    pub exec_edge_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_no_hint_sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theo_edge_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_gap_bps: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowRow {
    pub market_id: String,
    pub market_name: String,
    pub yes_mid: f64,
    pub no_mid: f64,
    pub mid_imbalance: f64,
    pub tag: &'static str,
}

fn safe_mid(bid: f64, ask: f64) -> f64 {
    if bid > 0.0 && ask > 0.0 {
        (bid + ask) / 2.0
    } else {
        bid.max(ask).max(0.0)
    }
}

pub fn build_market_radar(snapshots: &[MarketSnapshot], limit: usize) -> Vec<RadarRow> {
    let mut rows: Vec<RadarRow> = snapshots
        .iter()
        .map(|s| {
            let spread_yes = (s.yes_ask - s.yes_bid).max(0.0);
            let spread_no = (s.no_ask - s.no_bid).max(0.0);
            let spread_penalty = (spread_yes + spread_no) / 2.0;

            // The 0.98/0.98 style books score near zero on purpose.
            let dead_book_penalty = if spread_yes >= 0.9 && spread_no >= 0.9 {
                55.0
            } else {
                0.0
            };

            let depth_score = (s.depth_usd.max(1.0).log10() * 12.0).min(50.0);
            let tightness_score = (100.0 * (1.0 - spread_penalty)).max(0.0);
            let quality = if dead_book_penalty > 0.0 {
                "dead"
            } else if spread_penalty > 0.2 {
                "weak"
            } else {
                "tradable"
            };

            RadarRow {
                market_id: s.market_id.clone(),
                market_name: s.question.clone(),
                score: depth_score + tightness_score - dead_book_penalty,
                quality,
                depth_usd: s.depth_usd,
                spread_yes,
                spread_no,
                yes_mid: safe_mid(s.yes_bid, s.yes_ask),
                no_mid: safe_mid(s.no_bid, s.no_ask),
            }
        })
        .collect();

    rows.sort_by(|a, b| b.score.total_cmp(&a.score));
    rows.truncate(limit);
    rows
}

pub fn build_inefficiency_report(
    snapshots: &[MarketSnapshot],
    fee_bps: f64,
    slippage_bps: f64,
    target_size_usd: f64,
    limit: usize,
) -> Vec<InefficiencyRow> {
    let mut rows: Vec<InefficiencyRow> = snapshots
        .iter()
        .map(|s| {
            let (yes_buy, no_buy) = depth_aware_buy_prices(s, target_size_usd);
            let exec_sum = yes_buy + no_buy;
            let exec_edge_bps = (1.0 - exec_sum) * 10_000.0 - fee_bps - slippage_bps;

            let (hint_sum, theo_edge_bps) = if s.yes_hint > 0.0 && s.no_hint > 0.0 {
                let hs = s.yes_hint + s.no_hint;
                (
                    Some(hs),
                    Some((1.0 - hs) * 10_000.0 - fee_bps - slippage_bps),
                )
            } else {
                (None, None)
            };

            InefficiencyRow {
                market_id: s.market_id.clone(),
                market_name: s.question.clone(),
                yes_no_exec_sum: exec_sum,
                exec_edge_bps,
                yes_no_hint_sum: hint_sum,
                theo_edge_bps,
                execution_gap_bps: theo_edge_bps.map(|t| t - exec_edge_bps),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        let ga = a.execution_gap_bps.unwrap_or(f64::NEG_INFINITY);
        let gb = b.execution_gap_bps.unwrap_or(f64::NEG_INFINITY);
        gb.total_cmp(&ga)
    });
    rows.truncate(limit);
    rows
}

pub fn build_flow_watch(snapshots: &[MarketSnapshot], limit: usize) -> Vec<FlowRow> {
    let mut rows: Vec<FlowRow> = snapshots
        .iter()
        .map(|s| {
            let yes_mid = safe_mid(s.yes_bid, s.yes_ask);
            let no_mid = safe_mid(s.no_bid, s.no_ask);
            let imbalance = yes_mid - no_mid;
            let tag = if imbalance > 0.03 {
                "yes_pressure"
            } else if imbalance < -0.03 {
                "no_pressure"
            } else {
                "balanced"
            };
            FlowRow {
                market_id: s.market_id.clone(),
                market_name: s.question.clone(),
                yes_mid,
                no_mid,
                mid_imbalance: imbalance,
                tag,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.mid_imbalance.abs().total_cmp(&a.mid_imbalance.abs()));
    rows.truncate(limit);
    rows
}
