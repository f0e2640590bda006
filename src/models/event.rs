use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::forecast::ModelStats;
use super::market::TradeSide;
use super::position::CloseReason;

/// Paper/live trade lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "PARTIAL_CLOSE")]
    PartialClose,
    #[serde(rename = "CLOSE_PENDING")]
    ClosePending,
    #[serde(rename = "OPEN_SUBMIT")]
    OpenSubmit,
    #[serde(rename = "CLOSE_SUBMIT")]
    CloseSubmit,
    #[serde(rename = "PARTIAL_CLOSE_SUBMIT")]
    PartialCloseSubmit,
}

/// One sub-1.00 ask-sum observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityItem {
    pub market_id: String,
    pub market_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ask_yes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ask_no: Option<f64>,
    pub ask_sum_no_fees: f64,
}

/// Pending limit-close progress attached to trade events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseMeta {
    pub wait_s: f64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
}

/// Payload of `paper_trade` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTradeEvent {
    pub action: TradeAction,
    pub market_id: String,
    pub market_name: String,
    pub side: TradeSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_open: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_close: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_execution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_execution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_meta: Option<CloseMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_side: Option<TradeSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_hit_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impulse_bps_3s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_yes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_no: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_edge: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opp_edge: Option<f64>,
}

impl PaperTradeEvent {
    pub fn new(action: TradeAction, market_id: &str, market_name: &str, side: TradeSide) -> Self {
        Self {
            action,
            market_id: market_id.to_string(),
            market_name: market_name.to_string(),
            side,
            reason: None,
            fraction: None,
            size_usd: None,
            entry_price: None,
            exit_price: None,
            opened_at: None,
            closed_at: None,
            pnl_usd: None,
            model: None,
            model_open: None,
            model_close: None,
            open_execution: None,
            close_execution: None,
            close_meta: None,
            live_order_id: None,
            confidence: None,
            consensus: None,
            winner_side: None,
            winner_stability: None,
            p_hit_target: None,
            impulse_bps_3s: None,
            edge_yes: None,
            edge_no: None,
            held_edge: None,
            opp_edge: None,
        }
    }
}

/// Payload of `live_trade` events (order submit outcomes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveTradeEvent {
    pub action: TradeAction,
    pub market_id: String,
    pub market_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub side: TradeSide,
    pub price: f64,
    pub qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_execution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_execution: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-row strategy evaluation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshotEvent {
    pub market_id: String,
    pub side: TradeSide,
    pub winner_side: TradeSide,
    pub distance_bps: f64,
    pub reversal_belief: bool,
    pub winner_stability: f64,
    pub p_hit_target: f64,
    pub confidence: u8,
    pub consensus: u8,
    pub best_model: String,
    pub edge_yes: f64,
    pub edge_no: f64,
    pub open_positions: usize,
    pub flip_fail_streak: u32,
    pub market_locked: bool,
    pub recent_losing_buy_no: bool,
}

/// Guardrail lock/pause notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailEvent {
    pub market_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flip_fail_streak: Option<u32>,
    pub lock_seconds: u64,
    pub lock_until_ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_close_reason: Option<CloseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pnl_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_flip_stop_losses: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

/// The audit surface: every record appended to `events.jsonl` is one of
/// these, serialized with a `type` discriminator and a leading UTC `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MarketScan {
        snapshot_count: usize,
        top_candidates: Value,
    },
    MarketGroups {
        bitcoin: Value,
        secondary: Value,
        secondary_note: String,
        counts: Value,
    },
    OpportunitySeen {
        count: usize,
        items: Vec<OpportunityItem>,
    },
    WsOpportunitySeen {
        count: usize,
        items: Vec<OpportunityItem>,
    },
    WsMarketTick {
        market_id: String,
        market_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        best_ask_yes: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        best_ask_no: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ask_sum_no_fees: Option<f64>,
        ws_asset_id: String,
        ws_ts: f64,
    },
    WsUsage {
        enabled: bool,
        updates_applied: u32,
        asset_count: usize,
        tracked_count: usize,
        last_msg_ts: f64,
        alive: bool,
    },
    ApiUsage {
        gamma_calls: u64,
        clob_calls: u64,
        total_calls: u64,
        snapshot_count: usize,
    },
    MarketRadar {
        count: usize,
        top: Value,
    },
    InefficiencyReport {
        count: usize,
        top: Value,
    },
    FlowWatch {
        count: usize,
        top: Value,
    },
    StrategySnapshot(StrategySnapshotEvent),
    PaperTrade(PaperTradeEvent),
    LiveTrade(LiveTradeEvent),
    ModelStats {
        stats: ModelStats,
    },
    MarketGuardrail(GuardrailEvent),
    BtcTargetMissing {
        market_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_start_time: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_date: Option<String>,
    },
    AdapterError {
        source: String,
        error: String,
    },
    LoopError {
        error: String,
    },
    FocusFallback {
        reason: String,
        selected_market_ids: Vec<String>,
    },
    BtcPriceTick {
        #[serde(skip_serializing_if = "Option::is_none")]
        chainlink: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        binance: Option<f64>,
        ts: f64,
        symbol: String,
    },
    MarketScanEmpty {
        reason: String,
        focus_keywords: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_carries_type_discriminator() {
        let ev = Event::LoopError {
            error: "boom".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "loop_error");
        assert_eq!(v["error"], "boom");
    }

    #[test]
    fn paper_trade_skips_empty_fields() {
        let ev = Event::PaperTrade(PaperTradeEvent::new(
            TradeAction::Open,
            "m1",
            "Bitcoin Up or Down",
            TradeSide::BuyYes,
        ));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "paper_trade");
        assert_eq!(v["action"], "OPEN");
        assert_eq!(v["side"], "BUY_YES");
        assert!(v.get("exit_price").is_none());
    }

    #[test]
    fn trade_action_names() {
        assert_eq!(
            serde_json::to_string(&TradeAction::PartialClose).unwrap(),
            "\"PARTIAL_CLOSE\""
        );
        assert_eq!(
            serde_json::to_string(&TradeAction::ClosePending).unwrap(),
            "\"CLOSE_PENDING\""
        );
    }
}
