use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::market::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Every reason a position can be closed. First matching rule wins, in the
/// order these are evaluated by the strategy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "resolved_win_proxy")]
    ResolvedWinProxy,
    #[serde(rename = "resolved_loss_proxy")]
    ResolvedLossProxy,
    #[serde(rename = "hard_stop_25")]
    HardStop25,
    #[serde(rename = "flip_stop")]
    FlipStop,
    #[serde(rename = "scalp_take_quick")]
    ScalpTakeQuick,
    #[serde(rename = "scalp_timeout")]
    ScalpTimeout,
    #[serde(rename = "scalp_edge_faded")]
    ScalpEdgeFaded,
    #[serde(rename = "edge_flip_wrong_way")]
    EdgeFlipWrongWay,
    #[serde(rename = "edge_decay_stop")]
    EdgeDecayStop,
    #[serde(rename = "edge_trailing_stop")]
    EdgeTrailingStop,
    #[serde(rename = "against_winner_no_reversal")]
    AgainstWinnerNoReversal,
    #[serde(rename = "time_lt_45s")]
    TimeLt45s,
    #[serde(rename = "time_lt_90s_bank")]
    TimeLt90sBank,
    #[serde(rename = "time_lt_180s_low_conf")]
    TimeLt180sLowConf,
    #[serde(rename = "tp_50")]
    Tp50,
    #[serde(rename = "tp_35_half")]
    Tp35Half,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ResolvedWinProxy => "resolved_win_proxy",
            CloseReason::ResolvedLossProxy => "resolved_loss_proxy",
            CloseReason::HardStop25 => "hard_stop_25",
            CloseReason::FlipStop => "flip_stop",
            CloseReason::ScalpTakeQuick => "scalp_take_quick",
            CloseReason::ScalpTimeout => "scalp_timeout",
            CloseReason::ScalpEdgeFaded => "scalp_edge_faded",
            CloseReason::EdgeFlipWrongWay => "edge_flip_wrong_way",
            CloseReason::EdgeDecayStop => "edge_decay_stop",
            CloseReason::EdgeTrailingStop => "edge_trailing_stop",
            CloseReason::AgainstWinnerNoReversal => "against_winner_no_reversal",
            CloseReason::TimeLt45s => "time_lt_45s",
            CloseReason::TimeLt90sBank => "time_lt_90s_bank",
            CloseReason::TimeLt180sLowConf => "time_lt_180s_low_conf",
            CloseReason::Tp50 => "tp_50",
            CloseReason::Tp35Half => "tp_35_half",
        }
    }

    /// Reasons that re-enter through the longer flip cooldown.
    pub fn is_flip_like(&self) -> bool {
        matches!(
            self,
            CloseReason::EdgeFlipWrongWay | CloseReason::EdgeDecayStop | CloseReason::FlipStop
        )
    }

    /// Winning reasons that reset the flip-fail streak when pnl > 0.
    pub fn is_streak_reset(&self) -> bool {
        matches!(
            self,
            CloseReason::EdgeTrailingStop
                | CloseReason::Tp50
                | CloseReason::Tp35Half
                | CloseReason::TimeLt90sBank
                | CloseReason::ResolvedWinProxy
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paper (or live-mirrored) position from OPEN to CLOSED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub market_id: String,
    pub market_name: String,
    pub side: TradeSide,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub qty: f64,
    pub notional_usd: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_usd: Option<f64>,
    pub model_open: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_close: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    pub edge_entry: f64,
    pub edge_peak: f64,
    #[serde(default)]
    pub tp35_taken: bool,
}

impl Position {
    /// Scalp entries are tagged `SCALP:{source}:{side}:{bps}bps` and exit
    /// through the fast scalp rules.
    pub fn is_scalp(&self) -> bool {
        self.model_open.starts_with("SCALP:")
    }

    pub fn held_seconds(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.opened_at).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}
