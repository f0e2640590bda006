use std::collections::{HashMap, VecDeque};

use crate::execution::bridge::PendingClose;
use crate::models::forecast::ModelStats;
use crate::models::market::TradeSide;
use crate::models::position::CloseReason;

const HISTORY_CAP: usize = 12;

/// One cycle's edge observation for both sides.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSample {
    pub yes: f64,
    pub no: f64,
}

impl EdgeSample {
    pub fn on_side(&self, side: TradeSide) -> f64 {
        match side {
            TradeSide::BuyYes => self.yes,
            TradeSide::BuyNo => self.no,
        }
    }
}

/// Per-market decision memory, process lifetime.
#[derive(Debug, Default)]
pub struct PerMarketMemory {
    pub last_close_ts: f64,
    pub last_close_reason: Option<CloseReason>,
    pub last_close_side: Option<TradeSide>,
    pub last_close_pnl: f64,
    pub flip_fail_streak: u32,
    pub lock_until_ts: f64,
    pub edge_history: VecDeque<EdgeSample>,
    pub winner_history: VecDeque<TradeSide>,
    pub btc_target: Option<f64>,
    pub target_miss_logged_ts: f64,
    pub pending_close: Option<PendingClose>,
}

impl PerMarketMemory {
    pub fn push_edge(&mut self, sample: EdgeSample) {
        if self.edge_history.len() >= HISTORY_CAP {
            self.edge_history.pop_front();
        }
        self.edge_history.push_back(sample);
    }

    pub fn push_winner(&mut self, winner: TradeSide) {
        if self.winner_history.len() >= HISTORY_CAP {
            self.winner_history.pop_front();
        }
        self.winner_history.push_back(winner);
    }

    /// Fraction of recent cycles agreeing with the current winner side.
    pub fn winner_stability(&self, winner: TradeSide) -> f64 {
        if self.winner_history.is_empty() {
            return 0.0;
        }
        let agree = self.winner_history.iter().filter(|w| **w == winner).count();
        agree as f64 / self.winner_history.len() as f64
    }

    /// How many of the last five edge observations were positive on `side`.
    pub fn edge_persistence(&self, side: TradeSide) -> usize {
        self.edge_history
            .iter()
            .rev()
            .take(5)
            .filter(|e| e.on_side(side) > 0.0)
            .count()
    }

    pub fn is_locked(&self, now_ts: f64) -> bool {
        now_ts < self.lock_until_ts
    }

    /// Losing close on the same side within the last half hour.
    pub fn recent_losing_close_on(&self, side: TradeSide, now_ts: f64) -> bool {
        self.last_close_side == Some(side)
            && self.last_close_pnl <= 0.0
            && now_ts - self.last_close_ts < 1800.0
    }
}

/// Process-wide decision memory.
#[derive(Debug, Default)]
pub struct GlobalMemory {
    pub open_pause_until_ts: f64,
    pub recent_flip_stop_losses: Vec<f64>,
    pub model_stats: ModelStats,
}

/// All decision memory, keyed by market id and owned by the engine so a
/// replay with the same inputs is deterministic.
#[derive(Debug, Default)]
pub struct MemoryTable {
    markets: HashMap<String, PerMarketMemory>,
    pub global: GlobalMemory,
}

impl MemoryTable {
    pub fn market(&mut self, market_id: &str) -> &mut PerMarketMemory {
        self.markets.entry(market_id.to_string()).or_default()
    }

    pub fn get(&self, market_id: &str) -> Option<&PerMarketMemory> {
        self.markets.get(market_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histories_are_bounded() {
        let mut mem = PerMarketMemory::default();
        for i in 0..30 {
            mem.push_edge(EdgeSample {
                yes: i as f64,
                no: -(i as f64),
            });
            mem.push_winner(TradeSide::BuyYes);
        }
        assert_eq!(mem.edge_history.len(), HISTORY_CAP);
        assert_eq!(mem.winner_history.len(), HISTORY_CAP);
        // Oldest entries were evicted.
        assert!(mem.edge_history.front().unwrap().yes > 0.0);
    }

    #[test]
    fn stability_counts_agreement() {
        let mut mem = PerMarketMemory::default();
        for _ in 0..3 {
            mem.push_winner(TradeSide::BuyYes);
        }
        mem.push_winner(TradeSide::BuyNo);
        assert!((mem.winner_stability(TradeSide::BuyYes) - 0.75).abs() < 1e-9);
        assert!((mem.winner_stability(TradeSide::BuyNo) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn persistence_looks_at_last_five() {
        let mut mem = PerMarketMemory::default();
        for _ in 0..5 {
            mem.push_edge(EdgeSample { yes: -0.01, no: 0.01 });
        }
        for _ in 0..4 {
            mem.push_edge(EdgeSample { yes: 0.02, no: -0.02 });
        }
        assert_eq!(mem.edge_persistence(TradeSide::BuyYes), 4);
        assert_eq!(mem.edge_persistence(TradeSide::BuyNo), 1);
    }
}
