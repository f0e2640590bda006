use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::models::market::TradeSide;
use crate::models::position::{CloseReason, Position, PositionStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid_price_or_size")]
    InvalidPriceOrSize,
    #[error("position_not_found")]
    PositionNotFound,
}

/// Paper account: cash, open and closed positions, realized P&L.
///
/// All mutation happens on the cycle thread; opens, partials and full
/// closes apply atomically (no partial state on error). Serialized to
/// `state.json` between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub cash_usd: f64,
    pub starting_cash_usd: f64,
    pub positions: Vec<Position>,
    pub closed_positions: Vec<Position>,
    pub realized_pnl_usd: f64,
}

impl Ledger {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            cash_usd: starting_cash,
            starting_cash_usd: starting_cash,
            positions: Vec::new(),
            closed_positions: Vec::new(),
            realized_pnl_usd: 0.0,
        }
    }

    /// Load persisted state; a missing or unreadable file starts fresh.
    pub fn load(path: impl AsRef<Path>, starting_cash: f64) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(e) => {
                    warn!("state file unreadable ({e}), starting fresh ledger");
                    Self::new(starting_cash)
                }
            },
            Err(_) => Self::new(starting_cash),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Open a new position: deducts notional from cash, caps at available
    /// cash. Returns a snapshot of the stored position.
    pub fn open(
        &mut self,
        market_id: &str,
        market_name: &str,
        side: TradeSide,
        entry_price: f64,
        size_usd: f64,
        model: &str,
    ) -> Result<Position, LedgerError> {
        let size = size_usd.min(self.cash_usd);
        if size <= 0.0 || entry_price <= 0.0 {
            return Err(LedgerError::InvalidPriceOrSize);
        }
        let pos = Position {
            id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            market_name: market_name.to_string(),
            side,
            status: PositionStatus::Open,
            entry_price,
            qty: size / entry_price,
            notional_usd: size,
            opened_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            pnl_usd: None,
            model_open: model.to_string(),
            model_close: None,
            close_reason: None,
            edge_entry: 0.0,
            edge_peak: 0.0,
            tp35_taken: false,
        };
        self.cash_usd -= size;
        self.positions.push(pos.clone());
        Ok(pos)
    }

    /// Close `fraction` of a position at `exit_price`; returns realized
    /// P&L for the closed slice. `fraction = 1` performs a full close and
    /// moves the position to the closed list.
    pub fn close_fraction(
        &mut self,
        position_id: Uuid,
        exit_price: f64,
        fraction: f64,
    ) -> Result<(f64, Position), LedgerError> {
        if exit_price <= 0.0 || !(0.0..=1.0).contains(&fraction) || fraction <= 0.0 {
            return Err(LedgerError::InvalidPriceOrSize);
        }
        let idx = self
            .positions
            .iter()
            .position(|p| p.id == position_id)
            .ok_or(LedgerError::PositionNotFound)?;

        if fraction >= 1.0 {
            let mut pos = self.positions.remove(idx);
            let proceeds = pos.qty * exit_price;
            let pnl = proceeds - pos.notional_usd;
            self.cash_usd += proceeds;
            self.realized_pnl_usd += pnl;
            pos.status = PositionStatus::Closed;
            pos.exit_price = Some(exit_price);
            pos.pnl_usd = Some(pos.pnl_usd.unwrap_or(0.0) + pnl);
            pos.closed_at = Some(Utc::now());
            self.closed_positions.push(pos.clone());
            return Ok((pnl, pos));
        }

        let pos = &mut self.positions[idx];
        let close_qty = pos.qty * fraction;
        let proceeds = close_qty * exit_price;
        let pnl = proceeds - pos.notional_usd * fraction;
        pos.qty -= close_qty;
        pos.notional_usd *= 1.0 - fraction;
        pos.pnl_usd = Some(pos.pnl_usd.unwrap_or(0.0) + pnl);
        self.cash_usd += proceeds;
        self.realized_pnl_usd += pnl;
        Ok((pnl, pos.clone()))
    }

    pub fn close(
        &mut self,
        position_id: Uuid,
        exit_price: f64,
    ) -> Result<(f64, Position), LedgerError> {
        self.close_fraction(position_id, exit_price, 1.0)
    }

    pub fn open_position_for(&self, market_id: &str) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.market_id == market_id && p.status == PositionStatus::Open)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Max-update the stored edge peak and return the new value.
    pub fn touch_edge_peak(&mut self, position_id: Uuid, held_edge: f64) -> f64 {
        if let Some(pos) = self.positions.iter_mut().find(|p| p.id == position_id) {
            let base = if pos.edge_peak != 0.0 {
                pos.edge_peak
            } else {
                pos.edge_entry
            };
            pos.edge_peak = base.max(held_edge);
            pos.edge_peak
        } else {
            held_edge
        }
    }

    pub fn set_entry_edge(&mut self, position_id: Uuid, edge: f64) {
        if let Some(pos) = self.positions.iter_mut().find(|p| p.id == position_id) {
            pos.edge_entry = edge;
            pos.edge_peak = edge;
        }
    }

    pub fn mark_tp35_taken(&mut self, position_id: Uuid) {
        if let Some(pos) = self.positions.iter_mut().find(|p| p.id == position_id) {
            pos.tp35_taken = true;
        }
    }

    pub fn set_close_attribution(
        &mut self,
        position_id: Uuid,
        model_close: &str,
        reason: CloseReason,
    ) {
        if let Some(pos) = self.positions.iter_mut().find(|p| p.id == position_id) {
            pos.model_close = Some(model_close.to_string());
            pos.close_reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_one(ledger: &mut Ledger, entry: f64, size: f64) -> Position {
        ledger
            .open("m1", "Bitcoin Up or Down", TradeSide::BuyYes, entry, size, "TA:UP 60%")
            .unwrap()
    }

    #[test]
    fn open_then_close_at_entry_is_flat() {
        let mut ledger = Ledger::new(1000.0);
        let pos = open_one(&mut ledger, 0.50, 100.0);
        assert!((ledger.cash_usd - 900.0).abs() < 1e-9);
        assert!((pos.qty - 200.0).abs() < 1e-9);

        let (pnl, closed) = ledger.close(pos.id, 0.50).unwrap();
        assert!(pnl.abs() < 1e-9);
        assert!((ledger.cash_usd - 1000.0).abs() < 1e-9);
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(ledger.open_count(), 0);
        assert_eq!(ledger.closed_positions.len(), 1);
    }

    #[test]
    fn partial_then_full_close_matches_ladder_math() {
        // entry 0.50, partial 50% at 0.70, remainder at 0.76.
        let mut ledger = Ledger::new(1000.0);
        let pos = open_one(&mut ledger, 0.50, 100.0);
        let qty = pos.qty;

        let (pnl_a, after_partial) = ledger.close_fraction(pos.id, 0.70, 0.5).unwrap();
        let expected_a = qty / 2.0 * (0.70 - 0.50);
        assert!((pnl_a - expected_a).abs() < 1e-9);
        assert!((after_partial.qty - qty / 2.0).abs() < 1e-9);
        assert!((after_partial.notional_usd - 50.0).abs() < 1e-9);

        let (pnl_b, closed) = ledger.close(pos.id, 0.76).unwrap();
        let expected_b = qty / 2.0 * (0.76 - 0.50);
        assert!((pnl_b - expected_b).abs() < 1e-9);
        assert!((closed.pnl_usd.unwrap() - (expected_a + expected_b)).abs() < 1e-9);
        assert!((ledger.realized_pnl_usd - (expected_a + expected_b)).abs() < 1e-9);
    }

    #[test]
    fn cash_conservation_across_cycles() {
        let mut ledger = Ledger::new(500.0);
        let a = open_one(&mut ledger, 0.40, 80.0);
        let b = ledger
            .open("m2", "q", TradeSide::BuyNo, 0.55, 60.0, "BK:DOWN 55%")
            .unwrap();

        // cash + open notionals == starting + realized while nothing closed.
        let open_notional: f64 = ledger.positions.iter().map(|p| p.notional_usd).sum();
        assert!((ledger.cash_usd + open_notional - 500.0).abs() < 1e-9);

        let (pnl_a, _) = ledger.close(a.id, 0.30).unwrap();
        let (pnl_b, _) = ledger.close(b.id, 0.70).unwrap();
        assert!(
            (ledger.cash_usd - (500.0 + pnl_a + pnl_b)).abs() < 1e-9,
            "cash must equal starting plus realized after flat"
        );
        assert!((ledger.realized_pnl_usd - (pnl_a + pnl_b)).abs() < 1e-9);
    }

    #[test]
    fn open_caps_at_available_cash() {
        let mut ledger = Ledger::new(50.0);
        let pos = open_one(&mut ledger, 0.50, 100.0);
        assert!((pos.notional_usd - 50.0).abs() < 1e-9);
        assert!(ledger.cash_usd.abs() < 1e-9);
    }

    #[test]
    fn invalid_inputs_commit_nothing() {
        let mut ledger = Ledger::new(100.0);
        assert_eq!(
            ledger.open("m", "q", TradeSide::BuyYes, 0.0, 10.0, "TA"),
            Err(LedgerError::InvalidPriceOrSize)
        );
        let pos = open_one(&mut ledger, 0.50, 10.0);
        assert_eq!(
            ledger.close_fraction(pos.id, -1.0, 1.0),
            Err(LedgerError::InvalidPriceOrSize)
        );
        assert_eq!(
            ledger.close_fraction(pos.id, 0.5, 0.0),
            Err(LedgerError::InvalidPriceOrSize)
        );
        assert_eq!(ledger.open_count(), 1);
        assert!((ledger.cash_usd - 90.0).abs() < 1e-9);
    }

    #[test]
    fn state_roundtrip() {
        let path = std::env::temp_dir().join(format!("oddsmith-state-{}.json", std::process::id()));
        let mut ledger = Ledger::new(250.0);
        let pos = open_one(&mut ledger, 0.50, 25.0);
        let _ = ledger.close(pos.id, 0.60);
        ledger.save(&path).unwrap();

        let restored = Ledger::load(&path, 999.0);
        assert!((restored.cash_usd - ledger.cash_usd).abs() < 1e-9);
        assert!((restored.realized_pnl_usd - ledger.realized_pnl_usd).abs() < 1e-9);
        assert_eq!(restored.closed_positions.len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
