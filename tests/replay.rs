//! End-to-end audit-trail test: a sequence of opens, partials and closes
//! written as paper_trade events can be replayed in order to reproduce
//! the final ledger state.

use oddsmith::models::event::{Event, PaperTradeEvent, TradeAction};
use oddsmith::models::market::TradeSide;
use oddsmith::models::position::CloseReason;
use oddsmith::risk::ledger::Ledger;
use oddsmith::telemetry::events::EventLog;

use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

fn temp_events_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("oddsmith-replay-{}-{}.jsonl", name, std::process::id()))
}

struct Session {
    ledger: Ledger,
    log: EventLog,
    open_ids: HashMap<String, Uuid>,
}

impl Session {
    fn new(path: &PathBuf, cash: f64) -> Self {
        let _ = std::fs::remove_file(path);
        Self {
            ledger: Ledger::new(cash),
            log: EventLog::new(path),
            open_ids: HashMap::new(),
        }
    }

    fn open(&mut self, market_id: &str, side: TradeSide, entry: f64, size: f64) {
        let pos = self
            .ledger
            .open(market_id, "Bitcoin Up or Down", side, entry, size, "TA:UP 60%")
            .unwrap();
        self.open_ids.insert(market_id.to_string(), pos.id);

        let mut ev = PaperTradeEvent::new(TradeAction::Open, market_id, &pos.market_name, side);
        ev.size_usd = Some(pos.notional_usd);
        ev.entry_price = Some(pos.entry_price);
        ev.opened_at = Some(pos.opened_at);
        ev.model = Some(pos.model_open.clone());
        self.log.append(&Event::PaperTrade(ev));
    }

    fn close_fraction(&mut self, market_id: &str, exit: f64, fraction: f64, reason: CloseReason) {
        let id = self.open_ids[market_id];
        let (pnl, pos) = self.ledger.close_fraction(id, exit, fraction).unwrap();

        let action = if fraction >= 1.0 {
            TradeAction::Close
        } else {
            TradeAction::PartialClose
        };
        let mut ev = PaperTradeEvent::new(action, market_id, &pos.market_name, pos.side);
        ev.reason = Some(reason);
        ev.fraction = Some(fraction);
        ev.entry_price = Some(pos.entry_price);
        ev.exit_price = Some(exit);
        ev.pnl_usd = Some(pnl);
        self.log.append(&Event::PaperTrade(ev));
    }
}

/// Rebuild a ledger by replaying the trade events in order.
fn replay(path: &PathBuf, starting_cash: f64) -> Ledger {
    let mut ledger = Ledger::new(starting_cash);
    let mut open_ids: HashMap<String, Uuid> = HashMap::new();

    for event in EventLog::read_all(path).unwrap() {
        let Event::PaperTrade(ev) = event else {
            continue;
        };
        match ev.action {
            TradeAction::Open => {
                let pos = ledger
                    .open(
                        &ev.market_id,
                        &ev.market_name,
                        ev.side,
                        ev.entry_price.unwrap(),
                        ev.size_usd.unwrap(),
                        ev.model.as_deref().unwrap_or(""),
                    )
                    .unwrap();
                open_ids.insert(ev.market_id.clone(), pos.id);
            }
            TradeAction::Close | TradeAction::PartialClose => {
                let id = open_ids[&ev.market_id];
                ledger
                    .close_fraction(id, ev.exit_price.unwrap(), ev.fraction.unwrap())
                    .unwrap();
            }
            _ => {}
        }
    }
    ledger
}

#[test]
fn replaying_events_reproduces_final_ledger() {
    let path = temp_events_path("ledger");
    let mut session = Session::new(&path, 1000.0);

    // A winner with a partial take, a loser, and a flat scratch.
    session.open("m1", TradeSide::BuyYes, 0.50, 100.0);
    session.close_fraction("m1", 0.70, 0.5, CloseReason::Tp35Half);
    session.close_fraction("m1", 0.76, 1.0, CloseReason::Tp50);

    session.open("m2", TradeSide::BuyNo, 0.55, 80.0);
    session.close_fraction("m2", 0.40, 1.0, CloseReason::HardStop25);

    session.open("m3", TradeSide::BuyYes, 0.48, 50.0);
    session.close_fraction("m3", 0.48, 1.0, CloseReason::TimeLt45s);

    let replayed = replay(&path, 1000.0);

    assert!(
        (replayed.cash_usd - session.ledger.cash_usd).abs() < 1e-9,
        "replayed cash {} vs live {}",
        replayed.cash_usd,
        session.ledger.cash_usd
    );
    assert!(
        (replayed.realized_pnl_usd - session.ledger.realized_pnl_usd).abs() < 1e-9
    );
    assert_eq!(
        replayed.closed_positions.len(),
        session.ledger.closed_positions.len()
    );
    assert_eq!(replayed.open_count(), 0);

    // Cash conservation: with everything flat, cash equals starting plus
    // realized P&L.
    assert!(
        (replayed.cash_usd - (1000.0 + replayed.realized_pnl_usd)).abs() < 1e-9
    );

    let _ = std::fs::remove_file(&path);
}

#[test]
fn replay_tolerates_torn_trailing_write() {
    let path = temp_events_path("torn");
    let mut session = Session::new(&path, 500.0);
    session.open("m1", TradeSide::BuyYes, 0.40, 60.0);
    session.close_fraction("m1", 0.44, 1.0, CloseReason::Tp50);

    // Simulate a crash mid-append.
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"ts\":\"2026-01-01T00:00:00Z\",\"type\":\"paper_tr").unwrap();
    }

    let replayed = replay(&path, 500.0);
    assert!((replayed.cash_usd - session.ledger.cash_usd).abs() < 1e-9);
    assert_eq!(replayed.closed_positions.len(), 1);

    let _ = std::fs::remove_file(&path);
}
