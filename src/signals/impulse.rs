use std::collections::{HashMap, VecDeque};

use crate::models::market::TradeSide;

const RING_SECONDS: f64 = 120.0;
const MIN_SAMPLES: usize = 8;

/// Short-window spot impulse from a single secondary source.
#[derive(Debug, Clone)]
pub struct Impulse {
    pub side: Option<TradeSide>,
    pub bps_3s: f64,
    pub bps_8s: f64,
    pub source: String,
}

impl Impulse {
    fn flat(source: &str) -> Self {
        Self {
            side: None,
            bps_3s: 0.0,
            bps_8s: 0.0,
            source: source.to_string(),
        }
    }
}

/// Per-source rolling price rings for impulse computation.
///
/// An impulse fires when both the 3-second and 8-second log moves clear
/// their thresholds in the same direction (≥ 7 bps and ≥ 10 bps).
#[derive(Debug, Default)]
pub struct ImpulseTracker {
    rings: HashMap<String, VecDeque<(f64, f64)>>,
    last_poll: HashMap<String, f64>,
}

impl ImpulseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: &str, price: f64, now_ts: f64) {
        if price <= 0.0 {
            return;
        }
        let ring = self.rings.entry(source.to_string()).or_default();
        ring.push_back((now_ts, price));
        while ring
            .front()
            .is_some_and(|(ts, _)| now_ts - ts > RING_SECONDS)
        {
            ring.pop_front();
        }
    }

    /// Rate-limit gate for polled secondary sources (≤ 1 Hz).
    pub fn should_poll(&mut self, source: &str, now_ts: f64, min_interval_s: f64) -> bool {
        let last = self.last_poll.get(source).copied().unwrap_or(0.0);
        if now_ts - last >= min_interval_s {
            self.last_poll.insert(source.to_string(), now_ts);
            true
        } else {
            false
        }
    }

    pub fn impulse(&self, source: &str) -> Impulse {
        let Some(ring) = self.rings.get(source) else {
            return Impulse::flat(source);
        };
        if ring.len() < MIN_SAMPLES {
            return Impulse::flat(source);
        }
        let &(t_now, p_now) = ring.back().expect("non-empty ring");
        if p_now <= 0.0 {
            return Impulse::flat(source);
        }

        let mut p3 = None;
        let mut p8 = None;
        for &(ts, p) in ring.iter().rev() {
            if p <= 0.0 {
                continue;
            }
            let dt = t_now - ts;
            if p3.is_none() && dt >= 3.0 {
                p3 = Some(p);
            }
            if p8.is_none() && dt >= 8.0 {
                p8 = Some(p);
                break;
            }
        }
        let (Some(p3), Some(p8)) = (p3, p8) else {
            return Impulse::flat(source);
        };

        let bps_3s = (p_now - p3) / p3 * 10_000.0;
        let bps_8s = (p_now - p8) / p8 * 10_000.0;
        let side = if bps_3s >= 7.0 && bps_8s >= 10.0 {
            Some(TradeSide::BuyYes)
        } else if bps_3s <= -7.0 && bps_8s <= -10.0 {
            Some(TradeSide::BuyNo)
        } else {
            None
        };

        Impulse {
            side,
            bps_3s,
            bps_8s,
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(tracker: &mut ImpulseTracker, prices: &[f64]) {
        for (i, p) in prices.iter().enumerate() {
            tracker.push("binance", *p, i as f64);
        }
    }

    #[test]
    fn upward_burst_signals_buy_yes() {
        let mut t = ImpulseTracker::new();
        // Flat for 8s, then a sharp pop over the last 3 seconds.
        fill(
            &mut t,
            &[
                65_000.0, 65_000.0, 65_000.0, 65_000.0, 65_000.0, 65_000.0, 65_005.0, 65_030.0,
                65_060.0, 65_090.0, 65_120.0,
            ],
        );
        let imp = t.impulse("binance");
        assert_eq!(imp.side, Some(TradeSide::BuyYes));
        assert!(imp.bps_3s >= 7.0);
        assert!(imp.bps_8s >= 10.0);
    }

    #[test]
    fn symmetric_drop_signals_buy_no() {
        let mut t = ImpulseTracker::new();
        fill(
            &mut t,
            &[
                65_000.0, 65_000.0, 65_000.0, 65_000.0, 65_000.0, 65_000.0, 64_995.0, 64_970.0,
                64_940.0, 64_910.0, 64_880.0,
            ],
        );
        assert_eq!(t.impulse("binance").side, Some(TradeSide::BuyNo));
    }

    #[test]
    fn too_few_samples_is_flat() {
        let mut t = ImpulseTracker::new();
        fill(&mut t, &[65_000.0, 65_100.0, 65_200.0]);
        assert_eq!(t.impulse("binance").side, None);
    }

    #[test]
    fn small_move_does_not_fire() {
        let mut t = ImpulseTracker::new();
        fill(
            &mut t,
            &[
                65_000.0, 65_001.0, 65_002.0, 65_001.0, 65_003.0, 65_002.0, 65_004.0, 65_003.0,
                65_005.0, 65_004.0, 65_006.0,
            ],
        );
        assert_eq!(t.impulse("binance").side, None);
    }

    #[test]
    fn poll_gate_enforces_one_hz() {
        let mut t = ImpulseTracker::new();
        assert!(t.should_poll("coinbase", 100.0, 1.0));
        assert!(!t.should_poll("coinbase", 100.5, 1.0));
        assert!(t.should_poll("coinbase", 101.1, 1.0));
    }

    #[test]
    fn ring_evicts_old_samples() {
        let mut t = ImpulseTracker::new();
        t.push("binance", 65_000.0, 0.0);
        t.push("binance", 65_010.0, 200.0);
        let ring = t.rings.get("binance").unwrap();
        assert_eq!(ring.len(), 1);
    }
}
