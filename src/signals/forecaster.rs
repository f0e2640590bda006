use crate::models::forecast::{
    Component, ComponentProbs, ComponentWeights, ForecastOutput, ModelStats,
};
use crate::models::market::{MarketRow, SpotSample, TradeSide};
use crate::signals::monte_carlo::{MonteCarlo, DEFAULT_PATHS};

/// Short-horizon signal extracted from the blended spot history.
#[derive(Debug, Clone, Copy)]
pub struct SpotSignal {
    pub p_up: f64,
    pub lead_bps: f64,
    pub rf: f64,
    pub rs: f64,
    pub sigma: f64,
    pub rsi_n: f64,
}

impl Default for SpotSignal {
    fn default() -> Self {
        Self {
            p_up: 0.5,
            lead_bps: 0.0,
            rf: 0.0,
            rs: 0.0,
            sigma: 1e-4,
            rsi_n: 0.0,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(0.02, 0.98)
}

/// Price approximately `sec` seconds before the newest sample; the oldest
/// sample when history is shorter than that.
fn price_ago(samples: &[SpotSample], sec: f64) -> Option<f64> {
    let now = samples.last()?.ts;
    for s in samples.iter().rev() {
        if now - s.ts >= sec {
            return Some(s.price);
        }
    }
    samples.first().map(|s| s.price)
}

/// Momentum, RSI, realized vol and oracle/exchange lead from spot history.
pub fn compute_spot_signal(samples: &[SpotSample]) -> SpotSignal {
    if samples.len() < 5 {
        return SpotSignal::default();
    }
    let last = samples[samples.len() - 1];
    let now = last.ts;
    let p_now = last.price;

    let p20 = price_ago(samples, 20.0).unwrap_or(p_now);
    let p120 = price_ago(samples, 120.0).unwrap_or(p_now);
    let rf = if p20 > 0.0 { (p_now / p20).ln() } else { 0.0 };
    let rs = if p120 > 0.0 { (p_now / p120).ln() } else { 0.0 };

    let mut up = 0.0;
    let mut down = 0.0;
    let rsi_window: Vec<&SpotSample> = samples.iter().filter(|s| now - s.ts <= 30.0).collect();
    for w in rsi_window.windows(2) {
        let d = w[1].price - w[0].price;
        if d > 0.0 {
            up += d;
        } else {
            down += -d;
        }
    }
    let rsi = if up + down <= 0.0 {
        50.0
    } else {
        100.0 * up / (up + down)
    };
    let rsi_n = (rsi - 50.0) / 50.0;

    let mut rets = Vec::new();
    let vol_window: Vec<&SpotSample> = samples.iter().filter(|s| now - s.ts <= 60.0).collect();
    for w in vol_window.windows(2) {
        if w[0].price > 0.0 && w[1].price > 0.0 {
            rets.push((w[1].price / w[0].price).ln());
        }
    }
    let sigma = if rets.is_empty() {
        1e-4
    } else {
        let mean = rets.iter().sum::<f64>() / rets.len() as f64;
        (rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rets.len() as f64).sqrt()
    };

    let lead = match (last.chainlink, last.binance) {
        (Some(cl), Some(bi)) if cl > 0.0 => (bi - cl) / cl,
        _ => 0.0,
    };

    let s = 1.8 * rf + 1.2 * rs + 0.6 * rsi_n + 0.8 * lead;
    let denom = (2.5 * sigma.max(8e-5)).max(1e-6);
    let z = (s / denom).clamp(-8.0, 8.0);

    SpotSignal {
        p_up: sigmoid(z),
        lead_bps: lead * 10_000.0,
        rf,
        rs,
        sigma,
        rsi_n,
    }
}

/// Heuristic ensemble forecaster: six component probabilities fused with
/// stat-learned and time-decay weights.
pub struct Forecaster {
    mc: MonteCarlo,
}

impl Forecaster {
    pub fn new() -> Self {
        Self {
            mc: MonteCarlo::new(DEFAULT_PATHS),
        }
    }

    /// Fixed-seed construction keeps forecasts reproducible for tests and
    /// replay.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            mc: MonteCarlo::with_seed(DEFAULT_PATHS, seed),
        }
    }

    pub fn forecast(
        &mut self,
        row: &MarketRow,
        signal: &SpotSignal,
        stats: &ModelStats,
        now_ts: f64,
    ) -> ForecastOutput {
        let p_ta = clamp_prob(signal.p_up);
        let p_ll = clamp_prob(0.5 + 0.18 * (signal.lead_bps / 35.0).clamp(-1.5, 1.5));

        let trend = signal.rf.abs() + signal.rs.abs();
        let chop = signal.sigma;
        let w_trend = (trend / (trend + chop).max(1e-6)).clamp(0.1, 0.9);
        let p_mr = clamp_prob(0.5 - 0.35 * signal.rsi_n);
        let p_rg = clamp_prob(w_trend * p_ta + (1.0 - w_trend) * p_mr);

        let sy = if row.best_ask_yes > 0.0 {
            (row.best_ask_yes - row.best_bid_yes).max(0.0)
        } else {
            0.01
        };
        let sn = if row.best_ask_no > 0.0 {
            (row.best_ask_no - row.best_bid_no).max(0.0)
        } else {
            0.01
        };
        let p_bk = clamp_prob(0.5 + 0.12 * (sn - sy));

        let target = row.btc_target.unwrap_or(0.0);
        let current = row
            .btc_current
            .or(row.btc_current_binance)
            .unwrap_or(0.0);
        let t_left = match row.end_ts {
            Some(end) if end > 0.0 => (end - now_ts).max(1.0),
            _ => 900.0,
        };

        // Short-horizon return sigma converted to a price envelope.
        let sigma_ret = signal.sigma.max(5e-5);
        let p_anchor = if target > 0.0 && current > 0.0 {
            let sigma_price = (current * sigma_ret * t_left.max(5.0).sqrt()).max(8.0);
            let z = ((current - target) / sigma_price).clamp(-8.0, 8.0);
            sigmoid(z)
        } else {
            0.5
        };

        let drift_per_s = signal.rf / 20.0;
        let sigma_per_s = signal.sigma.max(1e-6);
        let (p_close_mc, p_hit_mc) =
            self.mc
                .target_probs(current, target, t_left, drift_per_s, sigma_per_s);

        let probs = ComponentProbs {
            ta: p_ta,
            ll: p_ll,
            rg: p_rg,
            bk: p_bk,
            anchor: p_anchor,
            mc_close: p_close_mc,
        };

        // Anchor and MC dominate as expiry approaches.
        let t_capped = t_left.min(900.0);
        let weights = ComponentWeights {
            ta: stats.weight(Component::Ta),
            ll: stats.weight(Component::Ll),
            rg: stats.weight(Component::Rg),
            bk: stats.weight(Component::Bk),
            anchor: (1.9 - t_capped / 900.0).clamp(0.7, 2.2),
            mc_close: (2.0 - t_capped / 900.0).clamp(0.8, 2.4),
        };

        let wsum = weights.sum().max(1e-9);
        let p_yes_ensemble = Component::ALL
            .into_iter()
            .map(|c| probs.get(c) * weights.get(c))
            .sum::<f64>()
            / wsum;

        let predicted_side = if p_yes_ensemble >= 0.5 {
            TradeSide::BuyYes
        } else {
            TradeSide::BuyNo
        };

        let mut best = Component::Ta;
        let mut best_score = f64::NEG_INFINITY;
        let mut best_strength = 0.0;
        let mut consensus = 0u8;
        for c in Component::ALL {
            let p = probs.get(c);
            let strength = (2.0 * p - 1.0).abs();
            let dir = if p >= 0.5 {
                TradeSide::BuyYes
            } else {
                TradeSide::BuyNo
            };
            if dir == predicted_side {
                consensus += 1;
            }
            let score = strength * weights.get(c);
            if score > best_score {
                best_score = score;
                best = c;
                best_strength = strength;
            }
        }

        let agreement = consensus as f64 / Component::ALL.len() as f64;
        let confidence = ((0.6 * best_strength + 0.4 * agreement) * 100.0).round() as i64;
        let confidence = confidence.clamp(1, 99) as u8;

        ForecastOutput {
            p_yes_ensemble,
            p_hit_target: p_hit_mc,
            component_probs: probs,
            weights,
            best_component: best,
            predicted_side,
            confidence,
            consensus,
            sigma_per_s: signal.sigma,
            lead_bps: signal.lead_bps,
        }
    }
}

impl Default for Forecaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::market::RowSignal;

    fn ramp_samples(start: f64, step: f64, n: usize) -> Vec<SpotSample> {
        (0..n)
            .map(|i| {
                let p = start + step * i as f64;
                SpotSample {
                    ts: i as f64,
                    price: p,
                    chainlink: Some(p),
                    binance: Some(p),
                }
            })
            .collect()
    }

    fn row(target: Option<f64>, current: Option<f64>, end_ts: Option<f64>) -> MarketRow {
        MarketRow {
            market_id: "m1".into(),
            market_name: "Bitcoin Up or Down".into(),
            slug: "btc-updown-15m-1770933900".into(),
            best_bid_yes: 0.47,
            best_bid_no: 0.46,
            best_ask_yes: 0.48,
            best_ask_no: 0.47,
            ask_sum_no_fees: 0.95,
            ask_sum_with_fees: 0.9575,
            signal: RowSignal::Opportunity,
            depth_usd: 1000.0,
            spread_sum: 0.02,
            quality_score: 10.0,
            end_ts,
            t_left_s: end_ts.map(|e| e - 1000.0),
            btc_target: target,
            btc_current: current,
            btc_current_binance: current,
            btc_price_source: None,
        }
    }

    #[test]
    fn uptrend_pushes_p_up_above_half() {
        let samples = ramp_samples(65_000.0, 2.0, 180);
        let sig = compute_spot_signal(&samples);
        assert!(sig.p_up > 0.5, "p_up {} should exceed 0.5", sig.p_up);
        assert!(sig.rf > 0.0);
        assert!(sig.sigma > 0.0);
    }

    #[test]
    fn sparse_history_is_neutral() {
        let samples = ramp_samples(65_000.0, 2.0, 3);
        let sig = compute_spot_signal(&samples);
        assert_eq!(sig.p_up, 0.5);
    }

    #[test]
    fn forecast_is_deterministic_for_fixed_seed() {
        let samples = ramp_samples(65_000.0, 1.0, 200);
        let sig = compute_spot_signal(&samples);
        let stats = ModelStats::default();
        let r = row(Some(64_800.0), Some(65_199.0), Some(1600.0));

        let mut a = Forecaster::with_seed(9);
        let mut b = Forecaster::with_seed(9);
        let fa = a.forecast(&r, &sig, &stats, 1000.0);
        let fb = b.forecast(&r, &sig, &stats, 1000.0);
        assert_eq!(fa.p_yes_ensemble, fb.p_yes_ensemble);
        assert_eq!(fa.p_hit_target, fb.p_hit_target);
        assert_eq!(fa.confidence, fb.confidence);
    }

    #[test]
    fn output_ranges_hold() {
        let samples = ramp_samples(65_000.0, -1.5, 200);
        let sig = compute_spot_signal(&samples);
        let stats = ModelStats::default();
        let r = row(Some(65_400.0), Some(64_700.0), Some(1300.0));
        let mut f = Forecaster::with_seed(3);
        let out = f.forecast(&r, &sig, &stats, 1000.0);
        assert!((0.0..=1.0).contains(&out.p_yes_ensemble));
        assert!((1..=99).contains(&out.confidence));
        assert!((1..=6).contains(&out.consensus));
        assert_eq!(out.predicted_side, TradeSide::BuyNo);
    }

    #[test]
    fn anchor_favors_side_above_target() {
        let samples = ramp_samples(65_000.0, 0.0, 200);
        let sig = compute_spot_signal(&samples);
        let stats = ModelStats::default();
        let mut f = Forecaster::with_seed(4);
        let above = f.forecast(&row(Some(64_000.0), Some(65_000.0), Some(1600.0)), &sig, &stats, 1000.0);
        let below = f.forecast(&row(Some(66_000.0), Some(65_000.0), Some(1600.0)), &sig, &stats, 1000.0);
        assert!(above.component_probs.anchor > 0.5);
        assert!(below.component_probs.anchor < 0.5);
    }

    #[test]
    fn missing_target_keeps_anchor_neutral() {
        let samples = ramp_samples(65_000.0, 0.0, 200);
        let sig = compute_spot_signal(&samples);
        let stats = ModelStats::default();
        let mut f = Forecaster::with_seed(5);
        let out = f.forecast(&row(None, Some(65_000.0), Some(1600.0)), &sig, &stats, 1000.0);
        assert_eq!(out.component_probs.anchor, 0.5);
        assert_eq!(out.p_hit_target, 0.5);
    }

    #[test]
    fn best_model_label_format() {
        let samples = ramp_samples(65_000.0, 1.0, 200);
        let sig = compute_spot_signal(&samples);
        let stats = ModelStats::default();
        let mut f = Forecaster::with_seed(6);
        let out = f.forecast(&row(Some(64_800.0), Some(65_199.0), Some(1600.0)), &sig, &stats, 1000.0);
        let label = out.best_model_label();
        assert!(label.contains(':'));
        assert!(label.ends_with('%'));
    }
}
