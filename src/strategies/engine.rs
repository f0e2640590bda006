use crate::config::StrategyConfig;
use crate::models::event::{GuardrailEvent, StrategySnapshotEvent};
use crate::models::forecast::ForecastOutput;
use crate::models::market::{MarketRow, TradeSide};
use crate::models::position::{CloseReason, Position};
use crate::signals::impulse::Impulse;
use crate::strategies::memory::{EdgeSample, MemoryTable};

/// Row-derived values shared by the open and close evaluations.
#[derive(Debug, Clone, Copy)]
pub struct RowInputs {
    pub winner_side: TradeSide,
    pub winner_stability: f64,
    pub reversal_belief: bool,
    pub distance_bps: f64,
    pub edge_yes: f64,
    pub edge_no: f64,
    pub t_left_s: f64,
}

impl RowInputs {
    pub fn edge_on(&self, side: TradeSide) -> f64 {
        match side {
            TradeSide::BuyYes => self.edge_yes,
            TradeSide::BuyNo => self.edge_no,
        }
    }
}

/// A decided OPEN, before execution pricing.
#[derive(Debug, Clone)]
pub struct OpenPlan {
    pub side: TradeSide,
    pub size_usd: f64,
    pub model_tag: String,
    pub scalp: bool,
}

/// A decided CLOSE; `fraction < 1` is a partial take.
#[derive(Debug, Clone, Copy)]
pub struct CloseDecision {
    pub reason: CloseReason,
    pub fraction: f64,
}

/// Per-market trade lifecycle state machine: open guards, trend/reversal
/// and scalp entries, the ordered close rules, and post-close guardrails.
pub struct StrategyEngine {
    cfg: StrategyConfig,
    pub memory: MemoryTable,
}

impl StrategyEngine {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self {
            cfg,
            memory: MemoryTable::default(),
        }
    }

    pub fn cfg(&self) -> &StrategyConfig {
        &self.cfg
    }

    /// Fold this cycle's row into per-market memory and derive the shared
    /// decision inputs. Returns None when the market has no known target.
    pub fn observe(
        &mut self,
        row: &MarketRow,
        forecast: &ForecastOutput,
        now_ts: f64,
    ) -> Option<RowInputs> {
        let target = row.btc_target?;
        let current = row.btc_current.or(row.btc_current_binance)?;
        if target <= 0.0 {
            return None;
        }

        let winner_side = if current >= target {
            TradeSide::BuyYes
        } else {
            TradeSide::BuyNo
        };
        let distance_bps = (current - target) / target * 10_000.0;
        let edge_yes = forecast.p_yes_ensemble - row.best_ask_yes;
        let edge_no = (1.0 - forecast.p_yes_ensemble) - row.best_ask_no;
        let t_left_s = row.t_left(now_ts);

        let mem = self.memory.market(&row.market_id);
        mem.push_edge(EdgeSample {
            yes: edge_yes,
            no: edge_no,
        });
        mem.push_winner(winner_side);
        let winner_stability = mem.winner_stability(winner_side);

        // Reversal only when the model disagrees, the target hit chance is
        // weak, and the winner is unstable.
        let p_yes = forecast.p_yes_ensemble;
        let p_hit = forecast.p_hit_target;
        let reversal_belief = ((winner_side == TradeSide::BuyYes && p_yes < 0.42)
            || (winner_side == TradeSide::BuyNo && p_yes > 0.58))
            && p_hit < 0.45
            && winner_stability < 0.65;

        Some(RowInputs {
            winner_side,
            winner_stability,
            reversal_belief,
            distance_bps,
            edge_yes,
            edge_no,
            t_left_s,
        })
    }

    pub fn snapshot_event(
        &self,
        row: &MarketRow,
        forecast: &ForecastOutput,
        inputs: &RowInputs,
        open_positions: usize,
        now_ts: f64,
    ) -> StrategySnapshotEvent {
        let mem = self.memory.get(&row.market_id);
        StrategySnapshotEvent {
            market_id: row.market_id.clone(),
            side: forecast.predicted_side,
            winner_side: inputs.winner_side,
            distance_bps: inputs.distance_bps,
            reversal_belief: inputs.reversal_belief,
            winner_stability: inputs.winner_stability,
            p_hit_target: forecast.p_hit_target,
            confidence: forecast.confidence,
            consensus: forecast.consensus,
            best_model: forecast.best_model_label(),
            edge_yes: inputs.edge_yes,
            edge_no: inputs.edge_no,
            open_positions,
            flip_fail_streak: mem.map(|m| m.flip_fail_streak).unwrap_or(0),
            market_locked: mem.map(|m| m.is_locked(now_ts)).unwrap_or(false),
            recent_losing_buy_no: mem
                .map(|m| m.recent_losing_close_on(TradeSide::BuyNo, now_ts))
                .unwrap_or(false),
        }
    }

    /// Churn brake for re-entering a market after a close, scaled by the
    /// close reason, the side, and recent same-side losses.
    fn effective_cooldown(&self, market_id: &str, winner_side: TradeSide) -> f64 {
        let Some(mem) = self.memory.get(market_id) else {
            return self.cfg.base_reentry_cooldown_s;
        };
        let mut cd = match mem.last_close_reason {
            Some(r) if r.is_flip_like() => self.cfg.flip_reentry_cooldown_s,
            _ => self.cfg.base_reentry_cooldown_s,
        };
        cd *= match winner_side {
            TradeSide::BuyYes => self.cfg.buy_yes_reentry_cooldown_mult,
            TradeSide::BuyNo => self.cfg.buy_no_reentry_cooldown_mult,
        };
        if mem.last_close_side == Some(winner_side) && mem.last_close_pnl <= 0.0 {
            cd *= 1.35;
        }
        if mem.last_close_reason == Some(CloseReason::HardStop25)
            && mem.last_close_side == Some(winner_side)
        {
            cd = cd.max(600.0);
        }
        if matches!(
            mem.last_close_reason,
            Some(CloseReason::AgainstWinnerNoReversal) | Some(CloseReason::EdgeFlipWrongWay)
        ) {
            cd = cd.max(420.0);
        }
        cd
    }

    fn cool_ok(&self, market_id: &str, winner_side: TradeSide, now_ts: f64) -> bool {
        let cooldown = self.effective_cooldown(market_id, winner_side);
        let (last_close_ts, lock_until) = self
            .memory
            .get(market_id)
            .map(|m| (m.last_close_ts, m.lock_until_ts))
            .unwrap_or((0.0, 0.0));
        now_ts - last_close_ts > cooldown
            && now_ts >= lock_until
            && now_ts >= self.memory.global.open_pause_until_ts
    }

    /// Decide whether to OPEN in this market. `has_open` is whether a
    /// position already exists here; `open_positions` is the global count.
    pub fn evaluate_open(
        &self,
        row: &MarketRow,
        forecast: &ForecastOutput,
        inputs: &RowInputs,
        impulse: &Impulse,
        has_open: bool,
        open_positions: usize,
        cash_usd: f64,
        now_ts: f64,
    ) -> Option<OpenPlan> {
        if has_open || open_positions >= self.cfg.max_open_positions {
            return None;
        }
        let cool_ok = self.cool_ok(&row.market_id, inputs.winner_side, now_ts);
        if !cool_ok {
            return None;
        }

        let mut open_side = inputs.winner_side;
        let mut required_edge = 0.04;
        if forecast.p_hit_target > 0.65 && inputs.winner_stability >= 0.7 {
            required_edge *= 0.85;
        }
        if inputs.reversal_belief {
            open_side = inputs.winner_side.opposite();
            required_edge = 0.06;
        }

        let mem = self.memory.get(&row.market_id);
        let persist = mem.map(|m| m.edge_persistence(open_side)).unwrap_or(0);
        let side_edge = inputs.edge_on(open_side);

        let (mut conf_floor, mut consensus_floor) = match open_side {
            TradeSide::BuyYes => (self.cfg.buy_yes_conf_floor, self.cfg.buy_yes_consensus_floor),
            TradeSide::BuyNo => (self.cfg.buy_no_conf_floor, self.cfg.buy_no_consensus_floor),
        };
        if mem.is_some_and(|m| m.recent_losing_close_on(open_side, now_ts)) {
            match open_side {
                TradeSide::BuyYes => {
                    conf_floor += 3;
                    consensus_floor += 1;
                }
                TradeSide::BuyNo => {
                    conf_floor += 4;
                    consensus_floor += 1;
                }
            }
        }

        let impulse_bps = impulse.bps_3s;
        let max_opposing = self.cfg.normal_open_max_opposing_impulse_bps.abs();
        let impulse_against = match open_side {
            TradeSide::BuyYes => impulse_bps <= -max_opposing,
            TradeSide::BuyNo => impulse_bps >= max_opposing,
        };

        // Avoid late contrarian flips once the winner side has settled.
        let late_contrarian = inputs.t_left_s < 240.0
            && inputs.winner_stability >= 0.70
            && open_side != inputs.winner_side;
        let stability_floor = match open_side {
            TradeSide::BuyYes => self.cfg.normal_open_buy_yes_min_winner_stability,
            TradeSide::BuyNo => self.cfg.normal_open_min_winner_stability,
        };
        let low_stability = inputs.winner_stability < stability_floor;

        let normal_open_ok = forecast.confidence >= conf_floor
            && forecast.consensus >= consensus_floor
            && side_edge >= required_edge
            && persist >= 3
            && !late_contrarian
            && !low_stability
            && !impulse_against;

        // Impulse scalp bypasses the trend and persistence checks.
        let scalp_open_ok = match impulse.side {
            Some(imp_side) => {
                let req = self
                    .cfg
                    .scalp_impulse_req(imp_side == TradeSide::BuyYes);
                impulse_bps.abs() >= req
                    && inputs.edge_on(imp_side) >= 0.02
                    && inputs.t_left_s >= 75.0
            }
            None => false,
        };

        if !normal_open_ok && !scalp_open_ok {
            return None;
        }

        let (side, scalp) = if scalp_open_ok {
            (impulse.side.unwrap_or(open_side), true)
        } else {
            (open_side, false)
        };

        // Confidence-weighted sizing, trimmed further for scalps.
        let mut size_mul = (0.5 + (forecast.confidence as f64 / 100.0) * 0.6).clamp(0.5, 1.0);
        if scalp {
            size_mul = size_mul.min(0.65);
        }
        let per_trade_cash_cap = (cash_usd * self.cfg.max_trade_cash_fraction).max(1.0);
        let size_usd = (self.cfg.trade_cap_usd * size_mul)
            .min(per_trade_cash_cap)
            .min(cash_usd);
        if size_usd < 1.0 {
            return None;
        }

        let model_tag = if scalp {
            format!(
                "SCALP:{}:{}:{:.1}bps",
                impulse.source,
                side.as_str(),
                impulse_bps
            )
        } else {
            forecast.best_model_label()
        };

        Some(OpenPlan {
            side,
            size_usd,
            model_tag,
            scalp,
        })
    }

    /// Ordered close rules; the first match wins. `mark` is the current
    /// ask on the held side, `edge_peak` the max-tracked held edge.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_close(
        &self,
        pos: &Position,
        forecast: &ForecastOutput,
        inputs: &RowInputs,
        mark: f64,
        held_seconds: f64,
        edge_peak: f64,
    ) -> Option<CloseDecision> {
        if mark <= 0.0 {
            return None;
        }
        let entry = pos.entry_price;
        let u_pnl = if entry > 0.0 {
            (mark - entry) / entry
        } else {
            0.0
        };

        let held_edge = inputs.edge_on(pos.side);
        let opp_edge = inputs.edge_on(pos.side.opposite());
        let flip = forecast.predicted_side != pos.side
            && forecast.confidence >= self.cfg.flip_signal_conf_min;
        let against_winner = pos.side != inputs.winner_side;
        let t_left = inputs.t_left_s;
        let min_hold = self.cfg.min_hold_for_flip_exit_s;
        let flip_sl = match pos.side {
            TradeSide::BuyYes => self.cfg.flip_stop_loss_pct,
            TradeSide::BuyNo => self.cfg.buy_no_flip_stop_loss_pct,
        };

        let full = |reason| Some(CloseDecision { reason, fraction: 1.0 });

        if mark >= 0.99 {
            return full(CloseReason::ResolvedWinProxy);
        }
        if mark <= 0.01 {
            return full(CloseReason::ResolvedLossProxy);
        }
        if u_pnl <= -0.25 {
            return full(CloseReason::HardStop25);
        }
        if flip && u_pnl <= flip_sl {
            return full(CloseReason::FlipStop);
        }
        if pos.is_scalp() {
            if u_pnl >= 0.02 {
                return full(CloseReason::ScalpTakeQuick);
            }
            if held_seconds >= 30.0 {
                return full(CloseReason::ScalpTimeout);
            }
            if held_edge < 0.004 {
                return full(CloseReason::ScalpEdgeFaded);
            }
        }
        if held_seconds >= min_hold && held_edge <= -0.012 && opp_edge >= 0.025 {
            return full(CloseReason::EdgeFlipWrongWay);
        }
        if held_seconds >= min_hold && held_edge < 0.0 && u_pnl < 0.0 {
            return full(CloseReason::EdgeDecayStop);
        }
        if held_seconds >= min_hold && edge_peak > 0.0 && held_edge < 0.45 * edge_peak && u_pnl > 0.0
        {
            return full(CloseReason::EdgeTrailingStop);
        }
        if against_winner && !inputs.reversal_belief && t_left < 300.0 {
            return full(CloseReason::AgainstWinnerNoReversal);
        }
        if t_left < 45.0 {
            return full(CloseReason::TimeLt45s);
        }
        if t_left < 90.0 && u_pnl > 0.0 {
            return full(CloseReason::TimeLt90sBank);
        }
        if t_left < 180.0 && forecast.confidence < 58 {
            return full(CloseReason::TimeLt180sLowConf);
        }
        if u_pnl >= 0.50 {
            return full(CloseReason::Tp50);
        }
        if u_pnl >= 0.35 && !pos.tp35_taken {
            return Some(CloseDecision {
                reason: CloseReason::Tp35Half,
                fraction: 0.5,
            });
        }
        None
    }

    /// Record a full close and apply the guardrail ladder. Returns the
    /// guardrail events to log.
    pub fn apply_close(
        &mut self,
        market_id: &str,
        reason: CloseReason,
        side: TradeSide,
        pnl: f64,
        now_ts: f64,
    ) -> Vec<GuardrailEvent> {
        let mut events = Vec::new();
        let cfg = self.cfg.clone();

        let mem = self.memory.market(market_id);
        mem.last_close_ts = now_ts;
        mem.last_close_reason = Some(reason);
        mem.last_close_side = Some(side);
        mem.last_close_pnl = pnl;

        let mut streak = mem.flip_fail_streak;
        if reason == CloseReason::EdgeFlipWrongWay && pnl <= 0.0 {
            streak += 1;
        } else if reason.is_streak_reset() && pnl > 0.0 {
            streak = 0;
        } else {
            streak = streak.saturating_sub(1);
        }
        mem.flip_fail_streak = streak;

        let mut lock = |mem: &mut crate::strategies::memory::PerMarketMemory,
                        secs: u64,
                        why: &str| {
            mem.lock_until_ts = mem.lock_until_ts.max(now_ts + secs as f64);
            events.push(GuardrailEvent {
                market_id: market_id.to_string(),
                reason: why.to_string(),
                flip_fail_streak: Some(streak),
                lock_seconds: secs,
                lock_until_ts: mem.lock_until_ts,
                last_close_reason: Some(reason),
                last_pnl_usd: Some(pnl),
                recent_flip_stop_losses: None,
                window_seconds: None,
            });
        };

        if reason == CloseReason::EdgeFlipWrongWay && pnl <= 0.0 {
            lock(mem, 360, "single_flip_loss_cooloff");
        }
        if reason == CloseReason::HardStop25 && pnl <= 0.0 {
            lock(mem, 720, "single_hard_stop_cooloff");
        }
        if reason == CloseReason::FlipStop && pnl <= 0.0 && cfg.flip_stop_loss_lock_seconds > 0 {
            lock(
                mem,
                cfg.flip_stop_loss_lock_seconds,
                "flip_stop_loss_cooloff",
            );
        }
        if streak >= 2 {
            let secs = (300 + (streak as u64 - 2) * 180).min(900);
            mem.lock_until_ts = now_ts + secs as f64;
            events.push(GuardrailEvent {
                market_id: market_id.to_string(),
                reason: "flip_streak_lockout".to_string(),
                flip_fail_streak: Some(streak),
                lock_seconds: secs,
                lock_until_ts: mem.lock_until_ts,
                last_close_reason: Some(reason),
                last_pnl_usd: Some(pnl),
                recent_flip_stop_losses: None,
                window_seconds: None,
            });
        }

        // Cross-market churn brake: clustered flip-stop losses pause every
        // new OPEN for a while.
        if reason == CloseReason::FlipStop
            && pnl <= 0.0
            && cfg.global_flip_stop_pause_seconds > 0
            && cfg.global_flip_stop_trigger_count > 0
        {
            let window = cfg.global_flip_stop_window_seconds.max(60) as f64;
            let global = &mut self.memory.global;
            global
                .recent_flip_stop_losses
                .retain(|t| now_ts - t <= window);
            global.recent_flip_stop_losses.push(now_ts);
            if global.recent_flip_stop_losses.len() >= cfg.global_flip_stop_trigger_count {
                global.open_pause_until_ts = global
                    .open_pause_until_ts
                    .max(now_ts + cfg.global_flip_stop_pause_seconds as f64);
                events.push(GuardrailEvent {
                    market_id: "*".to_string(),
                    reason: "global_flip_stop_cooloff".to_string(),
                    flip_fail_streak: None,
                    lock_seconds: cfg.global_flip_stop_pause_seconds,
                    lock_until_ts: global.open_pause_until_ts,
                    last_close_reason: Some(reason),
                    last_pnl_usd: Some(pnl),
                    recent_flip_stop_losses: Some(global.recent_flip_stop_losses.len()),
                    window_seconds: Some(cfg.global_flip_stop_window_seconds),
                });
            }
        }

        events
    }
}
