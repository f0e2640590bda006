use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{ExecMode, ExecutionConfig};
use crate::models::event::CloseMeta;
use crate::models::market::{MarketRow, TradeSide};
use crate::models::position::CloseReason;

/// How an OPEN got its entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenExecution {
    Market,
    LimitFill,
    LimitTimeoutFallback,
    PendingSkip,
}

impl OpenExecution {
    pub fn tag(&self) -> &'static str {
        match self {
            OpenExecution::Market => "open_market",
            OpenExecution::LimitFill => "open_limit_fill",
            OpenExecution::LimitTimeoutFallback => "open_limit_timeout_fallback",
            OpenExecution::PendingSkip => "open_limit_pending_skip",
        }
    }

    /// Post-only submits are those that did not cross the book.
    pub fn is_post_only(&self) -> bool {
        matches!(self, OpenExecution::LimitFill | OpenExecution::PendingSkip)
    }
}

/// Snap a price onto the exchange tick grid.
pub fn round_to_tick(px: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return px;
    }
    let (Some(p), Some(t)) = (Decimal::from_f64(px), Decimal::from_f64(tick)) else {
        return px;
    };
    let ticks = (p / t).round();
    (ticks * t).round_dp(6).to_f64().unwrap_or(px)
}

/// Resolve the entry price for an OPEN within the current cycle.
///
/// `market` takes the ask outright. `limit_first` posts one improve-tick
/// above best bid; if that already crosses the ask it is a taker-priced
/// fill, otherwise we either fall back to the ask or skip this cycle.
pub fn plan_open(bid: f64, ask: f64, ex: &ExecutionConfig) -> (f64, OpenExecution) {
    if ex.open_mode == ExecMode::Market {
        return (ask, OpenExecution::Market);
    }

    let limit = if bid > 0.0 {
        round_to_tick(
            (bid + ex.open_limit_improve_ticks as f64 * ex.tick_size).max(0.0),
            ex.tick_size,
        )
    } else {
        ask
    };

    if ask > 0.0 && limit >= ask {
        (ask, OpenExecution::LimitFill)
    } else if ex.open_limit_fallback_taker && ask > 0.0 {
        (ask, OpenExecution::LimitTimeoutFallback)
    } else {
        (0.0, OpenExecution::PendingSkip)
    }
}

/// Close order parameters derived from the current row.
#[derive(Debug, Clone)]
pub struct CloseOrder {
    pub mode: ExecMode,
    pub taker_price: f64,
    pub limit_price: Option<f64>,
    pub bid: f64,
    pub ask: f64,
}

pub fn build_close_order(side: TradeSide, row: &MarketRow, ex: &ExecutionConfig) -> CloseOrder {
    let bid = row.best_bid(side);
    let ask = row.best_ask(side);

    // Selling out of an existing position: the taker route hits the bid.
    let taker_price = if bid > 0.0 { bid } else { ask };
    if ex.close_mode == ExecMode::Market {
        return CloseOrder {
            mode: ExecMode::Market,
            taker_price,
            limit_price: None,
            bid,
            ask,
        };
    }

    let target = if bid > 0.0 && ask > 0.0 && ask >= bid {
        ask.min(bid + ex.close_limit_improve_ticks as f64 * ex.tick_size)
    } else if ask > 0.0 {
        ask
    } else {
        bid
    };

    CloseOrder {
        mode: ExecMode::LimitFirst,
        taker_price,
        limit_price: Some(round_to_tick(target, ex.tick_size)),
        bid,
        ask,
    }
}

/// State of an unfilled limit close, kept across cycles per position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingClose {
    pub created_ts: f64,
    pub last_reprice_ts: f64,
    pub attempts: u32,
    pub limit_price: f64,
    pub reason: CloseReason,
}

/// Outcome of one pass through the limit-close ladder.
#[derive(Debug, Clone)]
pub enum CloseResolution {
    /// Cross now at `price`; `tag` records which route fired.
    Fill {
        price: f64,
        tag: &'static str,
        meta: Option<CloseMeta>,
    },
    /// Limit still resting; try again next cycle.
    Pending { meta: CloseMeta },
}

/// Advance the limit-close ladder for one cycle.
///
/// Force-taker reasons cross immediately. Otherwise the limit reprices one
/// tick toward the bid every `close_limit_reprice_s`, fills when the bid
/// reaches it, and falls back to taker after `close_limit_timeout_s`.
pub fn resolve_limit_close(
    pending: &mut Option<PendingClose>,
    reason: CloseReason,
    order: &CloseOrder,
    ex: &ExecutionConfig,
    now_ts: f64,
) -> CloseResolution {
    if ex
        .close_force_taker_reasons
        .iter()
        .any(|r| r == reason.as_str())
    {
        *pending = None;
        return CloseResolution::Fill {
            price: order.taker_price,
            tag: "close_force_taker",
            meta: None,
        };
    }

    let st = pending.get_or_insert_with(|| PendingClose {
        created_ts: now_ts,
        last_reprice_ts: now_ts,
        attempts: 1,
        limit_price: order.limit_price.unwrap_or(0.0),
        reason,
    });

    if now_ts - st.last_reprice_ts >= ex.close_limit_reprice_s {
        st.attempts += 1;
        st.last_reprice_ts = now_ts;
        if order.bid > 0.0 {
            st.limit_price = round_to_tick(
                st.limit_price.min(order.bid + ex.tick_size),
                ex.tick_size,
            );
        }
    }

    let wait_s = now_ts - st.created_ts;
    let attempts = st.attempts;
    let limit_price = st.limit_price;

    if order.bid > 0.0 && limit_price > 0.0 && order.bid >= limit_price {
        *pending = None;
        return CloseResolution::Fill {
            price: limit_price,
            tag: "close_limit_fill",
            meta: Some(CloseMeta {
                wait_s,
                attempts,
                limit_price: None,
                best_bid: None,
                best_ask: None,
            }),
        };
    }

    if wait_s >= ex.close_limit_timeout_s {
        *pending = None;
        let px = if order.taker_price > 0.0 {
            order.taker_price
        } else if order.bid > 0.0 {
            order.bid
        } else {
            order.ask
        };
        return CloseResolution::Fill {
            price: px,
            tag: "close_limit_timeout_fallback",
            meta: Some(CloseMeta {
                wait_s,
                attempts,
                limit_price: None,
                best_bid: None,
                best_ask: None,
            }),
        };
    }

    CloseResolution::Pending {
        meta: CloseMeta {
            wait_s,
            attempts,
            limit_price: Some(limit_price),
            best_bid: Some(order.bid),
            best_ask: Some(order.ask),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::market::RowSignal;

    fn ex_cfg() -> ExecutionConfig {
        ExecutionConfig::default()
    }

    fn row(bid_yes: f64, ask_yes: f64, bid_no: f64, ask_no: f64) -> MarketRow {
        MarketRow {
            market_id: "m1".into(),
            market_name: "q".into(),
            slug: "s".into(),
            best_bid_yes: bid_yes,
            best_bid_no: bid_no,
            best_ask_yes: ask_yes,
            best_ask_no: ask_no,
            ask_sum_no_fees: ask_yes + ask_no,
            ask_sum_with_fees: ask_yes + ask_no + 0.0075,
            signal: RowSignal::Watch,
            depth_usd: 100.0,
            spread_sum: 0.02,
            quality_score: 1.0,
            end_ts: None,
            t_left_s: None,
            btc_target: None,
            btc_current: None,
            btc_current_binance: None,
            btc_price_source: None,
        }
    }

    #[test]
    fn tick_rounding_is_exact() {
        assert_eq!(round_to_tick(0.4812, 0.001), 0.481);
        assert_eq!(round_to_tick(0.4815, 0.001), 0.482);
        assert_eq!(round_to_tick(0.5, 0.0), 0.5);
    }

    #[test]
    fn limit_open_crossing_fills_at_ask() {
        let mut ex = ex_cfg();
        ex.tick_size = 0.01;
        // bid 0.47 + one tick = 0.48 >= ask 0.48: taker-priced fill.
        let (entry, exec) = plan_open(0.47, 0.48, &ex);
        assert_eq!(entry, 0.48);
        assert_eq!(exec, OpenExecution::LimitFill);
    }

    #[test]
    fn limit_open_below_ask_falls_back() {
        let mut ex = ex_cfg();
        ex.tick_size = 0.001;
        let (entry, exec) = plan_open(0.45, 0.48, &ex);
        assert_eq!(entry, 0.48);
        assert_eq!(exec, OpenExecution::LimitTimeoutFallback);

        ex.open_limit_fallback_taker = false;
        let (entry, exec) = plan_open(0.45, 0.48, &ex);
        assert_eq!(entry, 0.0);
        assert_eq!(exec, OpenExecution::PendingSkip);
    }

    #[test]
    fn close_order_improves_inside_spread() {
        let ex = ex_cfg();
        let order = build_close_order(TradeSide::BuyYes, &row(0.470, 0.480, 0.50, 0.52), &ex);
        assert_eq!(order.limit_price, Some(0.471));
        assert_eq!(order.taker_price, 0.470);
    }

    #[test]
    fn force_taker_reason_crosses_immediately() {
        let ex = ex_cfg();
        let order = build_close_order(TradeSide::BuyYes, &row(0.40, 0.44, 0.54, 0.58), &ex);
        let mut pending = Some(PendingClose {
            created_ts: 0.0,
            last_reprice_ts: 0.0,
            attempts: 3,
            limit_price: 0.43,
            reason: CloseReason::HardStop25,
        });
        let res = resolve_limit_close(&mut pending, CloseReason::HardStop25, &order, &ex, 100.0);
        match res {
            CloseResolution::Fill { price, tag, .. } => {
                assert_eq!(price, 0.40);
                assert_eq!(tag, "close_force_taker");
            }
            CloseResolution::Pending { .. } => panic!("hard stop must not rest"),
        }
        assert!(pending.is_none());
    }

    #[test]
    fn ladder_reprices_then_times_out() {
        let ex = ex_cfg();
        let order = build_close_order(TradeSide::BuyYes, &row(0.40, 0.50, 0.54, 0.58), &ex);
        let mut pending: Option<PendingClose> = None;

        // First pass posts the limit inside the spread and rests.
        let res = resolve_limit_close(&mut pending, CloseReason::Tp50, &order, &ex, 1000.0);
        assert!(matches!(res, CloseResolution::Pending { .. }));
        let first_limit = pending.as_ref().unwrap().limit_price;
        assert!(first_limit > order.bid);

        // After a reprice interval the limit bumps toward the bid.
        let res = resolve_limit_close(&mut pending, CloseReason::Tp50, &order, &ex, 1005.0);
        assert!(matches!(res, CloseResolution::Pending { .. }));
        let st = pending.as_ref().unwrap();
        assert_eq!(st.attempts, 2);
        assert!(st.limit_price <= first_limit);

        // Past the timeout it falls back to the taker price.
        let res = resolve_limit_close(&mut pending, CloseReason::Tp50, &order, &ex, 1021.0);
        match res {
            CloseResolution::Fill { price, tag, .. } => {
                assert_eq!(tag, "close_limit_timeout_fallback");
                assert_eq!(price, 0.40);
            }
            CloseResolution::Pending { .. } => panic!("should have timed out"),
        }
        assert!(pending.is_none());
    }

    #[test]
    fn ladder_fills_when_bid_reaches_limit() {
        let ex = ex_cfg();
        let mut pending: Option<PendingClose> = None;
        let resting = build_close_order(TradeSide::BuyYes, &row(0.40, 0.50, 0.54, 0.58), &ex);
        let _ = resolve_limit_close(&mut pending, CloseReason::Tp50, &resting, &ex, 0.0);
        let limit = pending.as_ref().unwrap().limit_price;

        // Bid climbs up to the resting limit.
        let crossed = build_close_order(TradeSide::BuyYes, &row(limit, 0.50, 0.54, 0.58), &ex);
        let res = resolve_limit_close(&mut pending, CloseReason::Tp50, &crossed, &ex, 1.0);
        match res {
            CloseResolution::Fill { price, tag, .. } => {
                assert_eq!(tag, "close_limit_fill");
                assert_eq!(price, limit);
            }
            CloseResolution::Pending { .. } => panic!("bid at limit must fill"),
        }
    }
}
