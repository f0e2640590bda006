use anyhow::Result;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{Config, ExecMode, RunMode};
use crate::execution::bridge::{
    build_close_order, plan_open, resolve_limit_close, CloseResolution,
};
use crate::execution::live::LiveExecutor;
use crate::feeds::book_ws::BookFeed;
use crate::feeds::catalog::{CatalogClient, CryptoPriceClient, RESCUE_KEYWORDS};
use crate::feeds::snapshot::{build_row, SnapshotClient};
use crate::feeds::spot::{fetch_alt_price, SpotFeed};
use crate::models::event::{
    Event, LiveTradeEvent, OpportunityItem, PaperTradeEvent, TradeAction,
};
use crate::models::forecast::{Component, ForecastOutput};
use crate::models::market::{MarketRef, MarketRow, MarketSnapshot, RowSignal, Timeframe, TradeSide};
use crate::models::position::CloseReason;
use crate::risk::ledger::Ledger;
use crate::signals::forecaster::{compute_spot_signal, Forecaster};
use crate::signals::impulse::ImpulseTracker;
use crate::signals::scoring::{depth_aware_buy_prices, rank_candidates};
use crate::strategies::engine::StrategyEngine;
use crate::telemetry::events::EventLog;
use crate::telemetry::radar::{build_flow_watch, build_inefficiency_report, build_market_radar};

const ALT_POLL_MIN_INTERVAL_S: f64 = 1.0;
const TARGET_MISS_LOG_INTERVAL_S: f64 = 300.0;
const BTC_GROUP_TARGET: usize = 4;

#[derive(Debug, Serialize)]
struct CandidatePayload {
    market_id: String,
    market_name: String,
    side: String,
    edge_bps: f64,
    price: f64,
    best_ask_yes: f64,
    best_ask_no: f64,
    ask_sum_no_fees: f64,
    ask_sum_with_fees: f64,
    arb_under_1_no_fees: bool,
    arb_under_1_with_fees: bool,
    yes_no_exec_sum: f64,
    exec_edge_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_no_hint_sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    theo_edge_bps: Option<f64>,
    signal: RowSignal,
}

/// The engine: owns every component and drives one decision cycle at a
/// time. Background feeds run concurrently; all trading state is mutated
/// here only.
pub struct App {
    cfg: Config,
    catalog: CatalogClient,
    books: SnapshotClient,
    btc_prices: CryptoPriceClient,
    pub book_feed: Arc<BookFeed>,
    pub spot_feed: Arc<SpotFeed>,
    pub events: Arc<EventLog>,
    ledger: Ledger,
    engine: StrategyEngine,
    forecaster: Forecaster,
    impulses: ImpulseTracker,
    live: LiveExecutor,
    http: reqwest::Client,
    alt_cache: Vec<MarketRef>,
    alt_cache_ts: f64,
}

impl App {
    pub fn new(cfg: Config) -> Self {
        let catalog = CatalogClient::new(&cfg.data.gamma_base);
        let books = SnapshotClient::new(&cfg.data.clob_rest_base);
        let btc_prices = CryptoPriceClient::new(&cfg.data.crypto_price_base);
        let book_feed = Arc::new(BookFeed::new(&cfg.data.clob_ws_url));
        let spot_feed = Arc::new(SpotFeed::new(&cfg.data.rtds_ws_url));
        let events = Arc::new(EventLog::new(&cfg.storage.events_path));
        let ledger = Ledger::load(&cfg.storage.state_path, cfg.paper.starting_cash_usd);
        let engine = StrategyEngine::new(cfg.strategy.clone());
        let live = LiveExecutor::new(cfg.live.clone());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .expect("reqwest client");

        Self {
            cfg,
            catalog,
            books,
            btc_prices,
            book_feed,
            spot_feed,
            events,
            ledger,
            engine,
            forecaster: Forecaster::new(),
            impulses: ImpulseTracker::new(),
            live,
            http,
            alt_cache: Vec::new(),
            alt_cache_ts: 0.0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Reset the paper ledger (fresh session on restart in paper mode).
    pub fn reset_paper_state(&mut self) -> Result<()> {
        self.ledger = Ledger::new(self.cfg.paper.starting_cash_usd);
        self.ledger.save(&self.cfg.storage.state_path)
    }

    /// Start background workers: the two websocket readers plus the event
    /// forwarders that mirror feed ticks into the audit log.
    pub fn start_feeds(&self, shutdown_tx: &broadcast::Sender<()>) {
        if self.cfg.data.use_clob_ws {
            self.book_feed.start(shutdown_tx.subscribe());
        }
        self.spot_feed.start(shutdown_tx.subscribe());

        // Book ticks → ws_market_tick (+ ws_opportunity_seen on sub-1 sums).
        let events = self.events.clone();
        let mut rx = self.book_feed.subscribe_ticks();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = rx.recv() => match tick {
                        Ok(t) => {
                            events.append(&Event::WsMarketTick {
                                market_id: t.market_id.clone(),
                                market_name: t.market_name.clone(),
                                best_ask_yes: t.best_ask_yes,
                                best_ask_no: t.best_ask_no,
                                ask_sum_no_fees: t.ask_sum_no_fees,
                                ws_asset_id: t.ws_asset_id.clone(),
                                ws_ts: t.ws_ts,
                            });
                            // Emission threshold is inclusive.
                            if let Some(sum) = t.ask_sum_no_fees.filter(|s| *s <= 1.0) {
                                events.append(&Event::WsOpportunitySeen {
                                    count: 1,
                                    items: vec![OpportunityItem {
                                        market_id: t.market_id,
                                        market_name: t.market_name,
                                        best_ask_yes: t.best_ask_yes,
                                        best_ask_no: t.best_ask_no,
                                        ask_sum_no_fees: sum,
                                    }],
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });

        // Spot ticks → btc_price_tick.
        let events = self.events.clone();
        let mut rx = self.spot_feed.subscribe_ticks();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = rx.recv() => match tick {
                        Ok(t) => events.append(&Event::BtcPriceTick {
                            chainlink: t.chainlink,
                            binance: t.binance,
                            ts: t.ts,
                            symbol: t.symbol,
                        }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn discover(&mut self) -> Result<(Vec<MarketRef>, Vec<MarketRef>, Vec<MarketRef>)> {
        let data = self.cfg.data.clone();

        let mut refs = self
            .catalog
            .fetch_active_refs(data.max_markets, &data.focus_keywords)
            .await?;
        let slug_refs = self.catalog.fetch_refs_by_slugs(&data.focus_slugs).await;
        let prefix_refs = self
            .catalog
            .fetch_refs_by_slug_prefixes(
                &data.focus_slug_prefixes,
                (data.max_markets * 10).max(200),
                true,
            )
            .await?;
        // Wider rolling windows reduce discovery gaps around rollovers.
        let gen_15m = self
            .catalog
            .fetch_refs_by_generated_slugs(&data.focus_slug_prefixes, Timeframe::FifteenMin, 16, 8)
            .await;
        let gen_5m = self
            .catalog
            .fetch_refs_by_generated_slugs(&data.focus_slug_prefixes, Timeframe::FiveMin, 24, 24)
            .await;

        let mut by_id: HashMap<String, MarketRef> = HashMap::new();
        for r in refs
            .drain(..)
            .chain(slug_refs)
            .chain(prefix_refs)
            .chain(gen_15m)
            .chain(gen_5m)
        {
            by_id.insert(r.market_id.clone(), r);
        }
        let mut refs: Vec<MarketRef> = by_id.into_values().collect();

        // Rescue path: retry broad active markets and keep BTC-ish names.
        if refs.is_empty() {
            let broad = self
                .catalog
                .fetch_active_refs((data.max_markets * 20).max(300), &[])
                .await?;
            refs = broad
                .into_iter()
                .filter(|r| {
                    let q = r.question.to_lowercase();
                    RESCUE_KEYWORDS.iter().any(|k| q.contains(k))
                })
                .take(20)
                .collect();
        }

        // Last resort: latest-by-prefix listing keeps rolling series
        // visible even when everything active has rolled over.
        if refs.is_empty() && !data.focus_slug_prefixes.is_empty() {
            let fallback = self
                .catalog
                .fetch_refs_by_slug_prefixes(&data.focus_slug_prefixes, 500, false)
                .await?;
            refs = fallback.into_iter().take(3).collect();
            self.events.append(&Event::FocusFallback {
                reason: "no_active_focus_markets".into(),
                selected_market_ids: refs.iter().map(|r| r.market_id.clone()).collect(),
            });
        }

        let btc_refs = refs.clone();

        // Secondary monitor group, cached between refreshes.
        let now_ts = Utc::now().timestamp_millis() as f64 / 1000.0;
        if self.alt_cache.is_empty()
            || now_ts - self.alt_cache_ts > data.alt_group_refresh_seconds as f64
        {
            match self.catalog.fetch_alt_refs(data.alt_group_horizon_days).await {
                Ok(cands) => {
                    let keep = (data.alt_group_size * 4).max(30);
                    self.alt_cache = cands.into_iter().take(keep).collect();
                    self.alt_cache_ts = now_ts;
                }
                Err(e) => warn!("alt discovery failed: {e}"),
            }
        }
        let alt_refs: Vec<MarketRef> = self
            .alt_cache
            .iter()
            .take((data.alt_group_size * 3).max(20))
            .cloned()
            .collect();

        let mut combined: HashMap<String, MarketRef> = HashMap::new();
        for r in btc_refs.iter().chain(alt_refs.iter()) {
            combined.insert(r.market_id.clone(), r.clone());
        }
        Ok((combined.into_values().collect(), btc_refs, alt_refs))
    }

    /// Serialize a BTC row together with its forecast annotations for the
    /// market_groups payload.
    fn btc_row_json(row: &MarketRow, forecast: &ForecastOutput) -> Value {
        let mut v = serde_json::to_value(row).unwrap_or_else(|_| json!({}));
        if let Some(obj) = v.as_object_mut() {
            let p_yes = forecast.p_yes_ensemble;
            obj.insert("p_yes_model".into(), json!(p_yes));
            obj.insert("p_no_model".into(), json!(1.0 - p_yes));
            obj.insert("p_hit_target".into(), json!(forecast.p_hit_target));
            obj.insert(
                "p_anchor".into(),
                json!(forecast.component_probs.anchor),
            );
            obj.insert("best_model".into(), json!(forecast.best_model_label()));
            obj.insert("model_side".into(), json!(forecast.predicted_side));
            obj.insert("model_confidence".into(), json!(forecast.confidence));
            obj.insert("model_consensus".into(), json!(forecast.consensus));
            obj.insert(
                "edge_yes".into(),
                json!(p_yes - row.best_ask_yes),
            );
            obj.insert(
                "edge_no".into(),
                json!((1.0 - p_yes) - row.best_ask_no),
            );
        }
        v
    }

    /// One full decision cycle.
    pub async fn run_once(&mut self) -> Result<()> {
        let now_dt = Utc::now();
        let now_ts = now_dt.timestamp_millis() as f64 / 1000.0;
        self.catalog.reset_call_count();
        self.books.reset_call_count();

        let (refs, btc_refs, alt_refs) = match self.discover().await {
            Ok(out) => out,
            Err(e) => {
                self.events.append(&Event::AdapterError {
                    source: "gamma_clob".into(),
                    error: e.to_string(),
                });
                (Vec::new(), Vec::new(), Vec::new())
            }
        };

        let use_ws = self.cfg.data.use_clob_ws;
        if use_ws && !refs.is_empty() {
            let tokens: Vec<String> = refs
                .iter()
                .flat_map(|r| [r.yes_token.clone(), r.no_token.clone()])
                .collect();
            self.book_feed.subscribe_assets(tokens);
            self.book_feed.set_token_meta(&refs);
        }

        let mut snapshots = self.books.fetch_snapshots(&refs).await;

        // Stream overrides beat REST staleness when present.
        if use_ws {
            let no_token_by_market: HashMap<&str, &str> = refs
                .iter()
                .map(|r| (r.market_id.as_str(), r.no_token.as_str()))
                .collect();
            let mut ws_updates: u32 = 0;
            for s in snapshots.iter_mut() {
                let (yb, ya) = self.book_feed.get_best(&s.token_id);
                if let Some(b) = yb.filter(|b| *b > 0.0) {
                    s.yes_bid = b;
                    ws_updates += 1;
                }
                if let Some(a) = ya.filter(|a| *a > 0.0) {
                    s.yes_ask = a;
                    ws_updates += 1;
                }
                if let Some(no_token) = no_token_by_market.get(s.market_id.as_str()) {
                    let (nb, na) = self.book_feed.get_best(no_token);
                    if let Some(b) = nb.filter(|b| *b > 0.0) {
                        s.no_bid = b;
                        ws_updates += 1;
                    }
                    if let Some(a) = na.filter(|a| *a > 0.0) {
                        s.no_ask = a;
                        ws_updates += 1;
                    }
                }
            }
            let stats = self.book_feed.stats();
            self.events.append(&Event::WsUsage {
                enabled: true,
                updates_applied: ws_updates,
                asset_count: stats.asset_count,
                tracked_count: stats.tracked_count,
                last_msg_ts: stats.last_msg_ts,
                alive: stats.alive,
            });
        }

        if snapshots.is_empty() {
            self.events.append(&Event::MarketScanEmpty {
                reason: "no_markets_for_focus_keywords".into(),
                focus_keywords: self.cfg.data.focus_keywords.clone(),
            });
            info!("no focused live markets found; skipping cycle");
            return Ok(());
        }

        let scoring = self.cfg.scoring.clone();
        let ranked = rank_candidates(&snapshots, &scoring);

        // Ops intel reports.
        let radar = build_market_radar(&snapshots, 8);
        let ineff = build_inefficiency_report(
            &snapshots,
            scoring.fee_bps,
            scoring.slippage_bps,
            scoring.target_size_usd,
            8,
        );
        let flow = build_flow_watch(&snapshots, 8);
        self.events.append(&Event::MarketRadar {
            count: radar.len(),
            top: serde_json::to_value(&radar).unwrap_or(Value::Null),
        });
        self.events.append(&Event::InefficiencyReport {
            count: ineff.len(),
            top: serde_json::to_value(&ineff).unwrap_or(Value::Null),
        });
        self.events.append(&Event::FlowWatch {
            count: flow.len(),
            top: serde_json::to_value(&flow).unwrap_or(Value::Null),
        });

        let snap_by_market: HashMap<&str, &MarketSnapshot> =
            snapshots.iter().map(|s| (s.market_id.as_str(), s)).collect();
        let ref_by_market: HashMap<&str, &MarketRef> =
            refs.iter().map(|r| (r.market_id.as_str(), r)).collect();

        let mut top_payload = Vec::new();
        for c in ranked.iter().take(10) {
            let Some(s) = snap_by_market.get(c.market_id.as_str()) else {
                continue;
            };
            let (yb, nb) = depth_aware_buy_prices(s, scoring.target_size_usd);
            let exec_sum = yb + nb;
            let exec_edge_bps =
                (1.0 - exec_sum) * 10_000.0 - scoring.fee_bps - scoring.slippage_bps;
            let ask_sum_no_fees = s.yes_ask + s.no_ask;
            let ask_sum_with_fees =
                ask_sum_no_fees + (scoring.fee_bps + scoring.slippage_bps) / 10_000.0;
            let (hint_sum, theo_edge) = if s.yes_hint > 0.0 && s.no_hint > 0.0 {
                let hs = s.yes_hint + s.no_hint;
                (
                    Some(hs),
                    Some((1.0 - hs) * 10_000.0 - scoring.fee_bps - scoring.slippage_bps),
                )
            } else {
                (None, None)
            };
            let signal = if ask_sum_with_fees < 1.0 {
                RowSignal::Opportunity
            } else if ask_sum_no_fees < 1.0 {
                RowSignal::Watch
            } else {
                RowSignal::NoOpportunity
            };
            top_payload.push(CandidatePayload {
                market_id: c.market_id.clone(),
                market_name: s.question.clone(),
                side: c.side.as_str().to_string(),
                edge_bps: c.edge_bps,
                price: c.expected_price,
                best_ask_yes: s.yes_ask,
                best_ask_no: s.no_ask,
                ask_sum_no_fees,
                ask_sum_with_fees,
                arb_under_1_no_fees: ask_sum_no_fees < 1.0,
                arb_under_1_with_fees: ask_sum_with_fees < 1.0,
                yes_no_exec_sum: exec_sum,
                exec_edge_bps,
                yes_no_hint_sum: hint_sum,
                theo_edge_bps: theo_edge,
                signal,
            });
        }

        let opportunity_items: Vec<OpportunityItem> = top_payload
            .iter()
            .filter(|t| t.ask_sum_no_fees <= 1.0)
            .map(|t| OpportunityItem {
                market_id: t.market_id.clone(),
                market_name: t.market_name.clone(),
                best_ask_yes: Some(t.best_ask_yes),
                best_ask_no: Some(t.best_ask_no),
                ask_sum_no_fees: t.ask_sum_no_fees,
            })
            .collect();
        self.events.append(&Event::OpportunitySeen {
            count: opportunity_items.len(),
            items: opportunity_items,
        });
        self.events.append(&Event::MarketScan {
            snapshot_count: snapshots.len(),
            top_candidates: serde_json::to_value(&top_payload).unwrap_or(Value::Null),
        });
        self.events.append(&Event::ApiUsage {
            gamma_calls: self.catalog.call_count(),
            clob_calls: self.books.call_count(),
            total_calls: self.catalog.call_count() + self.books.call_count(),
            snapshot_count: snapshots.len(),
        });

        info!(
            "snapshots={} ranked={} cash=${:.2}",
            snapshots.len(),
            ranked.len(),
            self.ledger.cash_usd
        );

        // ── BTC group: newest 3×15m + newest 1×5m, padded to four. ──
        let btc_ids: HashSet<&str> = btc_refs.iter().map(|r| r.market_id.as_str()).collect();
        let alt_ids: HashSet<&str> = alt_refs
            .iter()
            .map(|r| r.market_id.as_str())
            .filter(|id| !btc_ids.contains(id))
            .collect();

        let mut rows_by_market: HashMap<String, MarketRow> = snapshots
            .iter()
            .map(|s| {
                let r = ref_by_market.get(s.market_id.as_str()).copied();
                (s.market_id.clone(), build_row(s, r, &scoring))
            })
            .collect();

        let mut btc_candidates: Vec<(f64, String)> = btc_ids
            .iter()
            .filter_map(|id| {
                let row = rows_by_market.get(*id)?;
                let end = row.end_ts?;
                if end < now_ts {
                    return None;
                }
                Some((end, (*id).to_string()))
            })
            .collect();
        btc_candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let bucket_of = |id: &str| -> &'static str {
            ref_by_market
                .get(id)
                .map(|r| r.timeframe_bucket())
                .unwrap_or("other")
        };
        let mut selected: Vec<String> = Vec::new();
        for (_, id) in btc_candidates.iter().filter(|(_, id)| bucket_of(id) == "15m") {
            if selected.len() >= 3 {
                break;
            }
            selected.push(id.clone());
        }
        if let Some((_, id)) = btc_candidates.iter().find(|(_, id)| bucket_of(id) == "5m") {
            if !selected.contains(id) {
                selected.push(id.clone());
            }
        }
        for (_, id) in &btc_candidates {
            if selected.len() >= BTC_GROUP_TARGET {
                break;
            }
            if !selected.contains(id) {
                selected.push(id.clone());
            }
        }
        if selected.len() < BTC_GROUP_TARGET {
            let mut fill: Vec<&MarketRow> = btc_ids
                .iter()
                .filter_map(|id| rows_by_market.get(*id))
                .filter(|r| !selected.contains(&r.market_id))
                .collect();
            fill.sort_by(|a, b| {
                a.ask_sum_with_fees
                    .total_cmp(&b.ask_sum_with_fees)
                    .then(b.depth_usd.total_cmp(&a.depth_usd))
            });
            for r in fill.into_iter().take(BTC_GROUP_TARGET - selected.len()) {
                selected.push(r.market_id.clone());
            }
        }

        // ── BTC context: targets, live prices, forecasts. ──
        let (chainlink_live, binance_live) = self.spot_feed.live_prices();
        let spot_signal = compute_spot_signal(&self.spot_feed.signal_window());

        let mut traded_rows: Vec<(MarketRow, ForecastOutput)> = Vec::new();
        for market_id in &selected {
            let Some(row) = rows_by_market.get_mut(market_id) else {
                continue;
            };
            let r = ref_by_market.get(market_id.as_str()).copied();

            let end_time = r.and_then(|r| r.end_time);
            let event_start = r.and_then(|r| r.event_start_time).or_else(|| {
                // Rolling windows omit the start; infer from the end.
                end_time.map(|e| e - ChronoDuration::minutes(15))
            });

            let (mut target, mut current) = self
                .btc_prices
                .window_prices(event_start, end_time, "fifteen")
                .await;
            if current.is_none() {
                current = chainlink_live.or(binance_live);
            }

            // Fallbacks for a missing target: per-market cache, the spot
            // sample nearest the window start, then the first live price
            // seen after start.
            let started = event_start.is_some_and(|st| now_dt >= st);
            if target.is_none() {
                target = self.engine.memory.get(market_id).and_then(|m| m.btc_target);
            }
            if target.is_none() && started {
                let st_ts = event_start
                    .map(|st| st.timestamp_millis() as f64 / 1000.0)
                    .unwrap_or(now_ts);
                target = self
                    .spot_feed
                    .price_near_ts(st_ts, 1200.0)
                    .or(current);
            }

            let mem = self.engine.memory.market(market_id);
            if let Some(t) = target {
                mem.btc_target = Some(t);
            } else if now_ts - mem.target_miss_logged_ts >= TARGET_MISS_LOG_INTERVAL_S {
                mem.target_miss_logged_ts = now_ts;
                self.events.append(&Event::BtcTargetMissing {
                    market_id: market_id.clone(),
                    event_start_time: event_start
                        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    end_date: end_time.map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true)),
                });
            }

            row.btc_target = target;
            row.btc_current = current;
            row.btc_current_binance = binance_live;
            row.btc_price_source = Some(
                r.map(|r| r.resolution_source.clone())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "https://data.chain.link/streams/btc-usd".into()),
            );
            row.end_ts = end_time.map(|e| e.timestamp_millis() as f64 / 1000.0);
            row.t_left_s = row.end_ts.map(|e| (e - now_ts).max(0.0));

            let forecast = self.forecaster.forecast(
                row,
                &spot_signal,
                &self.engine.memory.global.model_stats,
                now_ts,
            );
            if target.is_some() {
                traded_rows.push((row.clone(), forecast));
            }
        }

        // ── Secondary group: stream-activity filter, composite rank,
        //    topic diversity cap. ──
        let ws_metrics = if use_ws {
            self.book_feed
                .market_metrics(self.cfg.data.alt_vol_window_seconds)
        } else {
            HashMap::new()
        };
        let data = &self.cfg.data;
        let mut alt_scored: Vec<(f64, f64, f64, &MarketRow)> = Vec::new();
        for id in &alt_ids {
            let Some(row) = rows_by_market.get(*id) else {
                continue;
            };
            let m = ws_metrics.get(*id);
            let updates = m.map(|m| m.updates_per_min).unwrap_or(0.0);
            let vol = m.map(|m| m.ask_volatility).unwrap_or(0.0);
            if updates < data.alt_min_updates_per_min {
                continue;
            }
            if row.spread_sum > data.alt_max_spread_sum {
                continue;
            }
            let arb_dist = (row.ask_sum_no_fees - 1.0).abs();
            let arb_score = (1.0 - (arb_dist / 0.05).min(1.0)).max(0.0);
            let vol_score = (vol / 0.05).min(1.0);
            let activity_score = (updates / 40.0).min(1.0);
            // Volatility first, activity second, arb proximity third.
            let composite = data.alt_vol_weight * vol_score
                + 0.25 * activity_score
                + (0.75 - data.alt_vol_weight).max(0.0) * arb_score;
            alt_scored.push((composite, updates, -arb_dist, row));
        }
        alt_scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(b.1.total_cmp(&a.1))
                .then(b.2.total_cmp(&a.2))
        });

        let mut alt_rows: Vec<&MarketRow> = Vec::new();
        let mut topic_counts: HashMap<&'static str, usize> = HashMap::new();
        for (_, _, _, row) in &alt_scored {
            if alt_rows.len() >= data.alt_group_size {
                break;
            }
            let topic = ref_by_market
                .get(row.market_id.as_str())
                .map(|r| crate::feeds::catalog::topic_bucket(&r.question, &r.slug))
                .unwrap_or("other");
            let count = topic_counts.entry(topic).or_insert(0);
            if *count >= data.alt_group_topic_cap {
                continue;
            }
            *count += 1;
            alt_rows.push(row);
        }

        let alt_enabled = data.alt_group_size > 0;
        let bitcoin_json: Vec<Value> = traded_rows
            .iter()
            .map(|(row, f)| Self::btc_row_json(row, f))
            .collect();
        let secondary_json: Vec<Value> = alt_rows
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect();
        let secondary_note = if alt_enabled {
            format!(
                "Non-BTC markets resolving within {} days, ranked by paired YES+NO arb proximity (sum toward <1)",
                data.alt_group_horizon_days
            )
        } else {
            "Secondary group disabled (BTC-only focus)".to_string()
        };
        self.events.append(&Event::MarketGroups {
            bitcoin: Value::Array(bitcoin_json),
            secondary: Value::Array(secondary_json),
            secondary_note,
            counts: json!({"bitcoin": traded_rows.len(), "secondary": alt_rows.len()}),
        });

        // ── Impulse sampling. ──
        let impulse_source = self.cfg.strategy.impulse_source.to_lowercase();
        if let Some(bi) = binance_live {
            self.impulses.push("binance", bi, now_ts);
        }
        if matches!(impulse_source.as_str(), "coinbase" | "kraken" | "bybit")
            && self
                .impulses
                .should_poll(&impulse_source, now_ts, ALT_POLL_MIN_INTERVAL_S)
        {
            if let Some(px) = fetch_alt_price(&self.http, &impulse_source).await {
                self.impulses.push(&impulse_source, px, now_ts);
            }
        }
        let impulse = self.impulses.impulse(&impulse_source);

        // ── Trade lifecycle per BTC row. ──
        let live_enabled = self.cfg.app.mode == RunMode::Live && self.cfg.live.enabled;
        let token_ids_by_market: HashMap<&str, (&str, &str)> = btc_refs
            .iter()
            .map(|r| {
                (
                    r.market_id.as_str(),
                    (r.yes_token.as_str(), r.no_token.as_str()),
                )
            })
            .collect();
        let ex_cfg = self.cfg.execution.clone();

        for (row, forecast) in &traded_rows {
            let market_id = row.market_id.as_str();
            let Some(inputs) = self.engine.observe(row, forecast, now_ts) else {
                continue;
            };
            let open_positions = self.ledger.open_count();
            self.events.append(&Event::StrategySnapshot(
                self.engine
                    .snapshot_event(row, forecast, &inputs, open_positions, now_ts),
            ));

            let open_pos = self.ledger.open_position_for(market_id).cloned();

            let Some(pos) = open_pos else {
                let Some(plan) = self.engine.evaluate_open(
                    row,
                    forecast,
                    &inputs,
                    &impulse,
                    false,
                    open_positions,
                    self.ledger.cash_usd,
                    now_ts,
                ) else {
                    continue;
                };
                let bid = row.best_bid(plan.side);
                let ask = row.best_ask(plan.side);
                let (entry, open_exec) = plan_open(bid, ask, &ex_cfg);
                if entry <= 0.0 || plan.size_usd < 1.0 {
                    continue;
                }

                let mut live_order_id = None;
                if live_enabled {
                    let token = token_ids_by_market
                        .get(market_id)
                        .map(|(y, n)| match plan.side {
                            TradeSide::BuyYes => *y,
                            TradeSide::BuyNo => *n,
                        })
                        .unwrap_or("");
                    let qty = plan.size_usd / entry;
                    let res = self
                        .live
                        .place(token, "BUY", entry, qty, open_exec.is_post_only())
                        .await;
                    self.events.append(&Event::LiveTrade(LiveTradeEvent {
                        action: TradeAction::OpenSubmit,
                        market_id: market_id.to_string(),
                        market_name: row.market_name.clone(),
                        reason: None,
                        token_id: Some(token.to_string()),
                        side: plan.side,
                        price: entry,
                        qty,
                        open_execution: Some(open_exec.tag().to_string()),
                        close_execution: None,
                        ok: res.ok,
                        order_id: res.order_id.clone(),
                        error: res.error.clone(),
                    }));
                    if !res.ok {
                        warn!("live open failed for {market_id}: {:?}", res.error);
                        continue;
                    }
                    live_order_id = res.order_id;
                }

                let pos = match self.ledger.open(
                    market_id,
                    &row.market_name,
                    plan.side,
                    entry,
                    plan.size_usd,
                    &plan.model_tag,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("open rejected for {market_id}: {e}");
                        continue;
                    }
                };
                self.ledger.set_entry_edge(pos.id, inputs.edge_on(plan.side));

                let mut ev = PaperTradeEvent::new(
                    TradeAction::Open,
                    market_id,
                    &row.market_name,
                    plan.side,
                );
                ev.size_usd = Some(pos.notional_usd);
                ev.entry_price = Some(pos.entry_price);
                ev.opened_at = Some(pos.opened_at);
                ev.model = Some(plan.model_tag.clone());
                ev.open_execution = Some(open_exec.tag().to_string());
                ev.live_order_id = live_order_id;
                ev.confidence = Some(forecast.confidence);
                ev.consensus = Some(forecast.consensus);
                ev.winner_side = Some(inputs.winner_side);
                ev.winner_stability = Some(inputs.winner_stability);
                ev.p_hit_target = Some(forecast.p_hit_target);
                ev.impulse_bps_3s = Some(impulse.bps_3s);
                ev.edge_yes = Some(inputs.edge_yes);
                ev.edge_no = Some(inputs.edge_no);
                self.events.append(&Event::PaperTrade(ev));
                info!(
                    "OPEN {market_id} {} size=${:.2} price={:.4} exec={} model={}",
                    plan.side,
                    pos.notional_usd,
                    pos.entry_price,
                    open_exec.tag(),
                    plan.model_tag
                );
                continue;
            };

            // ── Close path. ──
            let mark = row.best_ask(pos.side);
            if mark <= 0.0 {
                continue;
            }
            let held_edge = inputs.edge_on(pos.side);
            let peak = self.ledger.touch_edge_peak(pos.id, held_edge);
            let held_s = pos.held_seconds(now_dt);

            let Some(decision) =
                self.engine
                    .evaluate_close(&pos, forecast, &inputs, mark, held_s, peak)
            else {
                continue;
            };

            let order = build_close_order(pos.side, row, &ex_cfg);
            let (exit_price, execution_tag, close_meta) =
                if order.mode == ExecMode::Market || decision.fraction < 1.0 {
                    // Partial closes never rest on the book.
                    (order.taker_price, "close_market", None)
                } else {
                    let pending = &mut self.engine.memory.market(market_id).pending_close;
                    match resolve_limit_close(pending, decision.reason, &order, &ex_cfg, now_ts) {
                        CloseResolution::Fill { price, tag, meta } => (price, tag, meta),
                        CloseResolution::Pending { meta } => {
                            let mut ev = PaperTradeEvent::new(
                                TradeAction::ClosePending,
                                market_id,
                                &row.market_name,
                                pos.side,
                            );
                            ev.reason = Some(decision.reason);
                            ev.model_open = Some(pos.model_open.clone());
                            ev.close_execution = Some("limit_first".into());
                            ev.close_meta = Some(meta);
                            self.events.append(&Event::PaperTrade(ev));
                            continue;
                        }
                    }
                };
            if exit_price <= 0.0 {
                continue;
            }

            let mut live_order_id = None;
            if live_enabled {
                let token = token_ids_by_market
                    .get(market_id)
                    .map(|(y, n)| match pos.side {
                        TradeSide::BuyYes => *y,
                        TradeSide::BuyNo => *n,
                    })
                    .unwrap_or("");
                let qty_close = pos.qty * decision.fraction;
                let res = self
                    .live
                    .place(
                        token,
                        "SELL",
                        exit_price,
                        qty_close,
                        execution_tag == "close_limit_fill",
                    )
                    .await;
                self.events.append(&Event::LiveTrade(LiveTradeEvent {
                    action: if decision.fraction >= 1.0 {
                        TradeAction::CloseSubmit
                    } else {
                        TradeAction::PartialCloseSubmit
                    },
                    market_id: market_id.to_string(),
                    market_name: row.market_name.clone(),
                    reason: Some(decision.reason),
                    token_id: Some(token.to_string()),
                    side: pos.side,
                    price: exit_price,
                    qty: qty_close,
                    open_execution: None,
                    close_execution: Some(execution_tag.to_string()),
                    ok: res.ok,
                    order_id: res.order_id.clone(),
                    error: res.error.clone(),
                }));
                if !res.ok {
                    warn!("live close failed for {market_id}: {:?}", res.error);
                    continue;
                }
                live_order_id = res.order_id;
            }

            let best_model = forecast.best_model_label();
            self.ledger
                .set_close_attribution(pos.id, &best_model, decision.reason);

            let (pnl, updated) = if decision.fraction >= 1.0 {
                self.engine.memory.market(market_id).pending_close = None;
                match self.ledger.close(pos.id, exit_price) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("close rejected for {market_id}: {e}");
                        continue;
                    }
                }
            } else {
                match self
                    .ledger
                    .close_fraction(pos.id, exit_price, decision.fraction)
                {
                    Ok(out) => out,
                    Err(e) => {
                        warn!("partial close rejected for {market_id}: {e}");
                        continue;
                    }
                }
            };

            if decision.fraction >= 1.0 {
                // Model learning only on full closes, attributed to the
                // component that opened the trade.
                if let Some(component) = Component::from_tag(&pos.model_open) {
                    self.engine
                        .memory
                        .global
                        .model_stats
                        .record(component, pnl);
                }
                let guardrails =
                    self.engine
                        .apply_close(market_id, decision.reason, pos.side, pnl, now_ts);
                for g in guardrails {
                    self.events.append(&Event::MarketGuardrail(g));
                }
            } else if decision.reason == CloseReason::Tp35Half {
                self.ledger.mark_tp35_taken(pos.id);
            }

            let mut ev = PaperTradeEvent::new(
                if decision.fraction >= 1.0 {
                    TradeAction::Close
                } else {
                    TradeAction::PartialClose
                },
                market_id,
                &row.market_name,
                pos.side,
            );
            ev.reason = Some(decision.reason);
            ev.fraction = Some(decision.fraction);
            ev.entry_price = Some(pos.entry_price);
            ev.exit_price = Some(exit_price);
            ev.opened_at = Some(pos.opened_at);
            ev.closed_at = updated.closed_at;
            ev.pnl_usd = Some(pnl);
            ev.model_open = Some(pos.model_open.clone());
            ev.model_close = Some(best_model);
            ev.close_execution = Some(execution_tag.to_string());
            ev.close_meta = close_meta;
            ev.live_order_id = live_order_id;
            ev.confidence = Some(forecast.confidence);
            ev.held_edge = Some(held_edge);
            ev.opp_edge = Some(inputs.edge_on(pos.side.opposite()));
            self.events.append(&Event::PaperTrade(ev));
            if decision.fraction >= 1.0 {
                self.events.append(&Event::ModelStats {
                    stats: self.engine.memory.global.model_stats.clone(),
                });
            }
            info!(
                "{} {market_id} {} reason={} exec={execution_tag} pnl=${pnl:.2}",
                if decision.fraction >= 1.0 {
                    "CLOSE"
                } else {
                    "PARTIAL"
                },
                pos.side,
                decision.reason
            );
        }

        self.ledger.save(&self.cfg.storage.state_path)?;
        info!(
            "state cash=${:.2} positions={} pnl=${:.2}",
            self.ledger.cash_usd,
            self.ledger.open_count(),
            self.ledger.realized_pnl_usd
        );
        Ok(())
    }
}
