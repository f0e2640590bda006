use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Market,
    LimitFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub data: DataConfig,
    pub scoring: ScoringConfig,
    pub execution: ExecutionConfig,
    pub strategy: StrategyConfig,
    pub paper: PaperConfig,
    pub storage: StorageConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: RunMode,
    pub loop_seconds: f64,
    pub event_driven: bool,
    pub min_cycle_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub clob_rest_base: String,
    pub gamma_base: String,
    pub crypto_price_base: String,
    pub clob_ws_url: String,
    pub rtds_ws_url: String,
    pub use_clob_ws: bool,
    pub max_markets: usize,
    pub focus_keywords: Vec<String>,
    pub focus_slugs: Vec<String>,
    pub focus_slug_prefixes: Vec<String>,
    pub alt_group_size: usize,
    pub alt_group_refresh_seconds: u64,
    pub alt_group_horizon_days: i64,
    pub alt_min_updates_per_min: f64,
    pub alt_vol_weight: f64,
    pub alt_max_spread_sum: f64,
    pub alt_group_topic_cap: usize,
    pub alt_vol_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub target_size_usd: f64,
    pub min_edge_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub open_mode: ExecMode,
    pub close_mode: ExecMode,
    pub tick_size: f64,
    pub open_limit_improve_ticks: u32,
    pub close_limit_improve_ticks: u32,
    pub close_limit_timeout_s: f64,
    pub close_limit_reprice_s: f64,
    pub open_limit_fallback_taker: bool,
    pub close_force_taker_reasons: Vec<String>,
    pub max_exec_sum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub trade_cap_usd: f64,
    pub max_trade_cash_fraction: f64,
    pub max_open_positions: usize,
    pub base_reentry_cooldown_s: f64,
    pub flip_reentry_cooldown_s: f64,
    pub min_hold_for_flip_exit_s: f64,
    pub flip_signal_conf_min: u8,
    pub flip_stop_loss_pct: f64,
    pub buy_no_flip_stop_loss_pct: f64,
    pub flip_stop_loss_lock_seconds: u64,
    pub global_flip_stop_pause_seconds: u64,
    pub global_flip_stop_window_seconds: u64,
    pub global_flip_stop_trigger_count: usize,
    pub normal_open_min_winner_stability: f64,
    pub normal_open_buy_yes_min_winner_stability: f64,
    pub normal_open_max_opposing_impulse_bps: f64,
    pub buy_yes_conf_floor: u8,
    pub buy_yes_consensus_floor: u8,
    pub buy_yes_reentry_cooldown_mult: f64,
    pub buy_no_conf_floor: u8,
    pub buy_no_consensus_floor: u8,
    pub buy_no_reentry_cooldown_mult: f64,
    pub scalp_min_impulse_bps: f64,
    pub scalp_buy_yes_min_impulse_bps: Option<f64>,
    pub scalp_buy_no_min_impulse_bps: Option<f64>,
    pub impulse_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub starting_cash_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: String,
    pub events_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub clob_host: String,
    pub chain_id: u64,
    pub signature_type: u8,
    pub order_type: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            data: DataConfig::default(),
            scoring: ScoringConfig::default(),
            execution: ExecutionConfig::default(),
            strategy: StrategyConfig::default(),
            paper: PaperConfig::default(),
            storage: StorageConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            loop_seconds: 15.0,
            event_driven: true,
            min_cycle_seconds: 0.2,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            clob_rest_base: "https://clob.polymarket.com".into(),
            gamma_base: "https://gamma-api.polymarket.com".into(),
            crypto_price_base: "https://polymarket.com/api".into(),
            clob_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".into(),
            rtds_ws_url: "wss://ws-live-data.polymarket.com".into(),
            use_clob_ws: true,
            max_markets: 10,
            focus_keywords: vec!["bitcoin".into(), "up or down".into()],
            focus_slugs: vec![],
            focus_slug_prefixes: vec!["btc-updown-15m-".into(), "btc-updown-5m-".into()],
            alt_group_size: 10,
            alt_group_refresh_seconds: 300,
            alt_group_horizon_days: 30,
            alt_min_updates_per_min: 3.0,
            alt_vol_weight: 0.60,
            alt_max_spread_sum: 0.12,
            alt_group_topic_cap: 3,
            alt_vol_window_seconds: 600,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            fee_bps: 50.0,
            slippage_bps: 25.0,
            target_size_usd: 20.0,
            min_edge_bps: 25.0,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            open_mode: ExecMode::LimitFirst,
            close_mode: ExecMode::LimitFirst,
            tick_size: 0.001,
            open_limit_improve_ticks: 1,
            close_limit_improve_ticks: 1,
            close_limit_timeout_s: 20.0,
            close_limit_reprice_s: 4.0,
            open_limit_fallback_taker: true,
            close_force_taker_reasons: vec![
                "hard_stop_25".into(),
                "resolved_loss_proxy".into(),
                "flip_stop".into(),
            ],
            max_exec_sum: 1.05,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trade_cap_usd: 100.0,
            max_trade_cash_fraction: 0.10,
            max_open_positions: 2,
            base_reentry_cooldown_s: 120.0,
            flip_reentry_cooldown_s: 240.0,
            min_hold_for_flip_exit_s: 20.0,
            flip_signal_conf_min: 62,
            flip_stop_loss_pct: -0.12,
            buy_no_flip_stop_loss_pct: -0.10,
            flip_stop_loss_lock_seconds: 480,
            global_flip_stop_pause_seconds: 900,
            global_flip_stop_window_seconds: 1200,
            global_flip_stop_trigger_count: 2,
            normal_open_min_winner_stability: 0.12,
            normal_open_buy_yes_min_winner_stability: 0.30,
            normal_open_max_opposing_impulse_bps: 3.0,
            buy_yes_conf_floor: 52,
            buy_yes_consensus_floor: 4,
            buy_yes_reentry_cooldown_mult: 1.20,
            buy_no_conf_floor: 52,
            buy_no_consensus_floor: 4,
            buy_no_reentry_cooldown_mult: 1.35,
            scalp_min_impulse_bps: 9.0,
            scalp_buy_yes_min_impulse_bps: None,
            scalp_buy_no_min_impulse_bps: None,
            impulse_source: "binance".into(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_cash_usd: 1000.0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: "data/state.json".into(),
            events_path: "data/events.jsonl".into(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            clob_host: "https://clob.polymarket.com".into(),
            chain_id: 137,
            signature_type: 1,
            order_type: "GTC".into(),
        }
    }
}

impl StrategyConfig {
    pub fn scalp_impulse_req(&self, buy_yes: bool) -> f64 {
        if buy_yes {
            self.scalp_buy_yes_min_impulse_bps
                .unwrap_or(self.scalp_min_impulse_bps)
        } else {
            self.scalp_buy_no_min_impulse_bps
                .unwrap_or(self.scalp_min_impulse_bps)
        }
    }
}

impl Config {
    /// Load configuration from a TOML document. Missing sections and keys
    /// fall back to defaults; secrets are never read from the file (env only).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Config = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.app.loop_seconds > 0.0,
            "app.loop_seconds must be positive"
        );
        anyhow::ensure!(
            self.app.min_cycle_seconds >= 0.0,
            "app.min_cycle_seconds must be non-negative"
        );
        anyhow::ensure!(
            self.paper.starting_cash_usd > 0.0,
            "paper.starting_cash_usd must be positive"
        );
        anyhow::ensure!(
            self.strategy.max_trade_cash_fraction > 0.0
                && self.strategy.max_trade_cash_fraction <= 1.0,
            "strategy.max_trade_cash_fraction must be in (0, 1]"
        );
        anyhow::ensure!(
            self.strategy.max_open_positions >= 1,
            "strategy.max_open_positions must be at least 1"
        );
        anyhow::ensure!(
            self.execution.tick_size > 0.0,
            "execution.tick_size must be positive"
        );
        anyhow::ensure!(
            !matches!(self.app.mode, RunMode::Live) || self.live.enabled,
            "app.mode = live requires live.enabled = true"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.app.loop_seconds, 15.0);
        assert_eq!(cfg.strategy.max_open_positions, 2);
        assert_eq!(cfg.execution.close_limit_timeout_s, 20.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_section_overrides() {
        let cfg: Config = toml::from_str(
            r#"
            [app]
            mode = "paper"
            loop_seconds = 5.0

            [strategy]
            trade_cap_usd = 50.0
            scalp_min_impulse_bps = 12.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.app.loop_seconds, 5.0);
        assert_eq!(cfg.strategy.trade_cap_usd, 50.0);
        // Per-side scalp floors fall back to the shared one.
        assert_eq!(cfg.strategy.scalp_impulse_req(true), 12.0);
        assert_eq!(cfg.strategy.scalp_impulse_req(false), 12.0);
        // Untouched sections keep defaults.
        assert_eq!(cfg.scoring.fee_bps, 50.0);
    }

    #[test]
    fn live_mode_requires_live_enabled() {
        let cfg: Config = toml::from_str(
            r#"
            [app]
            mode = "live"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
