use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which outcome token a trade buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "BUY_YES")]
    BuyYes,
    #[serde(rename = "BUY_NO")]
    BuyNo,
}

impl TradeSide {
    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::BuyYes => TradeSide::BuyNo,
            TradeSide::BuyNo => TradeSide::BuyYes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::BuyYes => "BUY_YES",
            TradeSide::BuyNo => "BUY_NO",
        }
    }

    /// "UP"/"DOWN" label used in model tags.
    pub fn direction_label(&self) -> &'static str {
        match self {
            TradeSide::BuyYes => "UP",
            TradeSide::BuyNo => "DOWN",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling market timeframes we generate slugs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    FiveMin,
    FifteenMin,
}

impl Timeframe {
    pub fn bucket_seconds(&self) -> u64 {
        match self {
            Timeframe::FiveMin => 300,
            Timeframe::FifteenMin => 900,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
        }
    }
}

/// Arb proximity classification for a market row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowSignal {
    Opportunity,
    Watch,
    NoOpportunity,
}

/// Immutable market reference produced by a discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRef {
    pub market_id: String,
    pub question: String,
    pub slug: String,
    pub yes_token: String,
    pub no_token: String,
    pub accepting_orders: bool,
    pub liquidity_hint: f64,
    pub yes_price_hint: f64,
    pub no_price_hint: f64,
    pub end_time: Option<DateTime<Utc>>,
    pub event_start_time: Option<DateTime<Utc>>,
    pub resolution_source: String,
}

impl MarketRef {
    pub fn is_btc(&self) -> bool {
        let hay = format!("{} {}", self.question, self.slug).to_lowercase();
        hay.contains("btc") || hay.contains("bitcoin")
    }

    /// Rough 5m/15m/other classification from slug and question text.
    pub fn timeframe_bucket(&self) -> &'static str {
        let slug = self.slug.to_lowercase();
        let q = self.question.to_lowercase();
        if slug.contains("15m") || q.contains("15 min") || q.contains("15-minute") {
            return "15m";
        }
        if slug.contains("5m") || q.contains("5 minute") || q.contains("5-minute") {
            return "5m";
        }
        "other"
    }

    pub fn end_ts(&self) -> Option<f64> {
        self.end_time.map(|dt| dt.timestamp_millis() as f64 / 1000.0)
    }
}

/// One price level of an order-book ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Per-cycle order-book snapshot for a single market (YES token keyed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market_id: String,
    pub token_id: String,
    pub question: String,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    pub depth_usd: f64,
    pub accepting_orders: bool,
    pub yes_hint: f64,
    pub no_hint: f64,
    pub yes_asks: Vec<BookLevel>,
    pub no_asks: Vec<BookLevel>,
}

/// One blended spot-price observation (0.4·chainlink + 0.6·binance, or
/// whichever source is available).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpotSample {
    pub ts: f64,
    pub price: f64,
    pub chainlink: Option<f64>,
    pub binance: Option<f64>,
}

/// Per-cycle display/trading row derived from a snapshot plus BTC context.
#[derive(Debug, Clone, Serialize)]
pub struct MarketRow {
    pub market_id: String,
    pub market_name: String,
    pub slug: String,
    pub best_bid_yes: f64,
    pub best_bid_no: f64,
    pub best_ask_yes: f64,
    pub best_ask_no: f64,
    pub ask_sum_no_fees: f64,
    pub ask_sum_with_fees: f64,
    pub signal: RowSignal,
    pub depth_usd: f64,
    pub spread_sum: f64,
    pub quality_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_left_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_current_binance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_price_source: Option<String>,
}

impl MarketRow {
    pub fn t_left(&self, now_ts: f64) -> f64 {
        match self.end_ts {
            Some(end) => (end - now_ts).max(0.0),
            None => 999_999.0,
        }
    }

    pub fn best_bid(&self, side: TradeSide) -> f64 {
        match side {
            TradeSide::BuyYes => self.best_bid_yes,
            TradeSide::BuyNo => self.best_bid_no,
        }
    }

    pub fn best_ask(&self, side: TradeSide) -> f64 {
        match side {
            TradeSide::BuyYes => self.best_ask_yes,
            TradeSide::BuyNo => self.best_ask_no,
        }
    }
}

/// Generate a rolling slug like `btc-updown-15m-1770933900`.
pub fn bucket_slug(prefix: &str, bucket_start_unix: u64) -> String {
    format!("{prefix}{bucket_start_unix}")
}
