use serde::{Deserialize, Serialize};

use super::market::TradeSide;

/// Closed set of forecast ensemble components.
///
/// TA/LL/RG/BK carry learned weights from realized trade outcomes;
/// ANCHOR and MC_CLOSE are weighted by time-to-expiry only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "TA")]
    Ta,
    #[serde(rename = "LL")]
    Ll,
    #[serde(rename = "RG")]
    Rg,
    #[serde(rename = "BK")]
    Bk,
    #[serde(rename = "ANCHOR")]
    Anchor,
    #[serde(rename = "MC_CLOSE")]
    McClose,
}

impl Component {
    pub const ALL: [Component; 6] = [
        Component::Ta,
        Component::Ll,
        Component::Rg,
        Component::Bk,
        Component::Anchor,
        Component::McClose,
    ];

    /// Components whose weight is learned from model stats.
    pub const LEARNED: [Component; 4] =
        [Component::Ta, Component::Ll, Component::Rg, Component::Bk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Ta => "TA",
            Component::Ll => "LL",
            Component::Rg => "RG",
            Component::Bk => "BK",
            Component::Anchor => "ANCHOR",
            Component::McClose => "MC_CLOSE",
        }
    }

    /// Parse the component prefix out of an opening model tag like
    /// `"TA:UP 63%"`. Scalp tags (`"SCALP:..."`) do not attribute.
    pub fn from_tag(tag: &str) -> Option<Component> {
        let prefix = tag.split(':').next().unwrap_or("");
        Component::ALL.into_iter().find(|c| c.as_str() == prefix)
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Realized outcome tally for one learned component.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentStats {
    pub trades: u64,
    pub wins: u64,
    pub pnl: f64,
}

/// Rolling per-component trade attribution, keyed by the closed enum so
/// weight updates cannot miss a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStats {
    #[serde(rename = "TA")]
    pub ta: ComponentStats,
    #[serde(rename = "LL")]
    pub ll: ComponentStats,
    #[serde(rename = "RG")]
    pub rg: ComponentStats,
    #[serde(rename = "BK")]
    pub bk: ComponentStats,
}

impl ModelStats {
    fn slot_mut(&mut self, c: Component) -> Option<&mut ComponentStats> {
        match c {
            Component::Ta => Some(&mut self.ta),
            Component::Ll => Some(&mut self.ll),
            Component::Rg => Some(&mut self.rg),
            Component::Bk => Some(&mut self.bk),
            Component::Anchor | Component::McClose => None,
        }
    }

    fn slot(&self, c: Component) -> Option<&ComponentStats> {
        match c {
            Component::Ta => Some(&self.ta),
            Component::Ll => Some(&self.ll),
            Component::Rg => Some(&self.rg),
            Component::Bk => Some(&self.bk),
            Component::Anchor | Component::McClose => None,
        }
    }

    /// Record a full-close outcome against the component that opened the trade.
    pub fn record(&mut self, c: Component, pnl: f64) {
        if let Some(s) = self.slot_mut(c) {
            s.trades += 1;
            if pnl > 0.0 {
                s.wins += 1;
            }
            s.pnl += pnl;
        }
    }

    /// Learned ensemble weight, Laplace-smoothed win rate plus a tanh pnl
    /// adjustment, clipped to [0.7, 1.3]. Time-weighted components return 1.0.
    pub fn weight(&self, c: Component) -> f64 {
        let Some(s) = self.slot(c) else {
            return 1.0;
        };
        let winrate = (s.wins as f64 + 1.0) / (s.trades as f64 + 2.0);
        let pnl_adj = (s.pnl / 200.0).tanh() * 0.15;
        (0.8 + 0.4 * winrate + pnl_adj).clamp(0.7, 1.3)
    }
}

/// Per-component probabilities of the YES outcome.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ComponentProbs {
    #[serde(rename = "TA")]
    pub ta: f64,
    #[serde(rename = "LL")]
    pub ll: f64,
    #[serde(rename = "RG")]
    pub rg: f64,
    #[serde(rename = "BK")]
    pub bk: f64,
    #[serde(rename = "ANCHOR")]
    pub anchor: f64,
    #[serde(rename = "MC_CLOSE")]
    pub mc_close: f64,
}

impl ComponentProbs {
    pub fn get(&self, c: Component) -> f64 {
        match c {
            Component::Ta => self.ta,
            Component::Ll => self.ll,
            Component::Rg => self.rg,
            Component::Bk => self.bk,
            Component::Anchor => self.anchor,
            Component::McClose => self.mc_close,
        }
    }
}

/// Per-component ensemble weights for one forecast.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ComponentWeights {
    #[serde(rename = "TA")]
    pub ta: f64,
    #[serde(rename = "LL")]
    pub ll: f64,
    #[serde(rename = "RG")]
    pub rg: f64,
    #[serde(rename = "BK")]
    pub bk: f64,
    #[serde(rename = "ANCHOR")]
    pub anchor: f64,
    #[serde(rename = "MC_CLOSE")]
    pub mc_close: f64,
}

impl ComponentWeights {
    pub fn get(&self, c: Component) -> f64 {
        match c {
            Component::Ta => self.ta,
            Component::Ll => self.ll,
            Component::Rg => self.rg,
            Component::Bk => self.bk,
            Component::Anchor => self.anchor,
            Component::McClose => self.mc_close,
        }
    }

    pub fn sum(&self) -> f64 {
        Component::ALL.into_iter().map(|c| self.get(c)).sum()
    }
}

/// One forecast for a BTC window market, valid for a single cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastOutput {
    pub p_yes_ensemble: f64,
    pub p_hit_target: f64,
    pub component_probs: ComponentProbs,
    pub weights: ComponentWeights,
    pub best_component: Component,
    pub predicted_side: TradeSide,
    pub confidence: u8,
    pub consensus: u8,
    pub sigma_per_s: f64,
    pub lead_bps: f64,
}

impl ForecastOutput {
    /// Display/attribution label like `"TA:UP 63%"`.
    pub fn best_model_label(&self) -> String {
        format!(
            "{}:{} {}%",
            self.best_component.as_str(),
            self.predicted_side.direction_label(),
            self.confidence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parsing() {
        assert_eq!(Component::from_tag("TA:UP 63%"), Some(Component::Ta));
        assert_eq!(Component::from_tag("MC_CLOSE:DOWN 51%"), Some(Component::McClose));
        assert_eq!(Component::from_tag("SCALP:binance:BUY_YES:9.5bps"), None);
        assert_eq!(Component::from_tag(""), None);
    }

    #[test]
    fn weight_bounds() {
        let mut stats = ModelStats::default();
        // Fresh stats: 0.8 + 0.4 * 0.5 = 1.0
        assert!((stats.weight(Component::Ta) - 1.0).abs() < 1e-9);

        for _ in 0..50 {
            stats.record(Component::Ta, 10.0);
        }
        assert!(stats.weight(Component::Ta) <= 1.3);

        for _ in 0..80 {
            stats.record(Component::Bk, -10.0);
        }
        assert!(stats.weight(Component::Bk) >= 0.7);
    }

    #[test]
    fn anchor_never_records() {
        let mut stats = ModelStats::default();
        stats.record(Component::Anchor, 5.0);
        assert_eq!(stats.ta.trades, 0);
        assert!((stats.weight(Component::Anchor) - 1.0).abs() < 1e-9);
    }
}
