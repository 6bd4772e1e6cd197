use std::fmt;

use serde::{Deserialize, Serialize};

/// The four selections the engine prices. Over/Under share the 2.5 goals line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    Over25,
    Under25,
    BttsYes,
    BttsNo,
}

/// Which fitted rating model a market reads from. `General` is the
/// scope-agnostic fit that also fixes home advantage for the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarketScope {
    General,
    Over,
    Under,
    Btts,
}

/// How the rating-model weight reacts to the fixture's expected goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightRule {
    /// Trust the rating model less for overs in low-scoring fixtures.
    DistrustLowScoringOvers,
    /// Trust the rating model more for unders.
    FavourUnders,
    /// Trust the rating model less for BTTS in defensive fixtures.
    DistrustDefensiveBtts,
}

#[derive(Debug, Clone, Copy)]
pub struct MarketProfile {
    pub market: Market,
    pub scope: MarketScope,
    /// Minimum edge in percentage points before a pick is actionable.
    pub min_edge: f64,
    /// Calibration prior `(alpha, beta)` used before enough history exists.
    pub calibration_prior: (f64, f64),
    pub weight_rule: WeightRule,
}

const BASE_MIN_EDGE: f64 = 8.0;

const PROFILES: [MarketProfile; 4] = [
    MarketProfile {
        market: Market::Over25,
        scope: MarketScope::Over,
        min_edge: BASE_MIN_EDGE + 2.0,
        calibration_prior: (0.88, 0.12),
        weight_rule: WeightRule::DistrustLowScoringOvers,
    },
    MarketProfile {
        market: Market::Under25,
        scope: MarketScope::Under,
        min_edge: BASE_MIN_EDGE - 0.5,
        calibration_prior: (0.92, 0.08),
        weight_rule: WeightRule::FavourUnders,
    },
    MarketProfile {
        market: Market::BttsYes,
        scope: MarketScope::Btts,
        min_edge: BASE_MIN_EDGE + 0.5,
        calibration_prior: (0.90, 0.10),
        weight_rule: WeightRule::DistrustDefensiveBtts,
    },
    MarketProfile {
        market: Market::BttsNo,
        scope: MarketScope::Btts,
        min_edge: BASE_MIN_EDGE + 0.5,
        calibration_prior: (0.92, 0.08),
        weight_rule: WeightRule::DistrustDefensiveBtts,
    },
];

impl Market {
    pub const ALL: [Market; 4] = [
        Market::Over25,
        Market::Under25,
        Market::BttsYes,
        Market::BttsNo,
    ];

    pub fn profile(self) -> &'static MarketProfile {
        &PROFILES[self.index()]
    }

    pub fn index(self) -> usize {
        match self {
            Market::Over25 => 0,
            Market::Under25 => 1,
            Market::BttsYes => 2,
            Market::BttsNo => 3,
        }
    }

    pub fn scope(self) -> MarketScope {
        self.profile().scope
    }

    pub fn min_edge(self) -> f64 {
        self.profile().min_edge
    }

    /// Group label of the two-way market, e.g. for ledger identity.
    pub fn group(self) -> &'static str {
        match self {
            Market::Over25 | Market::Under25 => "Over/Under 2.5",
            Market::BttsYes | Market::BttsNo => "BTTS",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Market::Over25 => "Over 2.5",
            Market::Under25 => "Under 2.5",
            Market::BttsYes => "BTTS Yes",
            Market::BttsNo => "BTTS No",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Market::Over25 => "over25",
            Market::Under25 => "under25",
            Market::BttsYes => "btts_yes",
            Market::BttsNo => "btts_no",
        }
    }

    pub fn from_key(raw: &str) -> Option<Market> {
        let k = raw.trim().to_ascii_lowercase();
        Market::ALL
            .into_iter()
            .find(|m| m.key() == k || m.label().to_ascii_lowercase() == k)
    }

    /// Did this selection win for the given final score?
    pub fn settle(self, home_goals: u8, away_goals: u8) -> bool {
        let total = home_goals as u32 + away_goals as u32;
        let both = home_goals >= 1 && away_goals >= 1;
        match self {
            Market::Over25 => total > 2,
            Market::Under25 => total <= 2,
            Market::BttsYes => both,
            Market::BttsNo => !both,
        }
    }

    /// Weight given to the rating model (vs. the heuristic model) for this
    /// market, from model quality and the fixture's total expected goals.
    pub fn rating_weight(self, dc_quality: f64, total_lambda: f64) -> f64 {
        let base = base_rating_weight(dc_quality);
        match self.profile().weight_rule {
            WeightRule::DistrustLowScoringOvers => {
                if total_lambda < 2.2 {
                    (base - 0.15).max(0.40)
                } else {
                    (base - 0.10).max(0.30)
                }
            }
            WeightRule::FavourUnders => {
                if total_lambda > 3.2 {
                    (base + 0.10).min(0.90)
                } else {
                    (base + 0.10).min(0.95)
                }
            }
            WeightRule::DistrustDefensiveBtts => {
                if total_lambda < 2.2 {
                    (base - 0.12).max(0.55)
                } else if total_lambda < 2.5 {
                    (base - 0.06).max(0.65)
                } else {
                    base
                }
            }
        }
    }
}

/// Rating-model weight before any market-specific nudge.
pub fn base_rating_weight(dc_quality: f64) -> f64 {
    (0.70 + 0.25 * dc_quality).min(0.80)
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl MarketScope {
    pub const ALL: [MarketScope; 4] = [
        MarketScope::General,
        MarketScope::Over,
        MarketScope::Under,
        MarketScope::Btts,
    ];

    pub fn key(self) -> &'static str {
        match self {
            MarketScope::General => "general",
            MarketScope::Over => "over",
            MarketScope::Under => "under",
            MarketScope::Btts => "btts",
        }
    }
}

impl fmt::Display for MarketScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A value per market, indexed by [`Market::index`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerMarket<T> {
    values: [T; 4],
}

impl<T: Copy> PerMarket<T> {
    pub fn from_fn(mut f: impl FnMut(Market) -> T) -> Self {
        Self {
            values: Market::ALL.map(&mut f),
        }
    }

    pub fn get(&self, market: Market) -> T {
        self.values[market.index()]
    }

    pub fn set(&mut self, market: Market, value: T) {
        self.values[market.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Market, T)> + '_ {
        Market::ALL.into_iter().map(|m| (m, self.get(m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_follows_market_rules() {
        assert!(Market::Over25.settle(2, 1));
        assert!(!Market::Over25.settle(1, 1));
        assert!(Market::Under25.settle(2, 0));
        assert!(Market::BttsYes.settle(1, 1));
        assert!(Market::BttsNo.settle(3, 0));
        assert!(!Market::BttsNo.settle(1, 2));
    }

    #[test]
    fn thresholds_differ_per_market() {
        assert_eq!(Market::Over25.min_edge(), 10.0);
        assert_eq!(Market::Under25.min_edge(), 7.5);
        assert_eq!(Market::BttsYes.min_edge(), 8.5);
        assert_eq!(Market::BttsNo.min_edge(), 8.5);
    }

    #[test]
    fn rating_weight_distrusts_overs_in_tight_games() {
        let tight = Market::Over25.rating_weight(1.0, 2.0);
        let open = Market::Over25.rating_weight(1.0, 3.0);
        assert!(tight < open + 1e-12);
        assert!((Market::Under25.rating_weight(1.0, 3.5) - 0.90).abs() < 1e-12);
        assert!(Market::BttsYes.rating_weight(1.0, 2.0) < Market::BttsYes.rating_weight(1.0, 2.8));
    }

    #[test]
    fn from_key_accepts_labels() {
        assert_eq!(Market::from_key("BTTS Yes"), Some(Market::BttsYes));
        assert_eq!(Market::from_key("under25"), Some(Market::Under25));
        assert_eq!(Market::from_key("draw"), None);
    }
}
