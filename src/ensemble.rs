//! Merges the rating path and the predictor into one set of market
//! probabilities, and tracks which of the two has been more accurate lately.

use serde::{Deserialize, Serialize};

use crate::calibration::brier_score;
use crate::config::{AdaptiveConfig, SanityConfig};
use crate::dixon_coles::RatingStore;
use crate::error::Unavailable;
use crate::lambdas::{FixtureContext, rating_lambdas, simple_lambdas};
use crate::league_params::LeagueParamsTable;
use crate::market::{Market, MarketScope, base_rating_weight};
use crate::scoreline::{MarketProbs, score_markets};
use crate::team_stats::RingBuffer;

/// Model quality reported to the confidence score when no rating model is used.
pub const HEURISTIC_QUALITY: f64 = 0.6;
/// Adjustments kept for inspection; older ones are dropped.
pub const WEIGHT_HISTORY_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelUsed {
    Heuristic,
    DixonColes,
    HeuristicWithPredictor,
    DixonColesWithPredictor,
}

impl ModelUsed {
    pub fn label(self) -> &'static str {
        match self {
            ModelUsed::Heuristic => "heuristic",
            ModelUsed::DixonColes => "dixon-coles",
            ModelUsed::HeuristicWithPredictor => "heuristic+gbm",
            ModelUsed::DixonColesWithPredictor => "dixon-coles+gbm",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        [
            ModelUsed::Heuristic,
            ModelUsed::DixonColes,
            ModelUsed::HeuristicWithPredictor,
            ModelUsed::DixonColesWithPredictor,
        ]
        .into_iter()
        .find(|m| m.label() == raw)
    }

    fn with_predictor(self) -> Self {
        match self {
            ModelUsed::Heuristic | ModelUsed::HeuristicWithPredictor => ModelUsed::HeuristicWithPredictor,
            ModelUsed::DixonColes | ModelUsed::DixonColesWithPredictor => ModelUsed::DixonColesWithPredictor,
        }
    }
}

/// What the rating path says about a fixture before the predictor weighs in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingEstimate {
    pub probs: MarketProbs,
    /// Lambdas the fixture filters look at.
    pub lambdas: (f64, f64),
    pub simple_lambdas: (f64, f64),
    /// `min(n / 80, 1)` of the General model, or [`HEURISTIC_QUALITY`].
    pub quality: f64,
    pub model: ModelUsed,
}

impl RatingEstimate {
    pub fn total_lambda(&self) -> f64 {
        self.lambdas.0 + self.lambdas.1
    }
}

/// Heuristic lambdas first; when the league's General model knows both
/// teams, each market is blended with its scope model's probabilities.
pub fn rating_estimate(
    store: &RatingStore,
    params: &LeagueParamsTable,
    league_id: u32,
    home_id: u32,
    away_id: u32,
    ctx: &FixtureContext,
) -> Result<RatingEstimate, Unavailable> {
    let general_params = params.get(league_id, MarketScope::General);
    let simple = simple_lambdas(ctx, general_params.home_adv);
    let simple_probs = score_markets(simple.0, simple.1, general_params.rho_prior)?;

    let heuristic = RatingEstimate {
        probs: simple_probs,
        lambdas: simple,
        simple_lambdas: simple,
        quality: HEURISTIC_QUALITY,
        model: ModelUsed::Heuristic,
    };

    let Some(general) = store
        .usable(league_id, MarketScope::General, general_params.min_matches)
        .filter(|m| m.contains(home_id) && m.contains(away_id))
    else {
        return Ok(heuristic);
    };

    let quality = general.quality();
    let w_base = base_rating_weight(quality);
    let dc_general = rating_lambdas(general, home_id, away_id, ctx)?;
    let lambdas = (
        w_base * dc_general.0 + (1.0 - w_base) * simple.0,
        w_base * dc_general.1 + (1.0 - w_base) * simple.1,
    );

    let mut probs = simple_probs;
    for market in Market::ALL {
        let scope = market.scope();
        let scope_params = params.get(league_id, scope);
        let Some(model) = store
            .usable(league_id, scope, scope_params.min_matches)
            .filter(|m| m.contains(home_id) && m.contains(away_id))
        else {
            continue;
        };
        let dc = rating_lambdas(model, home_id, away_id, ctx)?;
        let dc_probs = score_markets(dc.0, dc.1, model.rho)?;
        let provisional = w_base * (dc.0 + dc.1) + (1.0 - w_base) * (simple.0 + simple.1);
        let w = market.rating_weight(quality, provisional);
        probs.set(market, w * dc_probs.get(market) + (1.0 - w) * simple_probs.get(market));
    }

    Ok(RatingEstimate {
        probs,
        lambdas,
        simple_lambdas: simple,
        quality,
        model: ModelUsed::DixonColes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Combined {
    pub probs: MarketProbs,
    pub rating_probs: MarketProbs,
    pub predictor_probs: Option<MarketProbs>,
    pub predictor_weight: f64,
    pub model: ModelUsed,
}

/// Adaptive predictor weight plus the recent accuracy of both sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleState {
    predictor_weight: f64,
    adaptive: AdaptiveConfig,
    rating_window: RingBuffer<(f64, bool)>,
    predictor_window: RingBuffer<(f64, bool)>,
    since_adjust: usize,
    weight_history: RingBuffer<f64>,
}

impl Default for EnsembleState {
    fn default() -> Self {
        Self::new(0.25, AdaptiveConfig::default())
    }
}

impl EnsembleState {
    pub fn new(initial_weight: f64, adaptive: AdaptiveConfig) -> Self {
        let cap = adaptive.window_size.max(1) * 2;
        Self {
            predictor_weight: initial_weight.clamp(adaptive.min_weight, adaptive.max_weight),
            adaptive,
            rating_window: RingBuffer::new(cap),
            predictor_window: RingBuffer::new(cap),
            since_adjust: 0,
            weight_history: RingBuffer::new(WEIGHT_HISTORY_CAPACITY),
        }
    }

    pub fn predictor_weight(&self) -> f64 {
        self.predictor_weight
    }

    pub fn set_predictor_weight(&mut self, weight: f64) {
        self.predictor_weight = weight.clamp(self.adaptive.min_weight, self.adaptive.max_weight);
    }

    pub fn adaptive(&self) -> &AdaptiveConfig {
        &self.adaptive
    }

    /// Swaps in new adaptive settings, keeping the recorded outcomes that
    /// still fit the windows and clamping the weight to the new bounds.
    pub fn set_adaptive(&mut self, adaptive: AdaptiveConfig) {
        let cap = adaptive.window_size.max(1) * 2;
        self.rating_window.resize(cap);
        self.predictor_window.resize(cap);
        self.since_adjust = self.since_adjust.min(adaptive.window_size);
        self.adaptive = adaptive;
        self.set_predictor_weight(self.predictor_weight);
    }

    pub fn observations(&self) -> usize {
        self.rating_window.len()
    }

    /// Weights after the most recent adjustments, oldest first.
    pub fn weight_history(&self) -> impl Iterator<Item = f64> + '_ {
        self.weight_history.iter().copied()
    }

    /// Records one settled pick as seen by both sources (percent
    /// probabilities of the selection that was picked).
    pub fn record_outcome(&mut self, rating_prob: f64, predictor_prob: f64, won: bool) {
        self.rating_window.push((rating_prob / 100.0, won));
        self.predictor_window.push((predictor_prob / 100.0, won));
        self.since_adjust += 1;
        if self.since_adjust >= self.adaptive.window_size && self.rating_window.len() >= self.adaptive.window_size {
            self.since_adjust = 0;
            self.adjust();
        }
    }

    fn adjust(&mut self) {
        let n = self.adaptive.window_size;
        let (Some(rating), Some(predictor)) = (
            brier_score(self.rating_window.last(n)),
            brier_score(self.predictor_window.last(n)),
        ) else {
            return;
        };
        let old = self.predictor_weight;
        let next = if predictor < rating {
            old + self.adaptive.step
        } else {
            old - self.adaptive.step
        };
        self.predictor_weight = next.clamp(self.adaptive.min_weight, self.adaptive.max_weight);
        self.weight_history.push(self.predictor_weight);
        tracing::info!(
            rating_brier = rating,
            predictor_brier = predictor,
            from = old,
            to = self.predictor_weight,
            "adaptive weight adjusted"
        );
    }

    /// Blends the predictor into the rating probabilities. With the
    /// consensus filter on, any market where the two differ by more than
    /// `consensus_threshold` (as a fraction) vetoes the whole fixture.
    pub fn combine(
        &self,
        rating: &RatingEstimate,
        predictor: Option<&MarketProbs>,
        consensus_threshold: Option<f64>,
    ) -> Result<Combined, Unavailable> {
        let Some(pred) = predictor else {
            return Ok(Combined {
                probs: rating.probs,
                rating_probs: rating.probs,
                predictor_probs: None,
                predictor_weight: 0.0,
                model: rating.model,
            });
        };

        if let Some(threshold) = consensus_threshold {
            let (market, disagreement) = Market::ALL
                .into_iter()
                .map(|m| (m, (rating.probs.get(m) - pred.get(m)).abs() / 100.0))
                .fold((Market::Over25, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
            if disagreement > threshold {
                return Err(Unavailable::ConsensusVeto { market, disagreement });
            }
        }

        let w = self.predictor_weight;
        Ok(Combined {
            probs: pred.blend(&rating.probs, w),
            rating_probs: rating.probs,
            predictor_probs: Some(*pred),
            predictor_weight: w,
            model: rating.model.with_predictor(),
        })
    }
}

/// Final plausibility gate on the fixture's lambdas and merged probabilities.
pub fn sanity_check(rating: &RatingEstimate, combined: &Combined, cfg: &SanityConfig) -> Result<(), Unavailable> {
    let total = rating.total_lambda();
    if !(cfg.min_total_lambda..=cfg.max_total_lambda).contains(&total) {
        return Err(Unavailable::SanityCheck(format!("total lambda {total:.2} out of range")));
    }
    let sum = combined.probs.over25 + combined.probs.under25;
    if !sum.is_finite() || (sum - 100.0).abs() > cfg.pair_sum_tolerance {
        return Err(Unavailable::SanityCheck(format!("over+under sums to {sum:.1}")));
    }
    Ok(())
}
