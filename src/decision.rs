//! Value decision for one quoted price: calibrate, measure edge, score
//! confidence and size the stake.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationTable;
use crate::config::DecisionConfig;
use crate::ensemble::{Combined, ModelUsed};
use crate::feed::{Fixture, MarketPrices, Quote};
use crate::market::Market;

/// Market-implied probability in percent.
pub fn implied_prob(odd: f64) -> f64 {
    100.0 / odd
}

/// Percentage points by which the calibrated probability beats the market.
pub fn edge(calibrated_prob: f64, market_prob: f64) -> f64 {
    calibrated_prob - market_prob
}

/// 0..100 score mixing edge, model quality and agreement with the market.
pub fn confidence(edge: f64, quality: f64, model_prob: f64, market_prob: f64) -> f64 {
    let diff = (model_prob - market_prob).abs();
    let mut score = edge.min(15.0) * 3.5 + quality * 100.0 * 0.35 + (100.0 - diff).max(0.0) * 0.15;
    if edge < 7.0 {
        score *= 0.85;
    }
    if quality < 0.7 {
        score *= 0.9;
    }
    (score.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// Fractional Kelly stake as a bankroll fraction; `prob` in 0..1.
pub fn kelly_stake(prob: f64, odd: f64, multiplier: f64, cap: f64) -> f64 {
    if prob <= 0.0 || prob >= 1.0 || odd <= 1.0 {
        return 0.0;
    }
    let full = (prob * odd - 1.0) / (odd - 1.0);
    if full <= 0.0 {
        return 0.0;
    }
    (full * multiplier).min(cap)
}

pub fn odd_in_range(odd: f64, cfg: &DecisionConfig) -> bool {
    odd.is_finite() && (cfg.min_odd..=cfg.max_odd).contains(&odd)
}

/// True once a fixture is too close to kickoff to scan or refresh.
pub fn inside_kickoff_buffer(kickoff: DateTime<Utc>, now: DateTime<Utc>, cfg: &DecisionConfig) -> bool {
    kickoff <= now + Duration::minutes(cfg.kickoff_buffer_minutes)
}

/// A pick that cleared every threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCandidate {
    pub fixture: Fixture,
    pub market: Market,
    pub quote: Quote,
    pub model_prob_raw: f64,
    pub model_prob_calibrated: f64,
    pub market_prob: f64,
    pub fair_odd: f64,
    pub edge: f64,
    pub confidence: f64,
    pub stake_fraction: f64,
    pub model_used: ModelUsed,
    /// The two ensemble inputs for the picked selection, kept for the
    /// adaptive weight once the pick settles.
    pub rating_prob: f64,
    pub predictor_prob: Option<f64>,
}

impl DecisionCandidate {
    /// Ordering key for "best pick": confidence, then edge.
    pub fn rank_key(&self) -> (f64, f64) {
        (self.confidence, self.edge)
    }
}

/// Why a quoted market produced no candidate. Kept for the debug log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    OddOutOfRange,
    EdgeBelowMinimum { edge: f64, min_edge: f64 },
    LowConfidence(f64),
}

/// Percent figures for one quote before any threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub raw: f64,
    pub calibrated: f64,
    pub market_prob: f64,
    pub edge: f64,
    pub confidence: f64,
}

pub struct DecisionGate<'a> {
    pub config: &'a DecisionConfig,
    pub calibration: &'a CalibrationTable,
}

impl DecisionGate<'_> {
    /// At least one quote inside the odds range.
    pub fn any_odd_in_range(&self, prices: &MarketPrices) -> bool {
        prices.iter().any(|(_, q)| odd_in_range(q.odd, self.config))
    }

    /// Edge and confidence of one quote, with no thresholds applied.
    pub fn score(&self, market: Market, odd: f64, combined: &Combined, quality: f64) -> Scored {
        let raw = combined.probs.get(market);
        let market_prob = implied_prob(odd);
        let calibrated = self.calibration.get(market).apply(raw, market_prob);
        let edge = edge(calibrated, market_prob);
        Scored {
            raw,
            calibrated,
            market_prob,
            edge,
            confidence: confidence(edge, quality, calibrated, market_prob),
        }
    }

    pub fn evaluate(
        &self,
        fixture: &Fixture,
        market: Market,
        quote: &Quote,
        combined: &Combined,
        quality: f64,
    ) -> Result<DecisionCandidate, Rejection> {
        if !odd_in_range(quote.odd, self.config) {
            return Err(Rejection::OddOutOfRange);
        }
        let scored = self.score(market, quote.odd, combined, quality);
        let min_edge = market.min_edge();
        if scored.edge < min_edge {
            return Err(Rejection::EdgeBelowMinimum {
                edge: scored.edge,
                min_edge,
            });
        }
        if scored.confidence < self.config.min_confidence {
            return Err(Rejection::LowConfidence(scored.confidence));
        }

        Ok(DecisionCandidate {
            fixture: fixture.clone(),
            market,
            quote: quote.clone(),
            model_prob_raw: scored.raw,
            model_prob_calibrated: scored.calibrated,
            market_prob: scored.market_prob,
            fair_odd: ((100.0 / scored.calibrated) * 100.0).round() / 100.0,
            edge: scored.edge,
            confidence: scored.confidence,
            stake_fraction: kelly_stake(
                scored.calibrated / 100.0,
                quote.odd,
                self.config.kelly_multiplier,
                self.config.kelly_cap,
            ),
            model_used: combined.model,
            rating_prob: combined.rating_probs.get(market),
            predictor_prob: combined.predictor_probs.map(|p| p.get(market)),
        })
    }

    /// Every accepted market of a fixture, best first.
    pub fn evaluate_all(
        &self,
        fixture: &Fixture,
        prices: &MarketPrices,
        combined: &Combined,
        quality: f64,
    ) -> Vec<DecisionCandidate> {
        let mut accepted = Vec::new();
        for (market, quote) in prices.iter() {
            match self.evaluate(fixture, market, quote, combined, quality) {
                Ok(c) => accepted.push(c),
                Err(reason) => {
                    tracing::debug!(fixture_id = fixture.fixture_id, market = market.key(), ?reason, "rejected")
                }
            }
        }
        sort_best_first(&mut accepted);
        accepted
    }
}

pub fn sort_best_first(candidates: &mut [DecisionCandidate]) {
    candidates.sort_by(|a, b| {
        let (ca, ea) = a.rank_key();
        let (cb, eb) = b.rank_key();
        cb.total_cmp(&ca).then(eb.total_cmp(&ea))
    });
}
