use serde::{Deserialize, Serialize};

use crate::market::{Market, PerMarket};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

/// Binary scores for probabilities in 0..1 against outcomes.
pub fn evaluate_probs(predictions: &[f64], outcomes: &[bool]) -> Metrics {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return Metrics::default();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for (p, hit) in predictions.iter().zip(outcomes) {
        let p = p.clamp(0.0, 1.0);
        let y = if *hit { 1.0 } else { 0.0 };
        brier_sum += (p - y).powi(2);

        let actual_prob = if *hit { p } else { 1.0 - p }.clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();

        if (p >= 0.5) == *hit {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}

/// Mean squared error of `(prob, outcome)` pairs, or `None` when empty.
pub fn brier_score<'a>(pairs: impl IntoIterator<Item = &'a (f64, bool)>) -> Option<f64> {
    let (sum, n) = pairs.into_iter().fold((0.0, 0usize), |(s, n), (p, hit)| {
        let y = if *hit { 1.0 } else { 0.0 };
        (s + (p - y).powi(2), n + 1)
    });
    (n > 0).then(|| sum / n as f64)
}

/// A settled pick as calibration sees it. `calibrated_prob` is in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettledPick {
    pub market: Market,
    pub calibrated_prob: f64,
    pub won: bool,
}

pub const MIN_RESOLVED_TOTAL: usize = 30;
pub const MIN_RESOLVED_PER_MARKET: usize = 10;
const HIGH_CONFIDENCE_PROB: f64 = 60.0;
const MIN_HIGH_CONFIDENCE_PICKS: usize = 5;
const SMOOTHING_SAMPLES: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationClass {
    StronglyOverconfident,
    Overconfident,
    StronglyUnderconfident,
    Underconfident,
    WellCalibrated,
}

impl CalibrationClass {
    /// `(alpha, beta)`: weight on the model vs. the market-implied probability.
    pub fn coefficients(self) -> (f64, f64) {
        match self {
            CalibrationClass::StronglyOverconfident => (0.82, 0.18),
            CalibrationClass::Overconfident => (0.87, 0.13),
            CalibrationClass::StronglyUnderconfident => (0.95, 0.05),
            CalibrationClass::Underconfident => (0.93, 0.07),
            CalibrationClass::WellCalibrated => (0.92, 0.08),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketCalibration {
    pub alpha: f64,
    pub beta: f64,
    /// `None` while the market still runs on its prior.
    pub class: Option<CalibrationClass>,
    pub samples: usize,
}

impl MarketCalibration {
    pub fn prior(market: Market) -> Self {
        let (alpha, beta) = market.profile().calibration_prior;
        Self {
            alpha,
            beta,
            class: None,
            samples: 0,
        }
    }

    /// Model probability pulled toward the market, both in percent.
    pub fn apply(&self, model_prob: f64, market_prob: f64) -> f64 {
        self.alpha * model_prob + self.beta * market_prob
    }
}

/// Classifies one market's settled picks by how its confident picks fared.
pub fn classify(picks: &[SettledPick]) -> CalibrationClass {
    if picks.is_empty() {
        return CalibrationClass::WellCalibrated;
    }
    let n = picks.len() as f64;
    let wins = picks.iter().filter(|p| p.won).count() as f64;
    let win_rate = wins / n;
    let avg_prob = picks.iter().map(|p| p.calibrated_prob).sum::<f64>() / n;

    let confident: Vec<&SettledPick> = picks
        .iter()
        .filter(|p| p.calibrated_prob >= HIGH_CONFIDENCE_PROB)
        .collect();
    let high_conf_loss_rate = if confident.len() >= MIN_HIGH_CONFIDENCE_PICKS {
        confident.iter().filter(|p| !p.won).count() as f64 / confident.len() as f64
    } else {
        1.0 - win_rate
    };

    if high_conf_loss_rate > 0.45 {
        CalibrationClass::StronglyOverconfident
    } else if high_conf_loss_rate > 0.40 {
        CalibrationClass::Overconfident
    } else if win_rate > 0.65 && avg_prob > 65.0 {
        CalibrationClass::StronglyUnderconfident
    } else if win_rate > 0.60 && avg_prob > 60.0 {
        CalibrationClass::Underconfident
    } else {
        CalibrationClass::WellCalibrated
    }
}

/// Class coefficients blended with the market prior; the prior fades as
/// `exp(-n / 30)`.
pub fn smoothed(market: Market, class: CalibrationClass, samples: usize) -> MarketCalibration {
    let (prior_a, prior_b) = market.profile().calibration_prior;
    let (class_a, class_b) = class.coefficients();
    let prior_weight = (-(samples as f64) / SMOOTHING_SAMPLES).exp();
    let alpha = prior_weight * prior_a + (1.0 - prior_weight) * class_a;
    let beta = prior_weight * prior_b + (1.0 - prior_weight) * class_b;
    let total = alpha + beta;
    MarketCalibration {
        alpha: alpha / total,
        beta: beta / total,
        class: Some(class),
        samples,
    }
}

/// Per-market calibration derived from the settled ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    markets: PerMarket<MarketCalibration>,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::priors()
    }
}

impl CalibrationTable {
    pub fn priors() -> Self {
        Self {
            markets: PerMarket::from_fn(MarketCalibration::prior),
        }
    }

    pub fn from_settled(picks: &[SettledPick]) -> Self {
        if picks.len() < MIN_RESOLVED_TOTAL {
            tracing::debug!(resolved = picks.len(), "calibration on priors");
            return Self::priors();
        }
        let markets = PerMarket::from_fn(|market| {
            let own: Vec<SettledPick> = picks.iter().filter(|p| p.market == market).copied().collect();
            if own.len() < MIN_RESOLVED_PER_MARKET {
                return MarketCalibration::prior(market);
            }
            let cal = smoothed(market, classify(&own), own.len());
            tracing::debug!(
                market = market.key(),
                samples = own.len(),
                alpha = cal.alpha,
                class = ?cal.class,
                "dynamic calibration"
            );
            cal
        });
        Self { markets }
    }

    pub fn get(&self, market: Market) -> MarketCalibration {
        self.markets.get(market)
    }
}
