//! Gradient-boosted goals predictor: one classifier per market.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::calibration::{Metrics, evaluate_probs};
use crate::error::Unavailable;
use crate::features::{FeatureVector, TrainingSet};
use crate::gbm::{GbmClassifier, GbmParams};
use crate::market::{Market, PerMarket};
use crate::scoreline::MarketProbs;
use crate::team_stats::RingBuffer;

pub const MIN_TRAINING_ROWS: usize = 100;
/// Fallback count at which the predictor is reported as unhealthy.
pub const FALLBACK_WARN_THRESHOLD: usize = 5;
pub const FALLBACK_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum PredictorOutcome {
    Probs(MarketProbs),
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackEvent {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Fallback count plus the most recent events.
#[derive(Debug, Clone)]
pub struct FallbackLog {
    total: usize,
    recent: RingBuffer<FallbackEvent>,
}

impl Default for FallbackLog {
    fn default() -> Self {
        Self {
            total: 0,
            recent: RingBuffer::new(FALLBACK_LOG_CAPACITY),
        }
    }
}

impl FallbackLog {
    pub fn record(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        let reason = reason.into();
        self.total += 1;
        tracing::warn!(reason = %reason, count = self.total, "predictor fallback");
        self.recent.push(FallbackEvent { at, reason });
        if self.total >= FALLBACK_WARN_THRESHOLD {
            tracing::warn!(
                count = self.total,
                "predictor has fallen back repeatedly, check training data"
            );
        }
    }

    /// Every fallback since the predictor was created.
    pub fn count(&self) -> usize {
        self.total
    }

    /// Reasons among the recent events with their counts, most frequent first.
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for e in self.recent.iter() {
            *counts.entry(e.reason.as_str()).or_default() += 1;
        }
        let mut out: Vec<(String, usize)> = counts.into_iter().map(|(r, n)| (r.to_string(), n)).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingReport {
    pub rows: usize,
    /// In-sample scores per market.
    pub metrics: PerMarket<Metrics>,
}

struct TrainedModels {
    models: Vec<GbmClassifier>,
}

impl TrainedModels {
    fn get(&self, market: Market) -> &GbmClassifier {
        &self.models[market.index()]
    }
}

pub struct GoalsPredictor {
    trained: Option<TrainedModels>,
    report: Option<TrainingReport>,
    fallbacks: FallbackLog,
}

impl Default for GoalsPredictor {
    fn default() -> Self {
        Self::untrained()
    }
}

impl GoalsPredictor {
    pub fn untrained() -> Self {
        Self {
            trained: None,
            report: None,
            fallbacks: FallbackLog::default(),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    pub fn report(&self) -> Option<&TrainingReport> {
        self.report.as_ref()
    }

    pub fn fallbacks(&self) -> &FallbackLog {
        &self.fallbacks
    }

    /// Fits the four market classifiers. On failure the predictor stays
    /// (or becomes) untrained.
    pub fn train(
        &mut self,
        set: &TrainingSet,
        params: &GbmParams,
        min_rows: usize,
    ) -> Result<TrainingReport, Unavailable> {
        self.trained = None;
        self.report = None;
        if set.len() < min_rows {
            tracing::warn!(rows = set.len(), needed = min_rows, "too few rows, predictor disabled");
            return Err(Unavailable::InsufficientData {
                needed: min_rows,
                found: set.len(),
            });
        }

        let x = set.matrix();
        let fitted: Vec<Result<GbmClassifier, Unavailable>> = Market::ALL
            .par_iter()
            .map(|market| GbmClassifier::fit(&x, &set.labels(*market), params))
            .collect();
        let models = fitted.into_iter().collect::<Result<Vec<_>, _>>()?;
        let trained = TrainedModels { models };

        let metrics = PerMarket::from_fn(|market| {
            let model = trained.get(market);
            let probs: Vec<f64> = x.iter().map(|row| model.predict_proba(row)).collect();
            evaluate_probs(&probs, &set.labels(market))
        });
        let report = TrainingReport {
            rows: set.len(),
            metrics,
        };
        tracing::info!(
            rows = report.rows,
            over_brier = report.metrics.get(Market::Over25).brier,
            btts_brier = report.metrics.get(Market::BttsYes).brier,
            "predictor trained"
        );
        self.trained = Some(trained);
        self.report = Some(report);
        Ok(report)
    }

    /// Percent probabilities with each two-way pair renormalised to 100.
    pub fn predict(&mut self, features: &FeatureVector, now: DateTime<Utc>) -> PredictorOutcome {
        if self.trained.is_some() && features.iter().any(|v| !v.is_finite()) {
            return self.fall_back("non-finite features", now);
        }
        let Some(trained) = &self.trained else {
            return self.fall_back("predictor not trained", now);
        };

        let raw = PerMarket::from_fn(|m| trained.get(m).predict_proba(features));
        let mut probs = MarketProbs::default();
        for (yes, no) in [(Market::Over25, Market::Under25), (Market::BttsYes, Market::BttsNo)] {
            let (p_yes, p_no) = (raw.get(yes), raw.get(no));
            let total = p_yes + p_no;
            if !total.is_finite() || total <= 0.0 {
                return self.fall_back("degenerate pair probabilities", now);
            }
            probs.set(yes, p_yes / total * 100.0);
            probs.set(no, p_no / total * 100.0);
        }

        if !probs.is_finite() {
            return self.fall_back("probabilities contain NaN", now);
        }
        if Market::ALL.iter().any(|m| !(0.0..=100.0).contains(&probs.get(*m))) {
            return self.fall_back("probabilities out of range", now);
        }
        PredictorOutcome::Probs(probs)
    }

    fn fall_back(&mut self, reason: &str, now: DateTime<Utc>) -> PredictorOutcome {
        self.fallbacks.record(reason, now);
        PredictorOutcome::Fallback(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_training_set, inference_features};
    use crate::synthetic::SyntheticLeague;

    #[test]
    fn untrained_predictor_falls_back_and_counts() {
        let mut p = GoalsPredictor::untrained();
        let now = Utc::now();
        for _ in 0..6 {
            assert!(matches!(p.predict(&[1.0; 20], now), PredictorOutcome::Fallback(_)));
        }
        assert_eq!(p.fallbacks().count(), 6);
        assert_eq!(p.fallbacks().summary(), vec![("predictor not trained".to_string(), 6)]);
    }

    #[test]
    fn fallback_log_keeps_recent_events_only() {
        let mut log = FallbackLog::default();
        let now = Utc::now();
        for _ in 0..FALLBACK_LOG_CAPACITY {
            log.record("predictor not trained", now);
        }
        for _ in 0..10 {
            log.record("non-finite features", now);
        }
        assert_eq!(log.count(), FALLBACK_LOG_CAPACITY + 10);
        assert_eq!(
            log.summary(),
            vec![
                ("predictor not trained".to_string(), FALLBACK_LOG_CAPACITY - 10),
                ("non-finite features".to_string(), 10),
            ]
        );
    }

    #[test]
    fn refuses_small_training_sets() {
        let league = SyntheticLeague::new(2, 39, 6);
        let (set, _) = build_training_set(&league.simulate_seasons(1));
        let mut p = GoalsPredictor::untrained();
        let err = p.train(&set, &GbmParams::default(), MIN_TRAINING_ROWS).unwrap_err();
        assert!(matches!(err, Unavailable::InsufficientData { needed: 100, .. }));
        assert!(!p.is_trained());
    }

    #[test]
    fn trained_pairs_sum_to_hundred() {
        let league = SyntheticLeague::new(8, 140, 10);
        let (set, book) = build_training_set(&league.simulate_seasons(3));
        assert!(set.len() >= MIN_TRAINING_ROWS);
        let params = GbmParams {
            n_estimators: 30,
            ..GbmParams::default()
        };
        let mut p = GoalsPredictor::untrained();
        let report = p.train(&set, &params, MIN_TRAINING_ROWS).unwrap();
        assert_eq!(report.rows, set.len());
        assert_eq!(report.metrics.get(Market::Over25).samples, set.len());
        assert!(report.metrics.get(Market::Over25).brier < 0.26);

        let f = inference_features(&book, league.teams[0].id, league.teams[9].id).unwrap();
        match p.predict(&f, Utc::now()) {
            PredictorOutcome::Probs(probs) => {
                assert!((probs.over25 + probs.under25 - 100.0).abs() < 1e-9);
                assert!((probs.btts_yes + probs.btts_no - 100.0).abs() < 1e-9);
            }
            PredictorOutcome::Fallback(reason) => panic!("unexpected fallback: {reason}"),
        }
        assert_eq!(p.fallbacks().count(), 0);
    }
}
