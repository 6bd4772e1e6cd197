use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gbm::GbmParams;

pub const CONFIG_ENV: &str = "FOOTY_VALUE_CONFIG";

/// Rolling comparison that moves the predictor's share of the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub window_size: usize,
    pub step: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            step: 0.05,
            min_weight: 0.15,
            max_weight: 0.40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub min_confidence: f64,
    pub min_odd: f64,
    pub max_odd: f64,
    pub kelly_multiplier: f64,
    pub kelly_cap: f64,
    /// Fixtures closer than this to kickoff are neither scanned nor refreshed.
    pub kickoff_buffer_minutes: i64,
    pub top_alerts: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 60.0,
            min_odd: 1.80,
            max_odd: 2.10,
            kelly_multiplier: 0.25,
            kelly_cap: 0.25,
            kickoff_buffer_minutes: 15,
            top_alerts: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityConfig {
    pub min_total_lambda: f64,
    pub max_total_lambda: f64,
    /// Allowed distance of over + under from 100.
    pub pair_sum_tolerance: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            min_total_lambda: 1.6,
            max_total_lambda: 4.2,
            pair_sum_tolerance: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub predictor_enabled: bool,
    pub consensus_filter: bool,
    pub consensus_threshold: f64,
    pub initial_predictor_weight: f64,
    pub min_training_rows: usize,
    pub adaptive: AdaptiveConfig,
    pub decision: DecisionConfig,
    pub sanity: SanityConfig,
    pub gbm: GbmParams,
    pub initial_bankroll: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            predictor_enabled: true,
            consensus_filter: true,
            consensus_threshold: 0.15,
            initial_predictor_weight: 0.25,
            min_training_rows: 100,
            adaptive: AdaptiveConfig::default(),
            decision: DecisionConfig::default(),
            sanity: SanityConfig::default(),
            gbm: GbmParams::default(),
            initial_bankroll: 200.0,
        }
    }
}

impl EngineConfig {
    /// Reads `path` if given, else `$FOOTY_VALUE_CONFIG`, else defaults; then
    /// applies single-knob env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = opt_env(CONFIG_ENV);
        let path = path.map(Path::to_path_buf).or_else(|| from_env.map(Into::into));
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("read config {}", p.display()))?;
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("invalid config {}", p.display()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_env();
        Ok(config.normalized())
    }

    fn apply_env(&mut self) {
        if let Some(flag) = opt_env("FOOTY_PREDICTOR") {
            self.predictor_enabled = !matches!(flag.as_str(), "0" | "false" | "off");
        }
        if let Some(flag) = opt_env("FOOTY_CONSENSUS") {
            self.consensus_filter = !matches!(flag.as_str(), "0" | "false" | "off");
        }
        self.consensus_threshold = env::var("FOOTY_CONSENSUS_THRESHOLD")
            .ok()
            .and_then(|val| val.parse::<f64>().ok())
            .unwrap_or(self.consensus_threshold);
        self.decision.min_confidence = env::var("FOOTY_MIN_CONFIDENCE")
            .ok()
            .and_then(|val| val.parse::<f64>().ok())
            .unwrap_or(self.decision.min_confidence);
    }

    /// Clamps values that would break the numeric core.
    pub fn normalized(mut self) -> Self {
        let a = &mut self.adaptive;
        a.window_size = a.window_size.max(1);
        a.min_weight = a.min_weight.clamp(0.0, 1.0);
        a.max_weight = a.max_weight.clamp(a.min_weight, 1.0);
        self.initial_predictor_weight = self.initial_predictor_weight.clamp(a.min_weight, a.max_weight);
        self.consensus_threshold = self.consensus_threshold.clamp(0.0, 1.0);
        self.decision.kelly_cap = self.decision.kelly_cap.clamp(0.0, 1.0);
        self.decision.top_alerts = self.decision.top_alerts.max(1);
        self.gbm.max_depth = self.gbm.max_depth.clamp(1, 12);
        self
    }
}

fn opt_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .and_then(|val| if val.trim().is_empty() { None } else { Some(val) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"consensus_threshold":0.2,"decision":{"min_confidence":55}}"#).unwrap();
        assert_eq!(cfg.consensus_threshold, 0.2);
        assert_eq!(cfg.decision.min_confidence, 55.0);
        assert_eq!(cfg.decision.max_odd, 2.10);
        assert_eq!(cfg.adaptive.window_size, 50);
        assert_eq!(cfg.gbm.n_estimators, 100);
    }

    #[test]
    fn normalization_keeps_weight_inside_bounds() {
        let cfg = EngineConfig {
            initial_predictor_weight: 0.9,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(cfg.initial_predictor_weight, 0.40);
    }
}
