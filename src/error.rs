use thiserror::Error;

use crate::market::Market;

/// Why the numeric core produced no answer for a league, model or fixture.
///
/// None of these are fatal: callers fall back to a narrower path (heuristic
/// ratings, rating-only ensemble) or emit no decision for the fixture.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Unavailable {
    #[error("insufficient data: need {needed} matches, found {found}")]
    InsufficientData { needed: usize, found: usize },

    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("prediction failure: {0}")]
    PredictionFailure(String),

    #[error("consensus veto on {market}: models disagree by {disagreement:.3}")]
    ConsensusVeto { market: Market, disagreement: f64 },

    #[error("sanity check failed: {0}")]
    SanityCheck(String),

    #[error("team {0} not present in fitted model")]
    UnknownTeam(u32),
}

impl Unavailable {
    /// Short machine-friendly tag, used as a log field and in fallback summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Unavailable::InsufficientData { .. } => "insufficient_data",
            Unavailable::NumericalFailure(_) => "numerical_failure",
            Unavailable::PredictionFailure(_) => "prediction_failure",
            Unavailable::ConsensusVeto { .. } => "consensus_veto",
            Unavailable::SanityCheck(_) => "sanity_check",
            Unavailable::UnknownTeam(_) => "unknown_team",
        }
    }
}
