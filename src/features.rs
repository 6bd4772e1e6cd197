//! Point-in-time feature vectors for the goals predictor.
//!
//! Training replays history in kickoff order and captures each match's vector
//! from the aggregates of strictly earlier matches; the match is folded in only
//! afterwards. Inference reads the same aggregates after the last known match.

use chrono::{DateTime, Utc};

use crate::error::Unavailable;
use crate::history::HistoricalMatch;
use crate::market::Market;
use crate::team_stats::{EMA_ALPHA, TeamRunningStats, TeamStatsBook};

pub const N_FEATURES: usize = 20;
pub type FeatureVector = [f64; N_FEATURES];

/// Teams need this many earlier matches before a row is kept for training.
pub const MIN_PRIOR_MATCHES: u32 = 3;
const TRAINING_H2H_MEETINGS: usize = 3;
const INFERENCE_H2H_MEETINGS: usize = 5;
const INFERENCE_H2H_MIN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRow {
    pub match_id: u64,
    pub kickoff: DateTime<Utc>,
    pub features: FeatureVector,
    pub home_goals: u8,
    pub away_goals: u8,
}

impl TrainingRow {
    pub fn label(&self, market: Market) -> bool {
        market.settle(self.home_goals, self.away_goals)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub rows: Vec<TrainingRow>,
    /// Matches replayed but not kept because a team lacked history.
    pub skipped: usize,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn matrix(&self) -> Vec<FeatureVector> {
        self.rows.iter().map(|r| r.features).collect()
    }

    pub fn labels(&self, market: Market) -> Vec<bool> {
        self.rows.iter().map(|r| r.label(market)).collect()
    }
}

/// Replays `matches` once, returning the training rows and the book of
/// aggregates after the last match (ready for inference).
pub fn build_training_set(matches: &[HistoricalMatch]) -> (TrainingSet, TeamStatsBook) {
    let mut sorted: Vec<&HistoricalMatch> = matches.iter().collect();
    sorted.sort_by(|a, b| a.kickoff.cmp(&b.kickoff).then(a.match_id.cmp(&b.match_id)));

    let mut book = TeamStatsBook::default();
    let mut set = TrainingSet::default();
    for m in sorted {
        match training_features(&book, m.home_id, m.away_id) {
            Some(features) => set.rows.push(TrainingRow {
                match_id: m.match_id,
                kickoff: m.kickoff,
                features,
                home_goals: m.home_goals,
                away_goals: m.away_goals,
            }),
            None => set.skipped += 1,
        }
        book.absorb(m);
    }
    tracing::debug!(rows = set.rows.len(), skipped = set.skipped, "built training set");
    (set, book)
}

/// Training-time vector, or `None` while either team has fewer than
/// [`MIN_PRIOR_MATCHES`] earlier matches.
pub fn training_features(book: &TeamStatsBook, home_id: u32, away_id: u32) -> Option<FeatureVector> {
    let home = book.team(home_id)?;
    let away = book.team(away_id)?;
    if home.matches < MIN_PRIOR_MATCHES || away.matches < MIN_PRIOR_MATCHES {
        return None;
    }
    let (h2h_total, h2h_btts) = book.h2h_totals(home_id, away_id, TRAINING_H2H_MEETINGS, 1);
    Some(assemble(
        home,
        away,
        home.form_score(),
        away.form_score(),
        (h2h_total, h2h_btts),
    ))
}

/// Live vector for an upcoming fixture: EMA form and a stricter H2H rule.
pub fn inference_features(book: &TeamStatsBook, home_id: u32, away_id: u32) -> Result<FeatureVector, Unavailable> {
    let home = book.team(home_id).ok_or(Unavailable::UnknownTeam(home_id))?;
    let away = book.team(away_id).ok_or(Unavailable::UnknownTeam(away_id))?;
    let h2h = book.h2h_totals(home_id, away_id, INFERENCE_H2H_MEETINGS, INFERENCE_H2H_MIN);
    Ok(assemble(
        home,
        away,
        home.ema_form(EMA_ALPHA),
        away.ema_form(EMA_ALPHA),
        h2h,
    ))
}

fn assemble(
    home: &TeamRunningStats,
    away: &TeamRunningStats,
    home_form: f64,
    away_form: f64,
    (h2h_total, h2h_btts): (f64, f64),
) -> FeatureVector {
    let mut f = [0.0; N_FEATURES];
    f[0] = home.gf_avg();
    f[1] = home.ga_avg();
    f[2] = away.gf_avg();
    f[3] = away.ga_avg();
    f[4] = home.gf_home_avg();
    f[5] = home.ga_home_avg();
    f[6] = away.gf_away_avg();
    f[7] = away.ga_away_avg();
    f[8] = home_form;
    f[9] = away_form;
    f[10] = home.recent_gf_mean();
    f[11] = home.recent_ga_mean();
    f[12] = away.recent_gf_mean();
    f[13] = away.recent_ga_mean();
    f[14] = h2h_total;
    f[15] = h2h_btts;
    f[16] = home.gf_avg() - away.ga_avg();
    f[17] = away.gf_avg() - home.ga_avg();
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticLeague;

    #[test]
    fn replayed_rows_only_see_earlier_matches() {
        let league = SyntheticLeague::new(11, 39, 8);
        let matches = league.simulate_seasons(2);
        let (set, _) = build_training_set(&matches);
        assert!(!set.is_empty());

        for row in set.rows.iter().step_by(9) {
            let earlier: Vec<HistoricalMatch> = matches
                .iter()
                .filter(|m| (m.kickoff, m.match_id) < (row.kickoff, row.match_id))
                .cloned()
                .collect();
            let fresh = TeamStatsBook::from_matches(&earlier);
            let m = matches.iter().find(|m| m.match_id == row.match_id).unwrap();
            let expected = training_features(&fresh, m.home_id, m.away_id).unwrap();
            assert_eq!(expected, row.features, "match {}", row.match_id);
        }
    }

    #[test]
    fn early_matches_are_skipped_but_counted() {
        let league = SyntheticLeague::new(3, 61, 6);
        let matches = league.simulate_seasons(1);
        let (set, book) = build_training_set(&matches);
        assert_eq!(set.len() + set.skipped, matches.len());
        // First three rounds can never qualify.
        assert!(set.skipped >= 9);
        assert_eq!(book.matches_played(league.teams[0].id), 10);
    }

    #[test]
    fn inference_needs_known_teams() {
        let league = SyntheticLeague::new(5, 78, 6);
        let (_, book) = build_training_set(&league.simulate_seasons(1));
        let a = league.teams[0].id;
        let b = league.teams[1].id;
        let f = inference_features(&book, a, b).unwrap();
        assert_eq!(f[18], 0.0);
        assert!(f[8] >= 0.0 && f[8] <= 1.0);
        assert_eq!(inference_features(&book, a, 999_999), Err(Unavailable::UnknownTeam(999_999)));
    }
}
