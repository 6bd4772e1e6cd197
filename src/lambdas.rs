//! Expected goals for a fixture: the heuristic estimate from decay-weighted
//! team averages, and rating-model lambdas with the same form and
//! head-to-head adjustments applied.

use chrono::{DateTime, Utc};

use crate::dixon_coles::LeagueModel;
use crate::error::Unavailable;
use crate::history::HistoricalMatch;
use crate::team_stats::{H2hSummary, TeamStatsBook};

pub const SIMPLE_LAMBDA_MIN: f64 = 0.5;
pub const SIMPLE_LAMBDA_MAX: f64 = 4.0;
const H2H_MEETINGS: usize = 5;
const H2H_MIN_MEETINGS: usize = 2;

/// Decay-weighted home and away scoring rates for one team.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedTeamStats {
    pub gf_home: f64,
    pub ga_home: f64,
    pub gf_away: f64,
    pub ga_away: f64,
    pub matches: usize,
}

impl Default for WeightedTeamStats {
    fn default() -> Self {
        Self {
            gf_home: 1.35,
            ga_home: 1.35,
            gf_away: 1.20,
            ga_away: 1.35,
            matches: 0,
        }
    }
}

/// Weights each match by `exp(-xi_decay · days before as_of)`; matches after
/// `as_of` are ignored. A side with no matches keeps its default.
pub fn weighted_team_stats(
    matches: &[HistoricalMatch],
    team_id: u32,
    xi_decay: f64,
    as_of: DateTime<Utc>,
) -> WeightedTeamStats {
    let mut home = (0.0, 0.0, 0.0);
    let mut away = (0.0, 0.0, 0.0);
    let mut n = 0usize;
    for m in matches {
        if m.kickoff > as_of || !m.involves(team_id) {
            continue;
        }
        let days = (as_of - m.kickoff).num_days().max(0) as f64;
        let w = (-xi_decay * days).exp();
        n += 1;
        if m.home_id == team_id {
            home.0 += w * m.home_goals as f64;
            home.1 += w * m.away_goals as f64;
            home.2 += w;
        } else {
            away.0 += w * m.away_goals as f64;
            away.1 += w * m.home_goals as f64;
            away.2 += w;
        }
    }

    let defaults = WeightedTeamStats::default();
    let (gf_home, ga_home) = if home.2 > 0.0 {
        (home.0 / home.2, home.1 / home.2)
    } else {
        (defaults.gf_home, defaults.ga_home)
    };
    let (gf_away, ga_away) = if away.2 > 0.0 {
        (away.0 / away.2, away.1 / away.2)
    } else {
        (defaults.gf_away, defaults.ga_away)
    };
    WeightedTeamStats {
        gf_home,
        ga_home,
        gf_away,
        ga_away,
        matches: n,
    }
}

/// Asymmetric multiplier: good form adds up to 10%, bad form takes up to 20%.
pub fn form_adjustment(form: f64) -> f64 {
    if form >= 0.5 {
        1.0 + (form - 0.5) * 0.20
    } else {
        1.0 + (form - 0.5) * 0.40
    }
}

/// Everything about a fixture the lambda builders read besides the ratings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixtureContext {
    pub home: WeightedTeamStats,
    pub away: WeightedTeamStats,
    pub home_form: f64,
    pub away_form: f64,
    pub h2h: Option<H2hSummary>,
}

impl FixtureContext {
    pub fn build(
        book: &TeamStatsBook,
        league_matches: &[HistoricalMatch],
        home_id: u32,
        away_id: u32,
        xi_decay: f64,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            home: weighted_team_stats(league_matches, home_id, xi_decay, as_of),
            away: weighted_team_stats(league_matches, away_id, xi_decay, as_of),
            home_form: book.team(home_id).map_or(0.5, |t| t.form_indicator()),
            away_form: book.team(away_id).map_or(0.5, |t| t.form_indicator()),
            h2h: book.h2h(home_id, away_id, H2H_MEETINGS, H2H_MIN_MEETINGS),
        }
    }

    fn adjust(&self, (lh, la): (f64, f64)) -> (f64, f64) {
        let lh = lh * form_adjustment(self.home_form);
        let la = la * form_adjustment(self.away_form);
        blend_h2h((lh, la), self.h2h.as_ref())
    }
}

/// Pulls lambdas toward the head-to-head averages, `w = 0.05 + 0.15·quality`.
pub fn blend_h2h((lh, la): (f64, f64), h2h: Option<&H2hSummary>) -> (f64, f64) {
    match h2h {
        Some(s) => {
            let w = 0.05 + 0.15 * s.quality;
            (
                lh * (1.0 - w) + s.home_goals_avg * w,
                la * (1.0 - w) + s.away_goals_avg * w,
            )
        }
        None => (lh, la),
    }
}

/// Heuristic lambdas from team averages, clamped to [0.5, 4.0].
pub fn simple_lambdas(ctx: &FixtureContext, home_adv: f64) -> (f64, f64) {
    let lh = ctx.home.gf_home * ctx.away.ga_away * (1.0 + home_adv);
    let la = ctx.away.gf_away * ctx.home.ga_home;
    let (lh, la) = ctx.adjust((lh, la));
    (
        lh.clamp(SIMPLE_LAMBDA_MIN, SIMPLE_LAMBDA_MAX),
        la.clamp(SIMPLE_LAMBDA_MIN, SIMPLE_LAMBDA_MAX),
    )
}

/// Rating-model lambdas with the fixture's form and head-to-head applied.
pub fn rating_lambdas(
    model: &LeagueModel,
    home_id: u32,
    away_id: u32,
    ctx: &FixtureContext,
) -> Result<(f64, f64), Unavailable> {
    Ok(ctx.adjust(model.expected_goals(home_id, away_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 15, 0, 0).unwrap() + Duration::days(days)
    }

    fn m(id: u64, day: i64, home: u32, away: u32, hg: u8, ag: u8) -> HistoricalMatch {
        HistoricalMatch {
            match_id: id,
            league_id: 39,
            season: "2024/2025".to_string(),
            kickoff: at(day),
            home_id: home,
            away_id: away,
            home_goals: hg,
            away_goals: ag,
        }
    }

    #[test]
    fn weighted_stats_favour_recent_matches() {
        let matches = vec![m(1, -300, 1, 2, 0, 0), m(2, -1, 1, 3, 4, 1), m(3, 5, 1, 4, 9, 9)];
        let s = weighted_team_stats(&matches, 1, 0.01, at(0));
        assert_eq!(s.matches, 2);
        assert!(s.gf_home > 3.5 && s.gf_home < 4.0);
        // Never played away: defaults.
        assert_eq!(s.gf_away, 1.20);
        assert_eq!(s.ga_away, 1.35);
    }

    #[test]
    fn form_adjustment_is_asymmetric() {
        assert!((form_adjustment(1.0) - 1.10).abs() < 1e-12);
        assert!((form_adjustment(0.0) - 0.80).abs() < 1e-12);
        assert_eq!(form_adjustment(0.5), 1.0);
    }

    #[test]
    fn simple_lambdas_are_clamped() {
        let hot = WeightedTeamStats {
            gf_home: 4.0,
            ga_home: 3.0,
            gf_away: 3.0,
            ga_away: 3.0,
            matches: 10,
        };
        let ctx = FixtureContext {
            home: hot,
            away: hot,
            home_form: 0.5,
            away_form: 0.5,
            h2h: None,
        };
        assert_eq!(simple_lambdas(&ctx, 0.25), (4.0, 4.0));

        let neutral = FixtureContext {
            home: WeightedTeamStats::default(),
            away: WeightedTeamStats::default(),
            ..ctx
        };
        let (lh, la) = simple_lambdas(&neutral, 0.25);
        assert!((lh - 1.35 * 1.35 * 1.25).abs() < 1e-12);
        assert!((la - 1.20 * 1.35).abs() < 1e-12);
    }

    #[test]
    fn h2h_weight_grows_with_quality() {
        let summary = H2hSummary {
            meetings: 5,
            avg_total_goals: 4.0,
            btts_rate: 1.0,
            home_goals_avg: 3.0,
            away_goals_avg: 1.0,
            quality: 1.0,
        };
        let (lh, la) = blend_h2h((1.0, 1.0), Some(&summary));
        assert!((lh - (0.8 + 0.6)).abs() < 1e-12);
        assert!((la - 1.0).abs() < 1e-12);
        assert_eq!(blend_h2h((1.3, 0.9), None), (1.3, 0.9));
    }
}
