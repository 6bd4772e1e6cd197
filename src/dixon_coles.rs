//! Time-weighted Dixon-Coles ratings, one model per (league, scope).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Unavailable;
use crate::history::HistoricalMatch;
use crate::league_params::{FitParams, LeagueParamsTable};
use crate::market::MarketScope;
use crate::optimizer::{Bounds, LbfgsOptions, minimize};

const RATING_BOUND: f64 = 1.5;
const HOME_ADV_MIN: f64 = 0.0;
const HOME_ADV_MAX: f64 = 0.6;
pub const RHO_MIN: f64 = -0.5;
pub const RHO_MAX: f64 = 0.2;
const INITIAL_GOALS_FLOOR: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub team_id: u32,
    pub attack: f64,
    pub defense: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueModel {
    pub league_id: u32,
    pub scope: MarketScope,
    pub ratings: BTreeMap<u32, TeamRating>,
    pub home_advantage: f64,
    pub rho: f64,
    pub sample_size: usize,
    pub fitted_at: DateTime<Utc>,
    /// Whether rho came from the likelihood fit rather than the scope prior.
    #[serde(default)]
    pub rho_fitted: bool,
}

impl LeagueModel {
    /// Expected goals `(home, away)` for a fixture between two rated teams.
    pub fn expected_goals(&self, home_id: u32, away_id: u32) -> Result<(f64, f64), Unavailable> {
        let home = self
            .ratings
            .get(&home_id)
            .ok_or(Unavailable::UnknownTeam(home_id))?;
        let away = self
            .ratings
            .get(&away_id)
            .ok_or(Unavailable::UnknownTeam(away_id))?;
        Ok(pair_lambdas(home, away, self.home_advantage))
    }

    pub fn contains(&self, team_id: u32) -> bool {
        self.ratings.contains_key(&team_id)
    }

    /// Share of a "full" sample, saturating at 80 matches.
    pub fn quality(&self) -> f64 {
        (self.sample_size as f64 / 80.0).min(1.0)
    }

    #[cfg(test)]
    pub fn empty_for_tests(league_id: u32, scope: MarketScope) -> Self {
        Self {
            league_id,
            scope,
            ratings: BTreeMap::new(),
            home_advantage: 0.25,
            rho: -0.08,
            sample_size: 0,
            fitted_at: Utc::now(),
            rho_fitted: false,
        }
    }
}

fn pair_lambdas(home: &TeamRating, away: &TeamRating, home_adv: f64) -> (f64, f64) {
    (
        (home.attack + away.defense + home_adv).exp(),
        (away.attack + home.defense).exp(),
    )
}

/// Fitted models keyed by league and scope.
#[derive(Debug, Clone, Default)]
pub struct RatingStore {
    models: HashMap<(u32, MarketScope), LeagueModel>,
}

impl RatingStore {
    pub fn insert(&mut self, model: LeagueModel) {
        self.models.insert((model.league_id, model.scope), model);
    }

    pub fn get(&self, league_id: u32, scope: MarketScope) -> Option<&LeagueModel> {
        self.models.get(&(league_id, scope))
    }

    /// The model if its sample meets the scope's minimum.
    pub fn usable(&self, league_id: u32, scope: MarketScope, min_matches: usize) -> Option<&LeagueModel> {
        self.get(league_id, scope)
            .filter(|m| m.sample_size >= min_matches)
    }

    pub fn models(&self) -> impl Iterator<Item = &LeagueModel> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Stores every successful scope of a league fit and logs the rest.
    pub fn absorb(&mut self, fit: LeagueFit) {
        for (scope, reason) in &fit.failures {
            warn!(
                league_id = fit.league_id,
                scope = %scope,
                reason = reason.kind(),
                "rating fit unavailable: {reason}"
            );
        }
        for model in fit.models {
            self.insert(model);
        }
    }
}

/// Outcome of fitting every scope of one league.
#[derive(Debug, Clone)]
pub struct LeagueFit {
    pub league_id: u32,
    pub models: Vec<LeagueModel>,
    pub failures: Vec<(MarketScope, Unavailable)>,
}

/// Fits all scopes of a league. The General fit runs first and fixes home
/// advantage for the other scopes; if it fails they use the table seed.
pub fn fit_league(
    matches: &[HistoricalMatch],
    league_id: u32,
    params: &LeagueParamsTable,
    as_of: DateTime<Utc>,
) -> LeagueFit {
    let mut models = Vec::new();
    let mut failures = Vec::new();

    let general_params = params.get(league_id, MarketScope::General);
    let home_adv = match fit_league_model(matches, league_id, MarketScope::General, &general_params, None, as_of) {
        Ok(model) => {
            let h = model.home_advantage;
            models.push(model);
            h
        }
        Err(err) => {
            failures.push((MarketScope::General, err));
            general_params.home_adv
        }
    };

    for scope in [MarketScope::Over, MarketScope::Under, MarketScope::Btts] {
        let p = params.get(league_id, scope);
        match fit_league_model(matches, league_id, scope, &p, Some(home_adv), as_of) {
            Ok(model) => models.push(model),
            Err(err) => failures.push((scope, err)),
        }
    }

    LeagueFit {
        league_id,
        models,
        failures,
    }
}

/// Fits several leagues on the rayon pool. Output order follows input order.
pub fn fit_leagues_parallel(
    leagues: &[(u32, Vec<HistoricalMatch>)],
    params: &LeagueParamsTable,
    as_of: DateTime<Utc>,
) -> Vec<LeagueFit> {
    let fits: Vec<LeagueFit> = leagues
        .par_iter()
        .map(|(league_id, matches)| fit_league(matches, *league_id, params, as_of))
        .collect();
    let fitted: usize = fits.iter().map(|f| f.models.len()).sum();
    info!(leagues = fits.len(), models = fitted, "rating fits complete");
    fits
}

struct WeightedMatch {
    home: usize,
    away: usize,
    home_goals: f64,
    away_goals: f64,
    weight: f64,
}

/// One Dixon-Coles fit. `fixed_home_adv` pins home advantage (non-general scopes).
pub fn fit_league_model(
    matches: &[HistoricalMatch],
    league_id: u32,
    scope: MarketScope,
    params: &FitParams,
    fixed_home_adv: Option<f64>,
    as_of: DateTime<Utc>,
) -> Result<LeagueModel, Unavailable> {
    let usable: Vec<&HistoricalMatch> = matches
        .iter()
        .filter(|m| m.league_id == league_id && m.kickoff <= as_of && m.home_id != m.away_id)
        .collect();
    if usable.len() < params.min_matches {
        return Err(Unavailable::InsufficientData {
            needed: params.min_matches,
            found: usable.len(),
        });
    }

    let teams: Vec<u32> = usable
        .iter()
        .flat_map(|m| [m.home_id, m.away_id])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: HashMap<u32, usize> = teams.iter().enumerate().map(|(i, t)| (*t, i)).collect();
    let n = teams.len();

    let data: Vec<WeightedMatch> = usable
        .iter()
        .map(|m| {
            let days = ((as_of - m.kickoff).num_seconds() as f64 / 86_400.0).max(0.0);
            WeightedMatch {
                home: index[&m.home_id],
                away: index[&m.away_id],
                home_goals: m.home_goals as f64,
                away_goals: m.away_goals as f64,
                weight: (-params.xi_decay * days).exp(),
            }
        })
        .collect();

    let x0 = initial_guess(&data, n, fixed_home_adv.unwrap_or(params.home_adv));
    let mut bounds = Bounds::uniform(2 * n + 1, -RATING_BOUND, RATING_BOUND);
    match fixed_home_adv {
        Some(h) => bounds.fix(2 * n, h.clamp(HOME_ADV_MIN, HOME_ADV_MAX)),
        None => bounds.set(2 * n, HOME_ADV_MIN, HOME_ADV_MAX),
    }

    let reg = params.lambda_reg;
    let stage1 = minimize(
        |x, g| rating_objective(x, g, &data, n, reg),
        &x0,
        &bounds,
        LbfgsOptions {
            max_iter: 500,
            ..LbfgsOptions::default()
        },
    )?;
    if !stage1.converged {
        return Err(Unavailable::NumericalFailure(format!(
            "rating fit did not converge after {} iterations",
            stage1.iterations
        )));
    }
    if stage1.x.iter().any(|v| !v.is_finite()) {
        return Err(Unavailable::NumericalFailure(
            "rating fit produced non-finite parameters".to_string(),
        ));
    }

    let mut x = stage1.x;
    center_attack(&mut x, n);
    let home_advantage = x[2 * n];

    let ratings: BTreeMap<u32, TeamRating> = teams
        .iter()
        .enumerate()
        .map(|(i, team_id)| {
            (
                *team_id,
                TeamRating {
                    team_id: *team_id,
                    attack: x[i],
                    defense: x[n + i],
                },
            )
        })
        .collect();

    let (rho, rho_fitted) = match fit_rho(&data, &x, n, params.rho_prior) {
        Some(rho) => (rho, true),
        None => {
            debug!(league_id, scope = %scope, "rho fit failed, using prior");
            (params.rho_prior, false)
        }
    };

    debug!(
        league_id,
        scope = %scope,
        teams = n,
        matches = data.len(),
        home_advantage,
        rho,
        iterations = stage1.iterations,
        "fitted league model"
    );

    Ok(LeagueModel {
        league_id,
        scope,
        ratings,
        home_advantage,
        rho,
        sample_size: data.len(),
        fitted_at: as_of,
        rho_fitted,
    })
}

fn initial_guess(data: &[WeightedMatch], n: usize, home_adv: f64) -> Vec<f64> {
    let mut gf = vec![0.0; n];
    let mut ga = vec![0.0; n];
    let mut w = vec![0.0; n];
    for m in data {
        gf[m.home] += m.weight * m.home_goals;
        ga[m.home] += m.weight * m.away_goals;
        w[m.home] += m.weight;
        gf[m.away] += m.weight * m.away_goals;
        ga[m.away] += m.weight * m.home_goals;
        w[m.away] += m.weight;
    }
    let mut x = vec![0.0; 2 * n + 1];
    for i in 0..n {
        let denom = w[i].max(1e-9);
        x[i] = (gf[i] / denom).max(INITIAL_GOALS_FLOOR).ln().clamp(-RATING_BOUND, RATING_BOUND);
        x[n + i] = (ga[i] / denom).max(INITIAL_GOALS_FLOOR).ln().clamp(-RATING_BOUND, RATING_BOUND);
    }
    x[2 * n] = home_adv.clamp(HOME_ADV_MIN, HOME_ADV_MAX);
    x
}

/// Weighted Poisson negative log-likelihood plus the L2 pull toward the mean.
/// Layout: `[attack; n], [defense; n], home`.
fn rating_objective(x: &[f64], g: &mut [f64], data: &[WeightedMatch], n: usize, reg: f64) -> f64 {
    g.iter_mut().for_each(|v| *v = 0.0);
    let home = x[2 * n];
    let mut nll = 0.0;
    for m in data {
        let log_h = x[m.home] + x[n + m.away] + home;
        let log_a = x[m.away] + x[n + m.home];
        let lh = log_h.exp();
        let la = log_a.exp();
        nll += m.weight * (lh - m.home_goals * log_h + la - m.away_goals * log_a);

        let dh = m.weight * (lh - m.home_goals);
        let da = m.weight * (la - m.away_goals);
        g[m.home] += dh;
        g[n + m.away] += dh;
        g[2 * n] += dh;
        g[m.away] += da;
        g[n + m.home] += da;
    }

    for block in [0..n, n..2 * n] {
        let mean = x[block.clone()].iter().sum::<f64>() / n as f64;
        for i in block {
            let d = x[i] - mean;
            nll += reg * d * d;
            g[i] += 2.0 * reg * d;
        }
    }
    nll
}

/// Zero-mean attack; the mean moves into defense so every
/// `attack_i + defense_j` sum is unchanged.
fn center_attack(x: &mut [f64], n: usize) {
    if n == 0 {
        return;
    }
    let mean = x[..n].iter().sum::<f64>() / n as f64;
    for i in 0..n {
        x[i] -= mean;
        x[n + i] += mean;
    }
}

pub fn dc_tau(home_goals: u32, away_goals: u32, lambda_home: f64, lambda_away: f64, rho: f64) -> f64 {
    match (home_goals, away_goals) {
        (0, 0) => 1.0 - lambda_home * lambda_away * rho,
        (0, 1) => 1.0 + lambda_home * rho,
        (1, 0) => 1.0 + lambda_away * rho,
        (1, 1) => 1.0 - rho,
        _ => 1.0,
    }
}

fn dc_tau_grad(home_goals: u32, away_goals: u32, lambda_home: f64, lambda_away: f64) -> f64 {
    match (home_goals, away_goals) {
        (0, 0) => -lambda_home * lambda_away,
        (0, 1) => lambda_home,
        (1, 0) => lambda_away,
        (1, 1) => -1.0,
        _ => 0.0,
    }
}

/// Maximises the tau part of the Dixon-Coles likelihood with ratings held
/// fixed. `None` when the search fails to converge.
fn fit_rho(data: &[WeightedMatch], x: &[f64], n: usize, prior: f64) -> Option<f64> {
    let home = x[2 * n];
    let low: Vec<(u32, u32, f64, f64, f64)> = data
        .iter()
        .filter(|m| m.home_goals <= 1.0 && m.away_goals <= 1.0)
        .map(|m| {
            let lh = (x[m.home] + x[n + m.away] + home).exp();
            let la = (x[m.away] + x[n + m.home]).exp();
            (m.home_goals as u32, m.away_goals as u32, lh, la, m.weight)
        })
        .collect();
    if low.is_empty() {
        return None;
    }

    let objective = |r: &[f64], g: &mut [f64]| {
        let rho = r[0];
        let mut value = 0.0;
        let mut grad = 0.0;
        for (hg, ag, lh, la, w) in &low {
            let tau = dc_tau(*hg, *ag, *lh, *la, rho);
            if tau <= 0.0 {
                g[0] = 0.0;
                return f64::INFINITY;
            }
            value -= w * tau.ln();
            grad -= w * dc_tau_grad(*hg, *ag, *lh, *la) / tau;
        }
        g[0] = grad;
        value
    };

    let start = prior.clamp(RHO_MIN, RHO_MAX);
    let sol = minimize(
        objective,
        &[start],
        &Bounds::uniform(1, RHO_MIN, RHO_MAX),
        LbfgsOptions::default(),
    )
    .ok()?;
    (sol.converged && sol.x[0].is_finite()).then_some(sol.x[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticLeague;

    fn params(min_matches: usize) -> FitParams {
        FitParams {
            xi_decay: 0.003,
            lambda_reg: 0.08,
            home_adv: 0.26,
            rho_prior: -0.08,
            min_matches,
        }
    }

    #[test]
    fn centering_keeps_pair_sums() {
        let n = 4;
        let mut x = vec![0.3, -0.1, 0.5, 0.2, -0.4, 0.1, 0.0, -0.2, 0.25];
        let before: Vec<f64> = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| x[i] + x[n + j] + x[2 * n])
            .collect();
        center_attack(&mut x, n);
        let mean: f64 = x[..n].iter().sum::<f64>() / n as f64;
        assert!(mean.abs() < 1e-12);
        let after: Vec<f64> = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| x[i] + x[n + j] + x[2 * n])
            .collect();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn too_few_matches_is_insufficient_data() {
        let league = SyntheticLeague::new(7, 39, 6);
        let matches = league.simulate_seasons(1);
        let as_of = matches.last().unwrap().kickoff;
        let err = fit_league_model(&matches[..10], 39, MarketScope::General, &params(45), None, as_of)
            .unwrap_err();
        assert_eq!(
            err,
            Unavailable::InsufficientData {
                needed: 45,
                found: 10
            }
        );
    }

    #[test]
    fn fit_ranks_strong_attack_above_weak() {
        let league = SyntheticLeague::new(11, 39, 10);
        let matches = league.simulate_seasons(3);
        let as_of = matches.last().unwrap().kickoff;
        let model = fit_league_model(&matches, 39, MarketScope::General, &params(45), None, as_of).unwrap();

        let mean_attack: f64 =
            model.ratings.values().map(|r| r.attack).sum::<f64>() / model.ratings.len() as f64;
        assert!(mean_attack.abs() < 1e-9);
        assert!((HOME_ADV_MIN..=HOME_ADV_MAX).contains(&model.home_advantage));
        assert!((RHO_MIN..=RHO_MAX).contains(&model.rho));

        let strongest = league.strongest_attack();
        let weakest = league.weakest_attack();
        assert!(model.ratings[&strongest].attack > model.ratings[&weakest].attack);
    }

    #[test]
    fn non_general_scopes_share_general_home_advantage() {
        let league = SyntheticLeague::new(3, 140, 8);
        let matches = league.simulate_seasons(3);
        let as_of = matches.last().unwrap().kickoff;
        let fit = fit_league(&matches, 140, &LeagueParamsTable::builtin(), as_of);
        assert!(fit.failures.is_empty(), "{:?}", fit.failures);
        let general = fit.models.iter().find(|m| m.scope == MarketScope::General).unwrap();
        for model in fit.models.iter().filter(|m| m.scope != MarketScope::General) {
            assert!((model.home_advantage - general.home_advantage).abs() < 1e-12);
        }
        assert_eq!(fit.models.len(), 4);
    }

    #[test]
    fn future_matches_are_ignored() {
        let league = SyntheticLeague::new(5, 39, 6);
        let matches = league.simulate_seasons(2);
        let cutoff = matches[matches.len() / 2].kickoff;
        let model = fit_league_model(&matches, 39, MarketScope::General, &params(20), None, cutoff).unwrap();
        let expected = matches.iter().filter(|m| m.kickoff <= cutoff).count();
        assert_eq!(model.sample_size, expected);
    }
}
