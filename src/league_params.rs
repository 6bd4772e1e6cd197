use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::market::MarketScope;
use crate::persist::app_cache_dir;

/// Hyperparameters of one Dixon-Coles fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    /// Exponential decay per day of match age.
    pub xi_decay: f64,
    /// L2 pull of ratings toward the cross-team mean.
    pub lambda_reg: f64,
    /// Seed for home advantage; also used by the heuristic rating.
    pub home_adv: f64,
    /// Seed for the rho stage, and its fallback.
    pub rho_prior: f64,
    pub min_matches: usize,
}

impl FitParams {
    const fn new(xi_decay: f64, lambda_reg: f64, home_adv: f64, rho_prior: f64, min_matches: usize) -> Self {
        Self {
            xi_decay,
            lambda_reg,
            home_adv,
            rho_prior,
            min_matches,
        }
    }

    pub fn defaults(scope: MarketScope) -> Self {
        match scope {
            MarketScope::General => FitParams::new(0.0030, 0.08, 0.26, -0.08, 45),
            MarketScope::Over => FitParams::new(0.0030, 0.06, 0.24, -0.07, 45),
            MarketScope::Under => FitParams::new(0.0030, 0.09, 0.28, -0.11, 45),
            MarketScope::Btts => FitParams::new(0.0030, 0.08, 0.26, -0.08, 45),
        }
    }
}

type ScopeRow = [(f64, f64, f64, f64, usize); 4];

// Columns: general, over, under, btts. Each entry is
// (xi_decay, lambda_reg, home_adv, rho_prior, min_matches).
// Only rho_prior and xi_decay move between scopes of one league.
const LEAGUE_TABLE: &[(u32, ScopeRow)] = &[
    (39, [(0.0025, 0.06, 0.28, -0.12, 50), (0.0022, 0.06, 0.28, -0.09, 50), (0.0028, 0.06, 0.28, -0.14, 50), (0.0025, 0.06, 0.28, -0.11, 50)]),
    (140, [(0.0028, 0.07, 0.30, -0.10, 50), (0.0024, 0.07, 0.30, -0.08, 50), (0.0032, 0.07, 0.30, -0.12, 50), (0.0028, 0.07, 0.30, -0.09, 50)]),
    (135, [(0.0030, 0.08, 0.26, -0.09, 50), (0.0026, 0.08, 0.26, -0.07, 50), (0.0034, 0.08, 0.26, -0.11, 50), (0.0030, 0.08, 0.26, -0.08, 50)]),
    (78, [(0.0027, 0.065, 0.27, -0.11, 50), (0.0024, 0.065, 0.27, -0.09, 50), (0.0030, 0.065, 0.27, -0.13, 50), (0.0027, 0.065, 0.27, -0.10, 50)]),
    (61, [(0.0029, 0.075, 0.25, -0.08, 50), (0.0025, 0.075, 0.25, -0.06, 50), (0.0033, 0.075, 0.25, -0.10, 50), (0.0029, 0.075, 0.25, -0.07, 50)]),
    (88, [(0.0032, 0.09, 0.29, -0.10, 45), (0.0028, 0.09, 0.29, -0.08, 45), (0.0036, 0.09, 0.29, -0.12, 45), (0.0032, 0.09, 0.29, -0.09, 45)]),
    (40, [(0.0035, 0.10, 0.24, -0.07, 45), (0.0031, 0.10, 0.24, -0.05, 45), (0.0039, 0.10, 0.24, -0.09, 45), (0.0035, 0.10, 0.24, -0.06, 45)]),
    (141, [(0.0038, 0.11, 0.23, -0.06, 45), (0.0034, 0.11, 0.23, -0.04, 45), (0.0042, 0.11, 0.23, -0.08, 45), (0.0038, 0.11, 0.23, -0.05, 45)]),
    (136, [(0.0036, 0.10, 0.22, -0.07, 45), (0.0032, 0.10, 0.22, -0.05, 45), (0.0040, 0.10, 0.22, -0.09, 45), (0.0036, 0.10, 0.22, -0.06, 45)]),
    (79, [(0.0034, 0.09, 0.24, -0.08, 45), (0.0030, 0.09, 0.24, -0.06, 45), (0.0038, 0.09, 0.24, -0.10, 45), (0.0034, 0.09, 0.24, -0.07, 45)]),
    (62, [(0.0037, 0.11, 0.23, -0.06, 45), (0.0033, 0.11, 0.23, -0.04, 45), (0.0041, 0.11, 0.23, -0.08, 45), (0.0037, 0.11, 0.23, -0.05, 45)]),
    (179, [(0.0033, 0.095, 0.26, -0.09, 40), (0.0029, 0.095, 0.26, -0.07, 40), (0.0037, 0.095, 0.26, -0.11, 40), (0.0033, 0.095, 0.26, -0.08, 40)]),
    (94, [(0.0031, 0.085, 0.27, -0.10, 45), (0.0027, 0.085, 0.27, -0.08, 45), (0.0035, 0.085, 0.27, -0.12, 45), (0.0031, 0.085, 0.27, -0.09, 45)]),
    (144, [(0.0030, 0.08, 0.28, -0.09, 45), (0.0026, 0.08, 0.28, -0.07, 45), (0.0034, 0.08, 0.28, -0.11, 45), (0.0030, 0.08, 0.28, -0.08, 45)]),
    (207, [(0.0032, 0.09, 0.26, -0.08, 45), (0.0028, 0.09, 0.26, -0.06, 45), (0.0036, 0.09, 0.26, -0.10, 45), (0.0032, 0.09, 0.26, -0.07, 45)]),
];

static BUILTIN: Lazy<HashMap<(u32, MarketScope), FitParams>> = Lazy::new(|| {
    let mut out = HashMap::new();
    for (league_id, row) in LEAGUE_TABLE {
        for (scope, (xi, reg, home, rho, min)) in MarketScope::ALL.into_iter().zip(row.iter()) {
            out.insert((*league_id, scope), FitParams::new(*xi, *reg, *home, *rho, *min));
        }
    }
    out
});

/// Fit parameters for every (league, scope), with cached overrides on top of
/// the built-in table and per-scope defaults underneath.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeagueParamsTable {
    #[serde(default)]
    overrides: HashMap<String, FitParams>,
}

impl LeagueParamsTable {
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn get(&self, league_id: u32, scope: MarketScope) -> FitParams {
        if let Some(p) = self.overrides.get(&override_key(league_id, scope)) {
            return *p;
        }
        BUILTIN
            .get(&(league_id, scope))
            .copied()
            .unwrap_or_else(|| FitParams::defaults(scope))
    }

    pub fn set_override(&mut self, league_id: u32, scope: MarketScope, params: FitParams) {
        self.overrides.insert(override_key(league_id, scope), params);
    }

    pub fn known_leagues() -> Vec<u32> {
        LEAGUE_TABLE.iter().map(|(id, _)| *id).collect()
    }
}

fn override_key(league_id: u32, scope: MarketScope) -> String {
    format!("{league_id}:{}", scope.key())
}

pub fn load_cached_params() -> LeagueParamsTable {
    let Some(path) = params_path() else {
        return LeagueParamsTable::builtin();
    };
    let Ok(raw) = fs::read_to_string(path) else {
        return LeagueParamsTable::builtin();
    };
    serde_json::from_str::<LeagueParamsTable>(&raw).unwrap_or_default()
}

pub fn save_cached_params(params: &LeagueParamsTable) -> Result<()> {
    let Some(path) = params_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(params).context("serialize league params")?;
    fs::write(&tmp, json).context("write league params")?;
    fs::rename(&tmp, &path).context("swap league params")?;
    Ok(())
}

fn params_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join("league_params.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_league_uses_scope_defaults() {
        let table = LeagueParamsTable::builtin();
        let p = table.get(999_999, MarketScope::Under);
        assert_eq!(p, FitParams::defaults(MarketScope::Under));
    }

    #[test]
    fn scopes_share_regularisation_within_a_league() {
        let table = LeagueParamsTable::builtin();
        let general = table.get(39, MarketScope::General);
        let over = table.get(39, MarketScope::Over);
        assert_eq!(general.lambda_reg, over.lambda_reg);
        assert_eq!(general.home_adv, over.home_adv);
        assert!(over.rho_prior > table.get(39, MarketScope::Under).rho_prior);
    }

    #[test]
    fn overrides_win_over_builtin() {
        let mut table = LeagueParamsTable::builtin();
        let custom = FitParams::new(0.001, 0.2, 0.1, -0.2, 10);
        table.set_override(39, MarketScope::Btts, custom);
        assert_eq!(table.get(39, MarketScope::Btts), custom);
        assert_ne!(table.get(39, MarketScope::General), custom);
    }
}
