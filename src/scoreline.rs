use serde::{Deserialize, Serialize};

use crate::dixon_coles::{RHO_MAX, RHO_MIN, dc_tau};
use crate::error::Unavailable;
use crate::market::Market;

pub const MAX_GOALS: usize = 15;

/// Market probabilities in percent. Each two-way pair sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketProbs {
    pub over25: f64,
    pub under25: f64,
    pub btts_yes: f64,
    pub btts_no: f64,
}

impl MarketProbs {
    pub fn get(&self, market: Market) -> f64 {
        match market {
            Market::Over25 => self.over25,
            Market::Under25 => self.under25,
            Market::BttsYes => self.btts_yes,
            Market::BttsNo => self.btts_no,
        }
    }

    pub fn set(&mut self, market: Market, value: f64) {
        match market {
            Market::Over25 => self.over25 = value,
            Market::Under25 => self.under25 = value,
            Market::BttsYes => self.btts_yes = value,
            Market::BttsNo => self.btts_no = value,
        }
    }

    /// Convex combination `w·self + (1-w)·other`, market by market.
    pub fn blend(&self, other: &MarketProbs, w: f64) -> MarketProbs {
        let mut out = MarketProbs::default();
        for m in Market::ALL {
            out.set(m, w * self.get(m) + (1.0 - w) * other.get(m));
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        Market::ALL.iter().all(|m| self.get(*m).is_finite())
    }
}

/// Joint scoreline distribution, `cells[h][a]`, normalised to 1.
#[derive(Debug, Clone)]
pub struct ScoreMatrix {
    cells: Vec<[f64; MAX_GOALS + 1]>,
}

impl ScoreMatrix {
    pub fn build(lambda_home: f64, lambda_away: f64, rho: f64) -> Result<Self, Unavailable> {
        if !(lambda_home.is_finite() && lambda_away.is_finite())
            || lambda_home <= 0.0
            || lambda_away <= 0.0
        {
            return Err(Unavailable::SanityCheck(format!(
                "invalid lambdas {lambda_home:.3}/{lambda_away:.3}"
            )));
        }
        if !rho.is_finite() || !(RHO_MIN..=RHO_MAX).contains(&rho) {
            return Err(Unavailable::SanityCheck(format!("rho {rho:.3} out of range")));
        }

        let home = poisson_row(lambda_home);
        let away = poisson_row(lambda_away);
        let mut cells = vec![[0.0; MAX_GOALS + 1]; MAX_GOALS + 1];
        let mut mass = 0.0;
        for (h, row) in cells.iter_mut().enumerate() {
            for (a, cell) in row.iter_mut().enumerate() {
                let tau = dc_tau(h as u32, a as u32, lambda_home, lambda_away, rho);
                *cell = (home[h] * away[a] * tau).max(0.0);
                mass += *cell;
            }
        }
        if !mass.is_finite() || mass <= 0.0 {
            return Err(Unavailable::SanityCheck(format!(
                "score matrix mass {mass} for lambdas {lambda_home:.3}/{lambda_away:.3}"
            )));
        }
        for row in cells.iter_mut() {
            row.iter_mut().for_each(|c| *c /= mass);
        }
        Ok(Self { cells })
    }

    pub fn prob(&self, home_goals: usize, away_goals: usize) -> f64 {
        self.cells
            .get(home_goals)
            .and_then(|row| row.get(away_goals))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.cells.iter().flat_map(|r| r.iter()).sum()
    }

    pub fn most_likely(&self) -> (usize, usize) {
        let mut best = (0, 0);
        let mut best_p = -1.0;
        for (h, row) in self.cells.iter().enumerate() {
            for (a, p) in row.iter().enumerate() {
                if *p > best_p {
                    best_p = *p;
                    best = (h, a);
                }
            }
        }
        best
    }

    pub fn market_probs(&self) -> MarketProbs {
        let mut over = 0.0;
        let mut btts = 0.0;
        for (h, row) in self.cells.iter().enumerate() {
            for (a, p) in row.iter().enumerate() {
                if h + a > 2 {
                    over += p;
                }
                if h >= 1 && a >= 1 {
                    btts += p;
                }
            }
        }
        MarketProbs {
            over25: over * 100.0,
            under25: (1.0 - over) * 100.0,
            btts_yes: btts * 100.0,
            btts_no: (1.0 - btts) * 100.0,
        }
    }
}

/// Over/under 2.5 and BTTS probabilities for the given expected goals.
pub fn score_markets(lambda_home: f64, lambda_away: f64, rho: f64) -> Result<MarketProbs, Unavailable> {
    Ok(ScoreMatrix::build(lambda_home, lambda_away, rho)?.market_probs())
}

fn poisson_row(lambda: f64) -> [f64; MAX_GOALS + 1] {
    let mut row = [0.0; MAX_GOALS + 1];
    row[0] = (-lambda).exp();
    for k in 1..=MAX_GOALS {
        row[k] = row[k - 1] * lambda / k as f64;
    }
    row
}
