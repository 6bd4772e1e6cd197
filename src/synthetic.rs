//! Seeded synthetic leagues for the demo mode, tests and benches.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::feed::{Fixture, MarketPrices, MemoryFeed, Quote};
use crate::history::HistoricalMatch;
use crate::market::Market;
use crate::scoreline::score_markets;

const BOOK_MARGIN: f64 = 0.05;
const SUMMER_BREAK_WEEKS: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct SyntheticTeam {
    pub id: u32,
    pub attack: f64,
    pub defense: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticLeague {
    pub league_id: u32,
    pub seed: u64,
    pub teams: Vec<SyntheticTeam>,
    pub home_adv: f64,
    pub base_goals: f64,
    pub season_start: DateTime<Utc>,
}

impl SyntheticLeague {
    /// `n_teams` teams with evenly spread strengths, jittered by the seed.
    pub fn new(seed: u64, league_id: u32, n_teams: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = n_teams.max(2);
        let teams = (0..n)
            .map(|i| {
                let spread = if n > 1 { i as f64 / (n - 1) as f64 - 0.5 } else { 0.0 };
                SyntheticTeam {
                    id: league_id * 1000 + i as u32 + 1,
                    attack: 0.7 * spread + rng.gen_range(-0.05..0.05),
                    defense: -0.5 * spread + rng.gen_range(-0.05..0.05),
                }
            })
            .collect();
        Self {
            league_id,
            seed,
            teams,
            home_adv: 0.25,
            base_goals: 1.25_f64.ln(),
            season_start: Utc
                .with_ymd_and_hms(2022, 8, 6, 15, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    pub fn team(&self, id: u32) -> Option<&SyntheticTeam> {
        self.teams.iter().find(|t| t.id == id)
    }

    pub fn strongest_attack(&self) -> u32 {
        self.teams
            .iter()
            .max_by(|a, b| a.attack.total_cmp(&b.attack))
            .map(|t| t.id)
            .unwrap_or_default()
    }

    pub fn weakest_attack(&self) -> u32 {
        self.teams
            .iter()
            .min_by(|a, b| a.attack.total_cmp(&b.attack))
            .map(|t| t.id)
            .unwrap_or_default()
    }

    /// True expected goals for a pairing.
    pub fn true_lambdas(&self, home_id: u32, away_id: u32) -> Option<(f64, f64)> {
        let home = self.team(home_id)?;
        let away = self.team(away_id)?;
        Some((
            (self.base_goals + home.attack + away.defense + self.home_adv).exp(),
            (self.base_goals + away.attack + home.defense).exp(),
        ))
    }

    /// Double round-robin seasons, one round per week.
    pub fn simulate_seasons(&self, seasons: usize) -> Vec<HistoricalMatch> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(0x5eed));
        let rounds = round_robin(&self.teams.iter().map(|t| t.id).collect::<Vec<_>>());
        let mut out = Vec::new();
        let mut match_id = self.league_id as u64 * 1_000_000;

        for season in 0..seasons {
            let label = format!("{}/{}", 2022 + season, 2023 + season);
            for (home_id, away_id) in rounds.iter().flatten() {
                let Some((lh, la)) = self.true_lambdas(*home_id, *away_id) else {
                    continue;
                };
                match_id += 1;
                out.push(HistoricalMatch {
                    match_id,
                    league_id: self.league_id,
                    season: label.clone(),
                    kickoff: self.season_start,
                    home_id: *home_id,
                    away_id: *away_id,
                    home_goals: sample_poisson(&mut rng, lh),
                    away_goals: sample_poisson(&mut rng, la),
                });
            }
        }
        assign_weekly_kickoffs(&mut out, &rounds, self.season_start);
        out
    }

    /// Kickoff of the first round after `seasons` simulated seasons.
    pub fn next_kickoff(&self, seasons: usize) -> DateTime<Utc> {
        let rounds = 2 * (self.teams.len() + self.teams.len() % 2).saturating_sub(1);
        self.season_start + Duration::weeks((seasons * (rounds + SUMMER_BREAK_WEEKS)) as i64)
    }

    /// The next round's fixtures, kicking off at `kickoff`.
    pub fn upcoming_fixtures(&self, kickoff: DateTime<Utc>, first_fixture_id: u64) -> Vec<Fixture> {
        let rounds = round_robin(&self.teams.iter().map(|t| t.id).collect::<Vec<_>>());
        let Some(round) = rounds.first() else {
            return Vec::new();
        };
        round
            .iter()
            .enumerate()
            .map(|(i, (home_id, away_id))| Fixture {
                fixture_id: first_fixture_id + i as u64,
                league_id: self.league_id,
                home_id: *home_id,
                away_id: *away_id,
                kickoff,
            })
            .collect()
    }

    /// Bookmaker prices around the true probabilities with margin and noise.
    pub fn price_book(&self, fixtures: &[Fixture], seed: u64) -> MemoryFeed {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut feed = MemoryFeed::default();
        for fx in fixtures {
            let Some((lh, la)) = self.true_lambdas(fx.home_id, fx.away_id) else {
                continue;
            };
            let Ok(probs) = score_markets(lh, la, 0.0) else {
                continue;
            };
            let mut prices = MarketPrices::default();
            for market in Market::ALL {
                let p = (probs.get(market) / 100.0 * rng.gen_range(0.85..1.15)).clamp(0.05, 0.95);
                let odd = (1.0 / (p * (1.0 + BOOK_MARGIN))).max(1.01);
                prices.insert(
                    market,
                    Quote {
                        odd: (odd * 100.0).round() / 100.0,
                        provider: "synthetic".to_string(),
                    },
                );
            }
            feed.set_prices(fx.fixture_id, prices);
        }
        feed
    }
}

fn assign_weekly_kickoffs(matches: &mut [HistoricalMatch], rounds: &[Vec<(u32, u32)>], start: DateTime<Utc>) {
    let per_round = rounds.first().map(|r| r.len()).unwrap_or(1).max(1);
    let rounds_per_season = rounds.len().max(1);
    for (i, m) in matches.iter_mut().enumerate() {
        let round = i / per_round;
        let season = round / rounds_per_season;
        let week = round + season * SUMMER_BREAK_WEEKS;
        let slot = (i % per_round) as i64 % 4;
        m.kickoff = start + Duration::weeks(week as i64) + Duration::minutes(slot * 75);
    }
}

/// Circle-method schedule: every pairing once at home and once away.
fn round_robin(team_ids: &[u32]) -> Vec<Vec<(u32, u32)>> {
    let mut ids: Vec<Option<u32>> = team_ids.iter().copied().map(Some).collect();
    if ids.len() % 2 == 1 {
        ids.push(None);
    }
    let n = ids.len();
    if n < 2 {
        return Vec::new();
    }
    let mut first_half = Vec::with_capacity(n - 1);
    for round in 0..n - 1 {
        let mut pairs = Vec::with_capacity(n / 2);
        for i in 0..n / 2 {
            if let (Some(a), Some(b)) = (ids[i], ids[n - 1 - i]) {
                if (round + i) % 2 == 0 {
                    pairs.push((a, b));
                } else {
                    pairs.push((b, a));
                }
            }
        }
        first_half.push(pairs);
        ids[1..].rotate_right(1);
    }
    let second_half: Vec<Vec<(u32, u32)>> = first_half
        .iter()
        .map(|r| r.iter().map(|(h, a)| (*a, *h)).collect())
        .collect();
    first_half.into_iter().chain(second_half).collect()
}

pub fn sample_poisson(rng: &mut impl Rng, lambda: f64) -> u8 {
    let limit = (-lambda.max(0.0)).exp();
    let mut k = 0u8;
    let mut p = 1.0;
    loop {
        p *= rng.gen_range(0.0..1.0);
        if p <= limit || k >= 12 {
            return k;
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_a_double_round_robin() {
        let rounds = round_robin(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(rounds.len(), 10);
        let mut pairs: Vec<(u32, u32)> = rounds.into_iter().flatten().collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), 30);
    }

    #[test]
    fn seasons_are_chronological_and_deterministic() {
        let league = SyntheticLeague::new(42, 39, 8);
        let a = league.simulate_seasons(2);
        let b = league.simulate_seasons(2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2 * 8 * 7);
        assert!(a.windows(2).all(|w| w[0].kickoff <= w[1].kickoff));
    }

    #[test]
    fn poisson_mean_is_close() {
        let mut rng = StdRng::seed_from_u64(1);
        let n = 20_000;
        let total: u32 = (0..n).map(|_| sample_poisson(&mut rng, 1.4) as u32).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 1.4).abs() < 0.05, "{mean}");
    }
}
