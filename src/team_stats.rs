//! Running per-team aggregates and head-to-head history.
//!
//! Every aggregate here is built by replaying matches in kickoff order, so the
//! book always describes "everything before the next match it has not seen".

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::HistoricalMatch;

pub const RECENT_CAPACITY: usize = 10;
pub const FORM_WINDOW: usize = 5;
pub const EMA_ALPHA: f64 = 0.3;

/// Fixed-capacity FIFO; pushing onto a full buffer evicts the oldest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The newest `n` items, oldest first.
    pub fn last(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }

    /// Changes the capacity, dropping the oldest entries that no longer fit.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    Win,
    Draw,
    Loss,
}

impl MatchResult {
    pub fn from_goals(scored: u8, conceded: u8) -> Self {
        match scored.cmp(&conceded) {
            std::cmp::Ordering::Greater => MatchResult::Win,
            std::cmp::Ordering::Equal => MatchResult::Draw,
            std::cmp::Ordering::Less => MatchResult::Loss,
        }
    }

    pub fn points(self) -> u32 {
        match self {
            MatchResult::Win => 3,
            MatchResult::Draw => 1,
            MatchResult::Loss => 0,
        }
    }

    pub fn score(self) -> f64 {
        match self {
            MatchResult::Win => 1.0,
            MatchResult::Draw => 0.5,
            MatchResult::Loss => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRunningStats {
    pub team_id: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub goals_for_home: u32,
    pub goals_against_home: u32,
    pub goals_for_away: u32,
    pub goals_against_away: u32,
    pub matches: u32,
    pub home_matches: u32,
    pub away_matches: u32,
    pub recent_results: RingBuffer<MatchResult>,
    pub recent_goals_for: RingBuffer<u8>,
    pub recent_goals_against: RingBuffer<u8>,
}

impl TeamRunningStats {
    pub fn new(team_id: u32) -> Self {
        Self {
            team_id,
            goals_for: 0,
            goals_against: 0,
            goals_for_home: 0,
            goals_against_home: 0,
            goals_for_away: 0,
            goals_against_away: 0,
            matches: 0,
            home_matches: 0,
            away_matches: 0,
            recent_results: RingBuffer::new(RECENT_CAPACITY),
            recent_goals_for: RingBuffer::new(RECENT_CAPACITY),
            recent_goals_against: RingBuffer::new(RECENT_CAPACITY),
        }
    }

    pub fn record(&mut self, scored: u8, conceded: u8, at_home: bool) {
        self.goals_for += scored as u32;
        self.goals_against += conceded as u32;
        self.matches += 1;
        if at_home {
            self.goals_for_home += scored as u32;
            self.goals_against_home += conceded as u32;
            self.home_matches += 1;
        } else {
            self.goals_for_away += scored as u32;
            self.goals_against_away += conceded as u32;
            self.away_matches += 1;
        }
        self.recent_results.push(MatchResult::from_goals(scored, conceded));
        self.recent_goals_for.push(scored);
        self.recent_goals_against.push(conceded);
    }

    pub fn gf_avg(&self) -> f64 {
        ratio(self.goals_for, self.matches)
    }

    pub fn ga_avg(&self) -> f64 {
        ratio(self.goals_against, self.matches)
    }

    pub fn gf_home_avg(&self) -> f64 {
        ratio(self.goals_for_home, self.home_matches)
    }

    pub fn ga_home_avg(&self) -> f64 {
        ratio(self.goals_against_home, self.home_matches)
    }

    pub fn gf_away_avg(&self) -> f64 {
        ratio(self.goals_for_away, self.away_matches)
    }

    pub fn ga_away_avg(&self) -> f64 {
        ratio(self.goals_against_away, self.away_matches)
    }

    /// Points over the last five results, normalised to 0..1.
    pub fn form_score(&self) -> f64 {
        let last: Vec<MatchResult> = self.recent_results.last(FORM_WINDOW).copied().collect();
        if last.is_empty() {
            return 0.5;
        }
        let points: u32 = last.iter().map(|r| r.points()).sum();
        points as f64 / (last.len() as f64 * 3.0)
    }

    /// Exponentially weighted form over the buffered results; newest weighs most.
    pub fn ema_form(&self, alpha: f64) -> f64 {
        let n = self.recent_results.len();
        if n == 0 {
            return 0.5;
        }
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (i, r) in self.recent_results.iter().enumerate() {
            // Oldest gets alpha·(1-alpha)^(n-1), newest gets alpha.
            let w = alpha * (1.0 - alpha).powi((n - 1 - i) as i32);
            weighted += w * r.score();
            total += w;
        }
        if total > 0.0 { weighted / total } else { 0.5 }
    }

    /// Points share and goal difference over the last five, weighted 0.7/0.3.
    /// Goal difference is clamped to ±5 before scaling into 0..1.
    pub fn form_indicator(&self) -> f64 {
        let results: Vec<MatchResult> = self.recent_results.last(FORM_WINDOW).copied().collect();
        if results.is_empty() {
            return 0.5;
        }
        let points: u32 = results.iter().map(|r| r.points()).sum();
        let scored: i32 = self.recent_goals_for.last(FORM_WINDOW).map(|g| *g as i32).sum();
        let conceded: i32 = self.recent_goals_against.last(FORM_WINDOW).map(|g| *g as i32).sum();
        let goal_diff = (scored - conceded).clamp(-5, 5) as f64;
        let points_share = points as f64 / (results.len() as f64 * 3.0);
        points_share * 0.7 + (goal_diff / 10.0 + 0.5) * 0.3
    }

    pub fn recent_gf_mean(&self) -> f64 {
        mean_u8(self.recent_goals_for.last(FORM_WINDOW))
    }

    pub fn recent_ga_mean(&self) -> f64 {
        mean_u8(self.recent_goals_against.last(FORM_WINDOW))
    }
}

fn ratio(total: u32, n: u32) -> f64 {
    total as f64 / n.max(1) as f64
}

fn mean_u8<'a>(items: impl Iterator<Item = &'a u8>) -> f64 {
    let (sum, n) = items.fold((0u32, 0u32), |(s, n), v| (s + *v as u32, n + 1));
    if n == 0 { 0.0 } else { sum as f64 / n as f64 }
}

/// One past meeting, stored with the goals of the lower team id first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Meeting {
    kickoff: DateTime<Utc>,
    low_goals: u8,
    high_goals: u8,
}

/// Head-to-head view oriented to the fixture's home team.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct H2hSummary {
    pub meetings: usize,
    pub avg_total_goals: f64,
    pub btts_rate: f64,
    pub home_goals_avg: f64,
    pub away_goals_avg: f64,
    /// `min(meetings / 5, 1)`.
    pub quality: f64,
}

impl H2hSummary {
    pub const DEFAULT_TOTAL_GOALS: f64 = 2.5;
    pub const DEFAULT_BTTS_RATE: f64 = 0.5;
}

/// All teams' running stats plus the pairwise meeting log.
#[derive(Debug, Clone, Default)]
pub struct TeamStatsBook {
    teams: HashMap<u32, TeamRunningStats>,
    meetings: HashMap<(u32, u32), Vec<Meeting>>,
    last_kickoff: Option<DateTime<Utc>>,
}

impl TeamStatsBook {
    /// Replays `matches` (any order) into a fresh book.
    pub fn from_matches(matches: &[HistoricalMatch]) -> Self {
        let mut sorted: Vec<&HistoricalMatch> = matches.iter().collect();
        sorted.sort_by(|a, b| a.kickoff.cmp(&b.kickoff).then(a.match_id.cmp(&b.match_id)));
        let mut book = Self::default();
        for m in sorted {
            book.absorb(m);
        }
        book
    }

    pub fn team(&self, team_id: u32) -> Option<&TeamRunningStats> {
        self.teams.get(&team_id)
    }

    pub fn matches_played(&self, team_id: u32) -> u32 {
        self.teams.get(&team_id).map(|t| t.matches).unwrap_or(0)
    }

    pub fn last_kickoff(&self) -> Option<DateTime<Utc>> {
        self.last_kickoff
    }

    /// Folds a finished match into both teams and the meeting log.
    pub fn absorb(&mut self, m: &HistoricalMatch) {
        self.teams
            .entry(m.home_id)
            .or_insert_with(|| TeamRunningStats::new(m.home_id))
            .record(m.home_goals, m.away_goals, true);
        self.teams
            .entry(m.away_id)
            .or_insert_with(|| TeamRunningStats::new(m.away_id))
            .record(m.away_goals, m.home_goals, false);

        let (key, low_goals, high_goals) = if m.home_id < m.away_id {
            ((m.home_id, m.away_id), m.home_goals, m.away_goals)
        } else {
            ((m.away_id, m.home_id), m.away_goals, m.home_goals)
        };
        self.meetings.entry(key).or_default().push(Meeting {
            kickoff: m.kickoff,
            low_goals,
            high_goals,
        });
        self.last_kickoff = Some(self.last_kickoff.map_or(m.kickoff, |k| k.max(m.kickoff)));
    }

    /// The last `max_meetings` meetings between the two teams, oriented so
    /// `home_goals_avg` belongs to `home_id`. `None` below `min_meetings`.
    pub fn h2h(
        &self,
        home_id: u32,
        away_id: u32,
        max_meetings: usize,
        min_meetings: usize,
    ) -> Option<H2hSummary> {
        let key = (home_id.min(away_id), home_id.max(away_id));
        let log = self.meetings.get(&key)?;
        let recent = &log[log.len().saturating_sub(max_meetings)..];
        if recent.is_empty() || recent.len() < min_meetings {
            return None;
        }
        let home_is_low = home_id < away_id;
        let n = recent.len() as f64;
        let mut home_goals = 0.0;
        let mut away_goals = 0.0;
        let mut btts = 0.0;
        for mt in recent {
            let (h, a) = if home_is_low {
                (mt.low_goals, mt.high_goals)
            } else {
                (mt.high_goals, mt.low_goals)
            };
            home_goals += h as f64;
            away_goals += a as f64;
            if h > 0 && a > 0 {
                btts += 1.0;
            }
        }
        Some(H2hSummary {
            meetings: recent.len(),
            avg_total_goals: (home_goals + away_goals) / n,
            btts_rate: btts / n,
            home_goals_avg: home_goals / n,
            away_goals_avg: away_goals / n,
            quality: (n / 5.0).min(1.0),
        })
    }

    /// `(avg total goals, btts rate)` over recent meetings, or the neutral
    /// defaults when fewer than `min_meetings` exist.
    pub fn h2h_totals(&self, home_id: u32, away_id: u32, max_meetings: usize, min_meetings: usize) -> (f64, f64) {
        self.h2h(home_id, away_id, max_meetings, min_meetings.max(1))
            .map(|s| (s.avg_total_goals, s.btts_rate))
            .unwrap_or((H2hSummary::DEFAULT_TOTAL_GOALS, H2hSummary::DEFAULT_BTTS_RATE))
    }
}
