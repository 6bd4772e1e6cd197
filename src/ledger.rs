//! Persistent record of every value decision and how it settled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::calibration::SettledPick;
use crate::decision::DecisionCandidate;
use crate::ensemble::ModelUsed;
use crate::market::Market;
use crate::persist::app_cache_dir;

/// Pending rows stop taking live updates this close to kickoff.
pub const FREEZE_MINUTES: i64 = 15;
const EDGE_UPDATE_EPSILON: f64 = 0.1;
const LOST_VALUE_DECAY: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Pending,
    Won,
    Lost,
}

impl RecordStatus {
    pub fn key(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Won => "won",
            RecordStatus::Lost => "lost",
        }
    }

    pub fn from_key(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RecordStatus::Pending),
            "won" => Some(RecordStatus::Won),
            "lost" => Some(RecordStatus::Lost),
            _ => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        self != RecordStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClvLabel {
    Excellent,
    Good,
    Neutral,
    Fair,
    Poor,
}

impl ClvLabel {
    pub fn from_clv(clv_pct: f64) -> Self {
        if clv_pct >= 5.0 {
            ClvLabel::Excellent
        } else if clv_pct >= 2.0 {
            ClvLabel::Good
        } else if clv_pct >= -2.0 {
            ClvLabel::Neutral
        } else if clv_pct >= -5.0 {
            ClvLabel::Fair
        } else {
            ClvLabel::Poor
        }
    }
}

/// Closing-line value: how much better the first price was than the close.
pub fn clv_pct(first_odd: f64, closing_odd: f64) -> Option<f64> {
    if first_odd <= 0.0 || closing_odd <= 0.0 || !first_odd.is_finite() || !closing_odd.is_finite() {
        return None;
    }
    Some(((first_odd / closing_odd - 1.0) * 100.0 * 100.0).round() / 100.0)
}

/// Stable identity of a (fixture, market, selection) triple.
pub fn record_id(fixture_id: u64, market: Market) -> String {
    let identity = format!("{fixture_id}{}{}", market.group(), market.label().replace(' ', ""));
    let digest = Sha256::digest(identity.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub record_id: String,
    pub fixture_id: u64,
    pub league_id: u32,
    pub home_id: u32,
    pub away_id: u32,
    pub kickoff: DateTime<Utc>,
    pub market: Market,
    pub provider: String,
    pub model_prob_raw: f64,
    pub model_prob_calibrated: f64,
    pub market_prob: f64,
    pub fair_odd: f64,
    pub edge_initial: f64,
    pub edge_current: f64,
    pub confidence: f64,
    pub stake_fraction: f64,
    pub model_used: ModelUsed,
    /// Odd at first sighting; the price the pick was taken at.
    pub first_odd: f64,
    pub last_odd: f64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub closing_odd: Option<f64>,
    pub clv_pct: Option<f64>,
    pub final_score: Option<(u8, u8)>,
    pub status: RecordStatus,
    pub rating_prob: f64,
    pub predictor_prob: Option<f64>,
}

/// Fresh numbers for a pending record from a later scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveUpdate {
    pub odd: f64,
    pub edge: f64,
    pub confidence: f64,
}

impl LiveUpdate {
    pub fn from_candidate(c: &DecisionCandidate) -> Self {
        Self {
            odd: c.quote.odd,
            edge: c.edge,
            confidence: c.confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
    /// Resolved, or inside the kickoff freeze.
    Frozen,
}

impl DecisionRecord {
    pub fn from_candidate(c: &DecisionCandidate, now: DateTime<Utc>) -> Self {
        Self {
            record_id: record_id(c.fixture.fixture_id, c.market),
            fixture_id: c.fixture.fixture_id,
            league_id: c.fixture.league_id,
            home_id: c.fixture.home_id,
            away_id: c.fixture.away_id,
            kickoff: c.fixture.kickoff,
            market: c.market,
            provider: c.quote.provider.clone(),
            model_prob_raw: c.model_prob_raw,
            model_prob_calibrated: c.model_prob_calibrated,
            market_prob: c.market_prob,
            fair_odd: c.fair_odd,
            edge_initial: c.edge,
            edge_current: c.edge,
            confidence: c.confidence,
            stake_fraction: c.stake_fraction,
            model_used: c.model_used,
            first_odd: c.quote.odd,
            last_odd: c.quote.odd,
            created_at: now,
            last_seen_at: now,
            closing_odd: None,
            clv_pct: None,
            final_score: None,
            status: RecordStatus::Pending,
            rating_prob: c.rating_prob,
            predictor_prob: c.predictor_prob,
        }
    }

    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        self.status.is_resolved() || self.kickoff <= now + Duration::minutes(FREEZE_MINUTES)
    }

    /// Refreshes live fields; returns false if the record no longer moves.
    pub fn apply_live(&mut self, update: &LiveUpdate, now: DateTime<Utc>) -> bool {
        if self.is_frozen(now) {
            return false;
        }
        self.last_odd = (update.odd * 100.0).round() / 100.0;
        self.last_seen_at = now;
        if update.confidence > 0.0 {
            self.confidence = (update.confidence * 10.0).round() / 10.0;
        }
        if (self.edge_current - update.edge).abs() > EDGE_UPDATE_EPSILON {
            self.edge_current = (update.edge * 100.0).round() / 100.0;
        }
        if update.edge < self.market.min_edge() {
            self.confidence = (self.confidence * LOST_VALUE_DECAY * 10.0).round() / 10.0;
        }
        true
    }

    /// Settles the pick; `closing_odd` falls back to the last seen odd.
    pub fn settle(&mut self, home_goals: u8, away_goals: u8, closing_odd: Option<f64>) -> bool {
        if self.status.is_resolved() {
            return false;
        }
        let won = self.market.settle(home_goals, away_goals);
        self.status = if won { RecordStatus::Won } else { RecordStatus::Lost };
        self.final_score = Some((home_goals, away_goals));
        let closing = closing_odd.filter(|o| *o > 1.0).or(Some(self.last_odd).filter(|o| *o > 1.0));
        self.closing_odd = closing;
        self.clv_pct = closing.and_then(|c| clv_pct(self.first_odd, c));
        true
    }

    pub fn clv_label(&self) -> Option<ClvLabel> {
        self.clv_pct.map(ClvLabel::from_clv)
    }

    pub fn settled_pick(&self) -> Option<SettledPick> {
        self.status.is_resolved().then(|| SettledPick {
            market: self.market,
            calibrated_prob: self.model_prob_calibrated,
            won: self.status == RecordStatus::Won,
        })
    }
}

pub trait Ledger {
    fn load(&self) -> Result<Vec<DecisionRecord>>;

    /// Inserts a new record or refreshes the live fields of a pending one.
    fn upsert(&mut self, candidate: &DecisionCandidate, now: DateTime<Utc>) -> Result<UpsertOutcome>;

    /// Live refresh of an existing record without a passing candidate.
    fn refresh(&mut self, record_id: &str, update: &LiveUpdate, now: DateTime<Utc>) -> Result<bool>;

    /// Settles a pending record. Returns the settled record, or `None` if it
    /// was unknown or already resolved.
    fn resolve(
        &mut self,
        record_id: &str,
        score: (u8, u8),
        closing_odd: Option<f64>,
    ) -> Result<Option<DecisionRecord>>;
}

fn upsert_into(existing: Option<&mut DecisionRecord>, candidate: &DecisionCandidate, now: DateTime<Utc>) -> (UpsertOutcome, Option<DecisionRecord>) {
    match existing {
        Some(record) => {
            if record.apply_live(&LiveUpdate::from_candidate(candidate), now) {
                (UpsertOutcome::Refreshed, None)
            } else {
                (UpsertOutcome::Frozen, None)
            }
        }
        None => (UpsertOutcome::Inserted, Some(DecisionRecord::from_candidate(candidate, now))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: BTreeMap<String, DecisionRecord>,
}

impl MemoryLedger {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, record_id: &str) -> Option<&DecisionRecord> {
        self.records.get(record_id)
    }
}

impl Ledger for MemoryLedger {
    fn load(&self) -> Result<Vec<DecisionRecord>> {
        Ok(self.records.values().cloned().collect())
    }

    fn upsert(&mut self, candidate: &DecisionCandidate, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let id = record_id(candidate.fixture.fixture_id, candidate.market);
        let (outcome, fresh) = upsert_into(self.records.get_mut(&id), candidate, now);
        if let Some(record) = fresh {
            self.records.insert(id, record);
        }
        Ok(outcome)
    }

    fn refresh(&mut self, record_id: &str, update: &LiveUpdate, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .records
            .get_mut(record_id)
            .is_some_and(|r| r.apply_live(update, now)))
    }

    fn resolve(
        &mut self,
        record_id: &str,
        (home_goals, away_goals): (u8, u8),
        closing_odd: Option<f64>,
    ) -> Result<Option<DecisionRecord>> {
        let Some(record) = self.records.get_mut(record_id) else {
            return Ok(None);
        };
        Ok(record
            .settle(home_goals, away_goals, closing_odd)
            .then(|| record.clone()))
    }
}

/// SQLite-backed ledger, one row per record.
pub struct SqliteLedger {
    conn: Connection,
}

pub fn default_ledger_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join("ledger.sqlite"))
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).with_context(|| format!("open ledger {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn find(&self, record_id: &str) -> Result<Option<DecisionRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM decisions WHERE record_id = ?1"))
            .context("prepare ledger lookup")?;
        let row = stmt
            .query_row(params![record_id], decode_row)
            .optional()
            .context("query ledger record")?;
        row.map(RawRecord::into_record).transpose()
    }
}

impl Ledger for SqliteLedger {
    fn load(&self) -> Result<Vec<DecisionRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM decisions ORDER BY kickoff ASC, record_id ASC"))
            .context("prepare ledger load")?;
        let rows = stmt.query_map([], decode_row).context("query ledger")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode ledger row")?.into_record()?);
        }
        Ok(out)
    }

    fn upsert(&mut self, candidate: &DecisionCandidate, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let id = record_id(candidate.fixture.fixture_id, candidate.market);
        let mut existing = self.find(&id)?;
        let (outcome, fresh) = upsert_into(existing.as_mut(), candidate, now);
        match (outcome, fresh, existing) {
            (UpsertOutcome::Inserted, Some(record), _) => save_record(&self.conn, &record)?,
            (UpsertOutcome::Refreshed, _, Some(record)) => save_record(&self.conn, &record)?,
            _ => {}
        }
        Ok(outcome)
    }

    fn refresh(&mut self, record_id: &str, update: &LiveUpdate, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut record) = self.find(record_id)? else {
            return Ok(false);
        };
        if !record.apply_live(update, now) {
            return Ok(false);
        }
        save_record(&self.conn, &record)?;
        Ok(true)
    }

    fn resolve(
        &mut self,
        record_id: &str,
        (home_goals, away_goals): (u8, u8),
        closing_odd: Option<f64>,
    ) -> Result<Option<DecisionRecord>> {
        let Some(mut record) = self.find(record_id)? else {
            return Ok(None);
        };
        if !record.settle(home_goals, away_goals, closing_odd) {
            return Ok(None);
        }
        save_record(&self.conn, &record)?;
        Ok(Some(record))
    }
}

const COLUMNS: &str = "record_id, fixture_id, league_id, home_id, away_id, kickoff, market, provider, \
    model_prob_raw, model_prob_calibrated, market_prob, fair_odd, edge_initial, edge_current, \
    confidence, stake_fraction, model_used, first_odd, last_odd, created_at, last_seen_at, \
    closing_odd, clv_pct, final_score, status, rating_prob, predictor_prob";

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS decisions (
            record_id TEXT PRIMARY KEY,
            fixture_id INTEGER NOT NULL,
            league_id INTEGER NOT NULL,
            home_id INTEGER NOT NULL,
            away_id INTEGER NOT NULL,
            kickoff TEXT NOT NULL,
            market TEXT NOT NULL,
            provider TEXT NOT NULL,
            model_prob_raw REAL NOT NULL,
            model_prob_calibrated REAL NOT NULL,
            market_prob REAL NOT NULL,
            fair_odd REAL NOT NULL,
            edge_initial REAL NOT NULL,
            edge_current REAL NOT NULL,
            confidence REAL NOT NULL,
            stake_fraction REAL NOT NULL,
            model_used TEXT NOT NULL,
            first_odd REAL NOT NULL,
            last_odd REAL NOT NULL,
            created_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            closing_odd REAL,
            clv_pct REAL,
            final_score TEXT,
            status TEXT NOT NULL,
            rating_prob REAL NOT NULL,
            predictor_prob REAL
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status);
        CREATE INDEX IF NOT EXISTS idx_decisions_fixture ON decisions(fixture_id);
        "#,
    )
    .context("create ledger schema")?;
    Ok(())
}

fn save_record(conn: &Connection, r: &DecisionRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO decisions ({COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, \
              ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
        ),
        params![
            r.record_id,
            r.fixture_id as i64,
            r.league_id as i64,
            r.home_id as i64,
            r.away_id as i64,
            r.kickoff.to_rfc3339(),
            r.market.key(),
            r.provider,
            r.model_prob_raw,
            r.model_prob_calibrated,
            r.market_prob,
            r.fair_odd,
            r.edge_initial,
            r.edge_current,
            r.confidence,
            r.stake_fraction,
            r.model_used.label(),
            r.first_odd,
            r.last_odd,
            r.created_at.to_rfc3339(),
            r.last_seen_at.to_rfc3339(),
            r.closing_odd,
            r.clv_pct,
            r.final_score.map(|(h, a)| format!("{h}-{a}")),
            r.status.key(),
            r.rating_prob,
            r.predictor_prob,
        ],
    )
    .with_context(|| format!("save ledger record {}", r.record_id))?;
    Ok(())
}

/// Row as stored, before text columns are parsed.
struct RawRecord {
    record_id: String,
    fixture_id: i64,
    league_id: u32,
    home_id: u32,
    away_id: u32,
    kickoff: String,
    market: String,
    provider: String,
    numbers: [f64; 8],
    model_used: String,
    first_odd: f64,
    last_odd: f64,
    created_at: String,
    last_seen_at: String,
    closing_odd: Option<f64>,
    clv_pct: Option<f64>,
    final_score: Option<String>,
    status: String,
    rating_prob: f64,
    predictor_prob: Option<f64>,
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        record_id: row.get(0)?,
        fixture_id: row.get(1)?,
        league_id: row.get(2)?,
        home_id: row.get(3)?,
        away_id: row.get(4)?,
        kickoff: row.get(5)?,
        market: row.get(6)?,
        provider: row.get(7)?,
        numbers: [
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
            row.get(15)?,
        ],
        model_used: row.get(16)?,
        first_odd: row.get(17)?,
        last_odd: row.get(18)?,
        created_at: row.get(19)?,
        last_seen_at: row.get(20)?,
        closing_odd: row.get(21)?,
        clv_pct: row.get(22)?,
        final_score: row.get(23)?,
        status: row.get(24)?,
        rating_prob: row.get(25)?,
        predictor_prob: row.get(26)?,
    })
}

fn parse_time(raw: &str, what: &str, id: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad {what} for record {id}: {raw}"))?
        .with_timezone(&Utc))
}

impl RawRecord {
    fn into_record(self) -> Result<DecisionRecord> {
        let id = self.record_id.as_str();
        let market = Market::from_key(&self.market)
            .ok_or_else(|| anyhow!("unknown market {} in record {id}", self.market))?;
        let model_used = ModelUsed::from_label(&self.model_used)
            .ok_or_else(|| anyhow!("unknown model {} in record {id}", self.model_used))?;
        let status = RecordStatus::from_key(&self.status)
            .ok_or_else(|| anyhow!("unknown status {} in record {id}", self.status))?;
        let final_score = self
            .final_score
            .as_deref()
            .and_then(crate::history::parse_score_pair);
        let [raw, calibrated, market_prob, fair_odd, edge_initial, edge_current, confidence, stake] =
            self.numbers;
        Ok(DecisionRecord {
            kickoff: parse_time(&self.kickoff, "kickoff", id)?,
            created_at: parse_time(&self.created_at, "created_at", id)?,
            last_seen_at: parse_time(&self.last_seen_at, "last_seen_at", id)?,
            fixture_id: self.fixture_id as u64,
            league_id: self.league_id,
            home_id: self.home_id,
            away_id: self.away_id,
            market,
            provider: self.provider,
            model_prob_raw: raw,
            model_prob_calibrated: calibrated,
            market_prob,
            fair_odd,
            edge_initial,
            edge_current,
            confidence,
            stake_fraction: stake,
            model_used,
            first_odd: self.first_odd,
            last_odd: self.last_odd,
            closing_odd: self.closing_odd,
            clv_pct: self.clv_pct,
            final_score,
            status,
            rating_prob: self.rating_prob,
            predictor_prob: self.predictor_prob,
            record_id: self.record_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClvStats {
    pub count: usize,
    pub avg_clv: f64,
    /// Records with CLV above +2%.
    pub positive: usize,
    pub positive_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub resolved: usize,
    pub won: usize,
    pub win_rate: f64,
    /// Profit over turnover with one unit per pick, percent.
    pub flat_yield_pct: f64,
    /// Profit over turnover under Kelly staking, percent.
    pub kelly_yield_pct: f64,
    pub initial_bankroll: f64,
    pub final_bankroll: f64,
    pub roi_pct: f64,
    pub clv: Option<ClvStats>,
}

/// Replays resolved records in kickoff order. `None` when nothing settled.
pub fn performance_summary(records: &[DecisionRecord], initial_bankroll: f64) -> Option<PerformanceSummary> {
    let mut resolved: Vec<&DecisionRecord> = records.iter().filter(|r| r.status.is_resolved()).collect();
    if resolved.is_empty() {
        return None;
    }
    resolved.sort_by(|a, b| a.kickoff.cmp(&b.kickoff).then_with(|| a.record_id.cmp(&b.record_id)));

    let mut bankroll = initial_bankroll;
    let mut kelly_turnover = 0.0;
    let mut kelly_profit = 0.0;
    let mut flat_profit = 0.0;
    let mut won = 0;
    for r in &resolved {
        let stake = ((r.stake_fraction * bankroll) * 100.0).round() / 100.0;
        let hit = r.status == RecordStatus::Won;
        let profit = if hit { stake * (r.first_odd - 1.0) } else { -stake };
        bankroll += profit;
        kelly_turnover += stake;
        kelly_profit += profit;
        flat_profit += if hit { r.first_odd - 1.0 } else { -1.0 };
        if hit {
            won += 1;
        }
    }

    let n = resolved.len() as f64;
    let clvs: Vec<f64> = resolved.iter().filter_map(|r| r.clv_pct).collect();
    let clv = (!clvs.is_empty()).then(|| {
        let positive = clvs.iter().filter(|c| **c > 2.0).count();
        ClvStats {
            count: clvs.len(),
            avg_clv: clvs.iter().sum::<f64>() / clvs.len() as f64,
            positive,
            positive_rate: positive as f64 / clvs.len() as f64,
        }
    });

    Some(PerformanceSummary {
        resolved: resolved.len(),
        won,
        win_rate: won as f64 / n,
        flat_yield_pct: flat_profit / n * 100.0,
        kelly_yield_pct: if kelly_turnover > 0.0 { kelly_profit / kelly_turnover * 100.0 } else { 0.0 },
        initial_bankroll,
        final_bankroll: bankroll,
        roi_pct: if initial_bankroll > 0.0 {
            (bankroll - initial_bankroll) / initial_bankroll * 100.0
        } else {
            0.0
        },
        clv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Fixture, Quote};
    use chrono::TimeZone;

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 12, 15, 0, 0).unwrap()
    }

    fn candidate(fixture_id: u64, market: Market, odd: f64, edge: f64, confidence: f64) -> DecisionCandidate {
        DecisionCandidate {
            fixture: Fixture {
                fixture_id,
                league_id: 39,
                home_id: 1,
                away_id: 2,
                kickoff: kickoff(),
            },
            market,
            quote: Quote {
                odd,
                provider: "book".to_string(),
            },
            model_prob_raw: 62.0,
            model_prob_calibrated: 60.0,
            market_prob: 100.0 / odd,
            fair_odd: 1.67,
            edge,
            confidence,
            stake_fraction: 0.05,
            model_used: ModelUsed::DixonColes,
            rating_prob: 62.0,
            predictor_prob: Some(58.0),
        }
    }

    fn exercise(ledger: &mut dyn Ledger) {
        let t0 = kickoff() - Duration::hours(6);
        let c = candidate(10, Market::Under25, 1.95, 9.0, 70.0);
        assert_eq!(ledger.upsert(&c, t0).unwrap(), UpsertOutcome::Inserted);

        // Price drifts, edge moves under the minimum: confidence decays.
        let drift = candidate(10, Market::Under25, 1.85, 5.0, 64.0);
        assert_eq!(ledger.upsert(&drift, t0 + Duration::hours(1)).unwrap(), UpsertOutcome::Refreshed);
        let id = record_id(10, Market::Under25);
        let r = ledger.load().unwrap().into_iter().find(|r| r.record_id == id).unwrap();
        assert_eq!(r.first_odd, 1.95);
        assert_eq!(r.last_odd, 1.85);
        assert_eq!(r.edge_initial, 9.0);
        assert_eq!(r.edge_current, 5.0);
        assert_eq!(r.confidence, 48.0);

        // Inside the freeze window nothing moves.
        let late = candidate(10, Market::Under25, 2.05, 12.0, 90.0);
        assert_eq!(ledger.upsert(&late, kickoff() - Duration::minutes(5)).unwrap(), UpsertOutcome::Frozen);

        let settled = ledger.resolve(&id, (1, 0), None).unwrap().unwrap();
        assert_eq!(settled.status, RecordStatus::Won);
        assert_eq!(settled.closing_odd, Some(1.85));
        assert_eq!(settled.clv_pct, Some(5.41));
        assert_eq!(settled.clv_label(), Some(ClvLabel::Excellent));
        assert!(ledger.resolve(&id, (3, 3), None).unwrap().is_none());

        let r = ledger.load().unwrap().into_iter().find(|r| r.record_id == id).unwrap();
        assert_eq!(r.final_score, Some((1, 0)));
        assert_eq!(r.status, RecordStatus::Won);
        assert_eq!(r.predictor_prob, Some(58.0));
    }

    #[test]
    fn memory_ledger_lifecycle() {
        exercise(&mut MemoryLedger::default());
    }

    #[test]
    fn sqlite_ledger_lifecycle() {
        exercise(&mut SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn record_ids_are_stable_and_distinct() {
        let a = record_id(7, Market::Over25);
        assert_eq!(a, record_id(7, Market::Over25));
        assert_eq!(a.len(), 64);
        assert_ne!(a, record_id(7, Market::Under25));
        assert_ne!(a, record_id(8, Market::Over25));
    }

    #[test]
    fn clv_labels() {
        assert_eq!(ClvLabel::from_clv(5.0), ClvLabel::Excellent);
        assert_eq!(ClvLabel::from_clv(2.0), ClvLabel::Good);
        assert_eq!(ClvLabel::from_clv(-2.0), ClvLabel::Neutral);
        assert_eq!(ClvLabel::from_clv(-4.9), ClvLabel::Fair);
        assert_eq!(ClvLabel::from_clv(-5.1), ClvLabel::Poor);
        assert_eq!(clv_pct(2.0, 0.0), None);
    }

    #[test]
    fn performance_replays_kelly_bankroll() {
        let now = kickoff() - Duration::days(1);
        let mut won = DecisionRecord::from_candidate(&candidate(1, Market::Over25, 2.0, 11.0, 70.0), now);
        won.settle(2, 1, Some(1.9));
        let mut lost = DecisionRecord::from_candidate(&candidate(2, Market::Over25, 2.0, 11.0, 70.0), now);
        lost.kickoff += Duration::days(1);
        lost.settle(0, 0, None);
        let pending = DecisionRecord::from_candidate(&candidate(3, Market::BttsNo, 1.9, 9.0, 70.0), now);

        let s = performance_summary(&[lost, pending, won], 200.0).unwrap();
        assert_eq!(s.resolved, 2);
        assert_eq!(s.won, 1);
        // +10 on 200, then -10.5 on 210.
        assert!((s.final_bankroll - 199.5).abs() < 1e-9);
        assert!((s.flat_yield_pct - 0.0).abs() < 1e-9);
        assert!((s.roi_pct + 0.25).abs() < 1e-9);
        let clv = s.clv.unwrap();
        assert_eq!(clv.count, 2);
        assert_eq!(clv.positive, 1);
        assert!(performance_summary(&[], 200.0).is_none());
    }
}
