use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::persist::app_cache_dir;

/// A finished league match with a final score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalMatch {
    pub match_id: u64,
    pub league_id: u32,
    pub season: String,
    pub kickoff: DateTime<Utc>,
    pub home_id: u32,
    pub away_id: u32,
    pub home_goals: u8,
    pub away_goals: u8,
}

impl HistoricalMatch {
    pub fn total_goals(&self) -> u32 {
        self.home_goals as u32 + self.away_goals as u32
    }

    pub fn both_scored(&self) -> bool {
        self.home_goals > 0 && self.away_goals > 0
    }

    pub fn involves(&self, team_id: u32) -> bool {
        self.home_id == team_id || self.away_id == team_id
    }
}

/// Where finished matches come from. Results are in chronological order.
pub trait HistorySource {
    fn finished_matches(&self, league_id: u32) -> Result<Vec<HistoricalMatch>>;

    fn league_ids(&self) -> Result<Vec<u32>>;
}

/// In-memory history, mostly for synthetic leagues and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    matches: Vec<HistoricalMatch>,
}

impl MemoryHistory {
    pub fn new(mut matches: Vec<HistoricalMatch>) -> Self {
        sort_chronologically(&mut matches);
        Self { matches }
    }

    pub fn push(&mut self, m: HistoricalMatch) {
        self.matches.push(m);
        sort_chronologically(&mut self.matches);
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

impl HistorySource for MemoryHistory {
    fn finished_matches(&self, league_id: u32) -> Result<Vec<HistoricalMatch>> {
        Ok(self
            .matches
            .iter()
            .filter(|m| m.league_id == league_id)
            .cloned()
            .collect())
    }

    fn league_ids(&self) -> Result<Vec<u32>> {
        let ids: BTreeSet<u32> = self.matches.iter().map(|m| m.league_id).collect();
        Ok(ids.into_iter().collect())
    }
}

pub fn sort_chronologically(matches: &mut [HistoricalMatch]) {
    matches.sort_by(|a, b| {
        a.kickoff
            .cmp(&b.kickoff)
            .then_with(|| a.match_id.cmp(&b.match_id))
    });
}

/// SQLite-backed match store.
pub struct HistoryDb {
    conn: Connection,
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join("historical_matches.sqlite"))
}

impl HistoryDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Inserts or updates every match in one transaction; returns rows written.
    pub fn upsert_matches(&mut self, matches: &[HistoricalMatch]) -> Result<usize> {
        let tx = self.conn.transaction().context("begin upsert transaction")?;
        for m in matches {
            upsert_match(&tx, m)?;
        }
        tx.commit().context("commit upsert transaction")?;
        Ok(matches.len())
    }

    pub fn match_count(&self) -> Result<usize> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM matches", [], |row| row.get::<_, i64>(0))
            .context("count matches")?;
        Ok(n.max(0) as usize)
    }
}

impl HistorySource for HistoryDb {
    fn finished_matches(&self, league_id: u32) -> Result<Vec<HistoricalMatch>> {
        load_finished_matches(&self.conn, league_id)
    }

    fn league_ids(&self) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT league_id FROM matches ORDER BY league_id")
            .context("prepare league ids query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, u32>(0))
            .context("query league ids")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode league id")?);
        }
        Ok(out)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS matches (
            match_id INTEGER PRIMARY KEY,
            league_id INTEGER NOT NULL,
            season TEXT NOT NULL,
            kickoff TEXT NOT NULL,
            home_id INTEGER NOT NULL,
            away_id INTEGER NOT NULL,
            home_goals INTEGER NOT NULL,
            away_goals INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_league ON matches(league_id);
        CREATE INDEX IF NOT EXISTS idx_matches_kickoff ON matches(kickoff);
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

fn load_finished_matches(conn: &Connection, league_id: u32) -> Result<Vec<HistoricalMatch>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT match_id, league_id, season, kickoff, home_id, away_id, home_goals, away_goals
            FROM matches
            WHERE league_id = ?1
            ORDER BY kickoff ASC, match_id ASC
            "#,
        )
        .context("prepare load matches query")?;

    let rows = stmt
        .query_map(params![league_id as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u8>(6)?,
                row.get::<_, u8>(7)?,
            ))
        })
        .context("query load matches")?;

    let mut out = Vec::new();
    for row in rows {
        let (match_id, league_id, season, kickoff, home_id, away_id, home_goals, away_goals) =
            row.context("decode match row")?;
        let kickoff = DateTime::parse_from_rfc3339(&kickoff)
            .with_context(|| format!("bad kickoff for match {match_id}: {kickoff}"))?
            .with_timezone(&Utc);
        out.push(HistoricalMatch {
            match_id: match_id as u64,
            league_id,
            season,
            kickoff,
            home_id,
            away_id,
            home_goals,
            away_goals,
        });
    }
    Ok(out)
}

fn upsert_match(tx: &rusqlite::Transaction<'_>, m: &HistoricalMatch) -> Result<()> {
    if m.home_id == m.away_id {
        return Err(anyhow!("match {} has the same team on both sides", m.match_id));
    }
    tx.execute(
        r#"
        INSERT INTO matches (
            match_id, league_id, season, kickoff, home_id, away_id, home_goals, away_goals, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(match_id) DO UPDATE SET
            league_id = excluded.league_id,
            season = excluded.season,
            kickoff = excluded.kickoff,
            home_id = excluded.home_id,
            away_id = excluded.away_id,
            home_goals = excluded.home_goals,
            away_goals = excluded.away_goals,
            updated_at = excluded.updated_at
        "#,
        params![
            m.match_id as i64,
            m.league_id as i64,
            m.season,
            m.kickoff.to_rfc3339(),
            m.home_id as i64,
            m.away_id as i64,
            m.home_goals as i64,
            m.away_goals as i64,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("upsert match")?;
    Ok(())
}

/// Reads a JSON array of matches (the `--import` format of the CLI).
pub fn load_json_matches(path: &Path) -> Result<Vec<HistoricalMatch>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read history file {}", path.display()))?;
    let mut matches: Vec<HistoricalMatch> =
        serde_json::from_str(&raw).context("invalid history json")?;
    sort_chronologically(&mut matches);
    Ok(matches)
}

/// Parses loose score strings such as `"2-1"` or `"FT 0 : 0"`.
pub fn parse_score_pair(raw: &str) -> Option<(u8, u8)> {
    let mut nums = raw
        .split(|ch: char| !ch.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u8>().ok());
    let home = nums.next()?;
    let away = nums.next()?;
    Some((home, away))
}
