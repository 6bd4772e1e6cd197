use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dixon_coles::{LeagueModel, RatingStore};
use crate::ensemble::EnsembleState;

const CACHE_DIR: &str = "footy_value";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    models: Vec<LeagueModel>,
    #[serde(default)]
    ensemble: EnsembleState,
}

/// Fitted state restored from disk.
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    pub store: RatingStore,
    pub ensemble: EnsembleState,
}

pub fn app_cache_dir() -> Option<PathBuf> {
    // Prefer XDG cache.
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

pub fn default_snapshot_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(SNAPSHOT_FILE))
}

pub fn save_snapshot(
    path: &Path,
    store: &RatingStore,
    ensemble: &EnsembleState,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        saved_at: now,
        models: store.models().cloned().collect(),
        ensemble: ensemble.clone(),
    };
    let json = serde_json::to_string(&file).context("serialize snapshot")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    debug!(path = %path.display(), models = file.models.len(), "snapshot saved");
    Ok(())
}

/// Missing files and stale versions read as `None`; corrupt JSON is an error.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value: serde_json::Value = serde_json::from_str(&raw).context("invalid snapshot json")?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    if version != u64::from(SNAPSHOT_VERSION) {
        warn!(
            found = version,
            expected = SNAPSHOT_VERSION,
            "ignoring snapshot with old version"
        );
        return Ok(None);
    }
    let file: SnapshotFile = serde_json::from_value(value).context("invalid snapshot json")?;
    let mut store = RatingStore::default();
    for model in file.models {
        store.insert(model);
    }
    Ok(Some(Snapshot {
        saved_at: file.saved_at,
        store,
        ensemble: file.ensemble,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketScope;

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("footy_value_snap_{}", std::process::id()));
        let path = dir.join("snap.json");
        let mut store = RatingStore::default();
        store.insert(LeagueModel::empty_for_tests(39, MarketScope::General));
        let mut ensemble = EnsembleState::default();
        ensemble.set_predictor_weight(0.30);

        save_snapshot(&path, &store, &ensemble, Utc::now()).unwrap();
        let snap = load_snapshot(&path).unwrap().unwrap();
        assert!(snap.store.get(39, MarketScope::General).is_some());
        assert!((snap.ensemble.predictor_weight() - 0.30).abs() < 1e-12);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let path = std::env::temp_dir().join("footy_value_definitely_missing.json");
        assert!(load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn old_snapshot_versions_are_ignored() {
        let dir = std::env::temp_dir().join(format!("footy_value_snap_old_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snap.json");
        fs::write(
            &path,
            r#"{"version":1,"saved_at":"2025-01-01T00:00:00Z","models":[],"ensemble":{"weight_history":[0.3]}}"#,
        )
        .unwrap();
        assert!(load_snapshot(&path).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
