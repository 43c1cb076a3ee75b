//! On-disk form of a stateful plugin's history.
//!
//! Saves go to a sibling `.tmp` file that is synced and then renamed over
//! the target, so a crash mid-write leaves the previous file intact.
//! Loads never fail hard: a missing, corrupt, or unsupported file reads as
//! "absent" and is logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{ContextMemory, HistoryEntry, HistoryLog};
use crate::consts::{MIN_STATE_VERSION, STATE_VERSION};
use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<HistoryEntry>,
    #[serde(default)]
    pub memory: ContextMemory,
}

impl PersistedState {
    pub fn new(
        log: &HistoryLog,
        memory: &ContextMemory,
        execution_count: u64,
        last_execution: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            execution_count,
            last_execution,
            entries: log.to_vec(),
            memory: memory.clone(),
        }
    }

    /// Rebuild the log under the current size cap.
    pub fn to_log(&self, max_size: usize) -> HistoryLog {
        HistoryLog::from_entries(self.entries.clone(), max_size)
    }
}

/// Reads and writes one state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }

        let temp = self.temp_path();
        let written = File::create(&temp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&temp, &self.path)) {
            let _ = fs::remove_file(&temp);
            return Err(PersistenceError::io(&self.path, e));
        }

        debug!(path = %self.path.display(), entries = state.entries.len(), "state saved");
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool, off the async workers.
    pub async fn save_async(&self, state: PersistedState) -> Result<(), PersistenceError> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.save(&state))
            .await
            .map_err(|e| PersistenceError::Writer(e.to_string()))?
    }

    /// `Ok(None)` when no file exists yet.
    pub fn try_load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        let corrupt = |source| PersistenceError::Corrupt {
            path: self.path.clone(),
            source,
        };
        let value: Value = serde_json::from_str(&contents).map_err(corrupt)?;

        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if !(MIN_STATE_VERSION..=STATE_VERSION).contains(&version) {
            return Err(PersistenceError::UnsupportedVersion {
                found: version,
                min: MIN_STATE_VERSION,
                max: STATE_VERSION,
            });
        }

        serde_json::from_value(value).map(Some).map_err(corrupt)
    }

    /// Like [`try_load`](Self::try_load), but any problem is logged and
    /// treated as "no saved state".
    pub fn load(&self) -> Option<PersistedState> {
        match self.try_load() {
            Ok(Some(state)) => {
                debug!(path = %self.path.display(), entries = state.entries.len(), "state loaded");
                Some(state)
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "no saved state, starting fresh");
                None
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable state file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Stage;
    use crate::history::Role;

    fn sample_state() -> PersistedState {
        let mut log = HistoryLog::new(10);
        log.append(HistoryEntry::new(Role::User, Stage::Think, "first").with_category("a"));
        log.append(HistoryEntry::new(Role::Assistant, Stage::Review, "second"));
        let mut memory = ContextMemory::default();
        memory.record_message("first", Stage::Think);
        PersistedState::new(&log, &memory, 2, Some(Utc::now()))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));
        let state = sample_state();

        file.save(&state).unwrap();
        assert_eq!(file.try_load().unwrap(), Some(state));
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("none.json"));
        assert!(file.try_load().unwrap().is_none());
        assert!(file.load().is_none());
    }

    #[test]
    fn corrupt_file_is_reported_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let file = StateFile::new(&path);

        assert!(matches!(file.try_load(), Err(PersistenceError::Corrupt { .. })));
        assert!(file.load().is_none());
    }

    #[test]
    fn future_version_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "saved_at": "2026-01-01T00:00:00Z"}"#).unwrap();
        let file = StateFile::new(&path);

        assert!(matches!(
            file.try_load(),
            Err(PersistenceError::UnsupportedVersion { found: 99, .. })
        ));
        assert!(file.load().is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "version": 1,
                "saved_at": "2026-01-01T00:00:00Z",
                "execution_count": 4,
                "written_by": "a newer build",
                "entries": [{
                    "timestamp": "2026-01-01T00:00:00Z",
                    "role": "user",
                    "stage": "THINK",
                    "message": "hi",
                    "sentiment": "positive"
                }]
            }"#,
        )
        .unwrap();

        let state = StateFile::new(&path).try_load().unwrap().unwrap();
        assert_eq!(state.execution_count, 4);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].message, "hi");
    }

    #[test]
    fn failed_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let file = StateFile::new(&path);
        file.save(&sample_state()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A directory squatting on the temp path makes the write fail.
        fs::create_dir(file.temp_path()).unwrap();
        let mut changed = sample_state();
        changed.execution_count = 99;
        assert!(matches!(file.save(&changed), Err(PersistenceError::Io { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn save_async_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        let state = sample_state();

        file.save_async(state.clone()).await.unwrap();
        assert_eq!(file.try_load().unwrap(), Some(state));
    }

    #[test]
    fn to_log_applies_current_cap() {
        let state = sample_state();
        let log = state.to_log(1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().unwrap().message, "second");
    }
}
