//! Farm and monitor state files
//!
//! Two JSON records shared between the CLI and the detached monitor:
//!
//! - `.farm-state`: written after a successful apply, removed after destroy
//! - `.monitor-state`: written by the monitor on every (re)start, removed when
//!   it exits
//!
//! Writes replace the file atomically (temp file in the same directory, then
//! rename) so a reader never sees a half-written record. Reading a file that
//! does not exist yields `Ok(None)`.

use crate::error::{Result, TerrafarmError};
use crate::prefs::Preferences;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Farm state file name
pub const FARM_STATE_FILE: &str = ".farm-state";

/// Monitor state file name
pub const MONITOR_STATE_FILE: &str = ".monitor-state";

/// Terraform state file name
pub const TERRAFORM_STATE_FILE: &str = "terraform.tfstate";

/// Monitor log file name
pub const MONITOR_LOG_FILE: &str = "monitor.log";

/// Snapshot of the farm taken right after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmState {
    /// Preferences the farm was created with (secrets redacted)
    pub preferences: Preferences,

    /// Creation time (unix seconds)
    pub started: i64,

    /// Hourly price of a single node, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_hourly: Option<f64>,
}

impl FarmState {
    /// Build a farm state from live preferences; secrets never reach disk
    pub fn new(prefs: &Preferences, started: i64, price_hourly: Option<f64>) -> Self {
        Self {
            preferences: prefs.redacted(),
            started,
            price_hourly,
        }
    }
}

/// Monitor bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    /// PID of the current monitor process
    pub pid: u32,

    /// When the monitor was first started (unix seconds)
    pub started: i64,

    /// Earliest destroy time (unix seconds)
    pub destroy_after: i64,

    /// Grace period after `destroy_after` (seconds, 0 = none)
    pub max_wait: i64,
}

impl MonitorState {
    /// Push the deadline forward by `seconds`.
    ///
    /// The deadline never moves backwards, negative deltas are ignored.
    pub fn prolong(&mut self, seconds: i64) {
        self.destroy_after = self.destroy_after.saturating_add(seconds.max(0));
    }

    /// Deadline after which active builds no longer defer destruction
    pub fn hard_deadline(&self) -> i64 {
        self.destroy_after.saturating_add(self.max_wait)
    }
}

/// File-backed state store rooted at the data directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the farm state file
    pub fn farm_state_path(&self) -> PathBuf {
        self.dir.join(FARM_STATE_FILE)
    }

    /// Path of the monitor state file
    pub fn monitor_state_path(&self) -> PathBuf {
        self.dir.join(MONITOR_STATE_FILE)
    }

    /// Path of the terraform state file
    pub fn terraform_state_path(&self) -> PathBuf {
        self.dir.join(TERRAFORM_STATE_FILE)
    }

    /// Path of the monitor log
    pub fn monitor_log_path(&self) -> PathBuf {
        self.dir.join(MONITOR_LOG_FILE)
    }

    /// Persist farm state
    pub fn save_farm(&self, state: &FarmState) -> Result<()> {
        write_json(&self.farm_state_path(), state)
    }

    /// Read farm state, `None` if there is no farm
    pub fn read_farm(&self) -> Result<Option<FarmState>> {
        read_json(&self.farm_state_path())
    }

    /// Read farm state that must exist
    pub fn require_farm(&self) -> Result<FarmState> {
        self.read_farm()?
            .ok_or_else(|| TerrafarmError::FarmStateMissing(self.farm_state_path()))
    }

    /// Remove farm state
    pub fn delete_farm(&self) -> Result<()> {
        remove(&self.farm_state_path())
    }

    /// Persist monitor state
    pub fn save_monitor(&self, state: &MonitorState) -> Result<()> {
        write_json(&self.monitor_state_path(), state)
    }

    /// Read monitor state, `None` if no monitor is registered
    pub fn read_monitor(&self) -> Result<Option<MonitorState>> {
        read_json(&self.monitor_state_path())
    }

    /// Read monitor state that must exist
    pub fn require_monitor(&self) -> Result<MonitorState> {
        self.read_monitor()?
            .ok_or_else(|| TerrafarmError::MonitorStateMissing(self.monitor_state_path()))
    }

    /// Remove monitor state
    pub fn delete_monitor(&self) -> Result<()> {
        remove(&self.monitor_state_path())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!("Saved {}", path.display());

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| TerrafarmError::StateCorrupted {
            path: path.to_path_buf(),
            source,
        })
}

fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn create_test_monitor_state() -> MonitorState {
        MonitorState {
            pid: 4242,
            started: 1_700_000_000,
            destroy_after: 1_700_003_600,
            max_wait: 0,
        }
    }

    #[test]
    fn test_missing_files_read_as_none() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        assert!(store.read_farm().unwrap().is_none());
        assert!(store.read_monitor().unwrap().is_none());
        assert!(matches!(
            store.require_monitor(),
            Err(TerrafarmError::MonitorStateMissing(_))
        ));
    }

    #[test]
    fn test_monitor_state_round_trip_with_zero_max_wait() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = create_test_monitor_state();

        store.save_monitor(&state).unwrap();
        assert_eq!(store.read_monitor().unwrap(), Some(state));
    }

    #[test]
    fn test_monitor_state_json_layout() {
        let json = serde_json::to_value(create_test_monitor_state()).unwrap();
        assert_eq!(json["pid"], 4242);
        assert_eq!(json["destroy_after"], 1_700_003_600i64);
        assert_eq!(json["max_wait"], 0);
    }

    #[test]
    fn test_farm_state_is_redacted() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let prefs = Preferences {
            token: "a".repeat(64),
            password: "secret".to_string(),
            template: "c7".to_string(),
            ..Default::default()
        };

        store
            .save_farm(&FarmState::new(&prefs, 1_700_000_000, Some(0.238)))
            .unwrap();

        let raw = fs::read_to_string(store.farm_state_path()).unwrap();
        assert!(!raw.contains("secret"));
        assert!(!raw.contains(&"a".repeat(64)));

        let farm = store.require_farm().unwrap();
        assert_eq!(farm.preferences.template, "c7");
        assert_eq!(farm.price_hourly, Some(0.238));
    }

    #[test]
    fn test_save_replaces_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = create_test_monitor_state();

        store.save_monitor(&state).unwrap();
        state.pid = 7;
        store.save_monitor(&state).unwrap();

        assert_eq!(store.require_monitor().unwrap().pid, 7);
        // Only the state file, no leftover temp files
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupted_state_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.monitor_state_path(), "{not json").unwrap();

        let err = store.read_monitor().unwrap_err();
        assert!(matches!(err, TerrafarmError::StateCorrupted { .. }));
        assert!(err.is_fatal_for_monitor());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        store.save_monitor(&create_test_monitor_state()).unwrap();
        store.delete_monitor().unwrap();
        store.delete_monitor().unwrap();
        store.delete_farm().unwrap();

        assert!(store.read_monitor().unwrap().is_none());
    }

    #[test]
    fn test_hard_deadline() {
        let state = MonitorState {
            max_wait: 1800,
            ..create_test_monitor_state()
        };
        assert_eq!(state.hard_deadline(), 1_700_005_400);
    }

    proptest! {
        #[test]
        fn prolong_never_moves_deadline_backwards(
            destroy_after in 0i64..=i64::MAX,
            delta in i64::MIN..=i64::MAX,
        ) {
            let mut state = MonitorState { destroy_after, ..create_test_monitor_state() };
            state.prolong(delta);
            prop_assert!(state.destroy_after >= destroy_after);
        }
    }
}
