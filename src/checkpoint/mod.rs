//! Durable run-state checkpoints.
//!
//! Each run is stored as `<dir>/<run_id>.json`. Writes go to a temp file in
//! the same directory, are synced, renamed over the target, and the directory
//! is synced, so a reader sees either the previous checkpoint or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::errors::CheckpointError;
use crate::orchestrator::state::{RunState, RunStatus, SCHEMA_VERSION};

const TEMP_SUFFIX: &str = ".tmp";
const STOP_SUFFIX: &str = ".stop";

/// Write `bytes` to `path` atomically, creating parent directories as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let temp_path = dir.join(format!(
        ".{}.{}{}",
        file_name,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)?;
        fsync_dir(dir)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

/// Run ids become file names, so only a safe alphabet is accepted.
pub fn validate_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 128
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    }
}

/// File-per-run checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{}.json", run_id)))
    }

    /// Persist `state` under `run_id`, replacing any previous checkpoint.
    pub fn save(&self, run_id: &str, state: &RunState) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(run_id)?;
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| CheckpointError::Serialize {
            run_id: run_id.to_string(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(run_id, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Load a checkpoint, surfacing corruption as an error.
    pub fn try_load(&self, run_id: &str) -> Result<Option<RunState>, CheckpointError> {
        let path = self.path_for(run_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let state: RunState =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                run_id: run_id.to_string(),
                message: e.to_string(),
            })?;
        if state.schema_version > SCHEMA_VERSION {
            return Err(CheckpointError::Corrupt {
                run_id: run_id.to_string(),
                message: format!(
                    "schema version {} is newer than supported version {}",
                    state.schema_version, SCHEMA_VERSION
                ),
            });
        }
        if state.run_id != run_id {
            return Err(CheckpointError::Corrupt {
                run_id: run_id.to_string(),
                message: format!("file holds run {}", state.run_id),
            });
        }
        Ok(Some(state))
    }

    /// Load a checkpoint. Anything unreadable is logged and treated as absent.
    pub fn load(&self, run_id: &str) -> Option<RunState> {
        match self.try_load(run_id) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "ignoring unusable checkpoint");
                None
            }
        }
    }

    /// Run ids with a checkpoint, sorted.
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
                    return None;
                }
                let id = name.strip_suffix(".json")?;
                validate_run_id(id).ok()?;
                Some(id.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Every usable checkpoint, in run id order.
    pub fn load_all(&self) -> Result<Vec<RunState>, CheckpointError> {
        Ok(self
            .list()?
            .iter()
            .filter_map(|id| self.load(id))
            .collect())
    }

    /// Delete a checkpoint. Returns whether one existed.
    pub fn remove(&self, run_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(run_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    /// Mark a stored run aborted. Returns false if there is no usable
    /// checkpoint or the run already finished.
    pub fn mark_aborted(&self, run_id: &str, reason: &str) -> Result<bool, CheckpointError> {
        let Some(mut state) = self.try_load(run_id)? else {
            return Ok(false);
        };
        if state.overall_status.is_terminal() {
            return Ok(false);
        }
        if let Some(phase) = state.running_phase() {
            state.fail_phase(phase, &crate::errors::PhaseError::Cancelled);
        }
        state.abort(reason);
        debug_assert_eq!(state.overall_status, RunStatus::Aborted);
        self.save(run_id, &state)?;
        Ok(true)
    }

    fn stop_marker(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{}{}", run_id, STOP_SUFFIX)))
    }

    /// Ask the process driving `run_id` to stop. The engine polls for this marker.
    pub fn request_stop(&self, run_id: &str) -> Result<(), CheckpointError> {
        let path = self.stop_marker(run_id)?;
        write_atomic(&path, b"stop").map_err(|source| CheckpointError::Io { path, source })
    }

    pub fn stop_requested(&self, run_id: &str) -> bool {
        self.stop_marker(run_id).is_ok_and(|p| p.exists())
    }

    /// Remove a stop marker. Returns whether one existed.
    pub fn clear_stop(&self, run_id: &str) -> Result<bool, CheckpointError> {
        let path = self.stop_marker(run_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{Caller, Tier};
    use crate::orchestrator::state::RunOptions;
    use crate::phase::{Phase, PhaseStatus};
    use tempfile::tempdir;

    fn make_state(run_id: &str) -> RunState {
        RunState::new(
            run_id,
            PathBuf::from("/tmp/repo"),
            &Caller::new("alice", Tier::Free),
            RunOptions::default(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = make_state("run-a");
        state.succeed_phase(Phase::EnvironmentDetect, serde_json::json!({"lang": "python"}));

        let path = store.save("run-a", &state).unwrap();
        assert_eq!(path, dir.path().join("run-a.json"));

        let loaded = store.load("run-a").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("nope").is_none());
        assert!(store.try_load("nope").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_is_treated_as_missing() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(dir.path().join("broken.json"), "{\"run_id\": ").unwrap();

        assert!(store.load("broken").is_none());
        assert!(matches!(
            store.try_load("broken"),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = make_state("future");
        state.schema_version = SCHEMA_VERSION + 1;
        store.save("future", &state).unwrap();

        assert!(store.load("future").is_none());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = make_state("extra");
        let mut json = serde_json::to_value(&state).unwrap();
        json["added_later"] = serde_json::json!({"x": 1});
        fs::write(dir.path().join("extra.json"), json.to_string()).unwrap();

        assert_eq!(store.load("extra").unwrap().run_id, "extra");
    }

    #[test]
    fn test_invalid_run_id_rejected() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = make_state("ok");
        assert!(matches!(
            store.save("../escape", &state),
            Err(CheckpointError::InvalidRunId(_))
        ));
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("a b").is_err());
        assert!(validate_run_id("run_1-x").is_ok());
    }

    #[test]
    fn test_list_is_sorted_and_skips_temp_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("b-run", &make_state("b-run")).unwrap();
        store.save("a-run", &make_state("a-run")).unwrap();
        fs::write(dir.path().join(".a-run.json.123.tmp"), "partial").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a-run", "b-run"]);
    }

    #[test]
    fn test_load_all_skips_corrupt_checkpoints() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("one", &make_state("one")).unwrap();
        store.save("two", &make_state("two")).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let ids: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|s| s.run_id)
            .collect();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for _ in 0..3 {
            store.save("r", &make_state("r")).unwrap();
        }
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["r.json"]);
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("gone", &make_state("gone")).unwrap();
        assert!(store.remove("gone").unwrap());
        assert!(!store.remove("gone").unwrap());
        assert!(store.load("gone").is_none());
    }

    #[test]
    fn test_mark_aborted_fails_running_phase() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = make_state("live");
        state.begin_phase(Phase::DependencySetup).unwrap();
        store.save("live", &state).unwrap();

        assert!(store.mark_aborted("live", "stopped by user").unwrap());
        let loaded = store.load("live").unwrap();
        assert_eq!(loaded.overall_status, RunStatus::Aborted);
        assert_eq!(loaded.run_error.as_deref(), Some("stopped by user"));
        assert_eq!(loaded.status_of(Phase::DependencySetup), PhaseStatus::Failed);

        assert!(!store.mark_aborted("live", "again").unwrap());
    }

    #[test]
    fn test_stop_marker_lifecycle() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save("busy", &make_state("busy")).unwrap();
        assert!(!store.stop_requested("busy"));

        store.request_stop("busy").unwrap();
        assert!(store.stop_requested("busy"));
        assert_eq!(store.list().unwrap(), vec!["busy"]);

        assert!(store.clear_stop("busy").unwrap());
        assert!(!store.clear_stop("busy").unwrap());
        assert!(!store.stop_requested("busy"));
        assert!(store.request_stop("../x").is_err());
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }
}
