//! Local replica snapshots
//!
//! Saves this device's view of an event between runs. Uses atomic writes
//! (write to temp file, then rename) to prevent corruption.
//!
//! Files, under `Config::snapshot_dir()`:
//! - `<event id>.json` - one snapshot per event
//! - `current_event` - id of the event this device last worked on

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{StorageError, StorageResult};
use crate::models::{Assignment, EntryMethod, DEFAULT_EVENT_NAME};

const CURRENT_EVENT_FILE: &str = "current_event";

/// Everything a device keeps about one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub event_id: String,
    pub event_name: String,
    pub next_token: u32,
    pub current_token: u32,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    /// Entry method the operator used last
    #[serde(default = "default_method")]
    pub preferred_method: EntryMethod,
    #[serde(default)]
    pub saved_at: i64,
}

fn default_method() -> EntryMethod {
    EntryMethod::Manual
}

impl LocalSnapshot {
    /// Snapshot of an event nobody has touched yet
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_name: DEFAULT_EVENT_NAME.to_string(),
            next_token: 1,
            current_token: 0,
            assignments: Vec::new(),
            preferred_method: default_method(),
            saved_at: 0,
        }
    }
}

/// Snapshot files for all events on this device
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the snapshot files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an event's snapshot file
    pub fn path(&self, event_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", event_id))
    }

    /// Check if a snapshot exists for an event
    pub fn exists(&self, event_id: &str) -> bool {
        self.path(event_id).exists()
    }

    /// Load an event's snapshot
    ///
    /// Returns `None` if there is none. A file that cannot be parsed is moved
    /// to `<name>.corrupt` and reported as [`StorageError::CorruptSnapshot`].
    pub fn load(&self, event_id: &str) -> StorageResult<Option<LocalSnapshot>> {
        let path = self.path(event_id);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::ReadError { path, source }),
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                let backup_path = path.with_extension("json.corrupt");
                warn!("Snapshot {:?} is corrupted, moving it to {:?}", path, backup_path);
                fs::rename(&path, &backup_path).map_err(|source| {
                    StorageError::AtomicWriteFailed {
                        from: path.clone(),
                        to: backup_path.clone(),
                        source,
                    }
                })?;
                Err(StorageError::CorruptSnapshot {
                    path,
                    backup_path,
                    details: e.to_string(),
                })
            }
        }
    }

    /// Save a snapshot, stamping `saved_at`
    pub fn save(&self, snapshot: &mut LocalSnapshot) -> StorageResult<()> {
        snapshot.saved_at = crate::models::now_millis();
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        atomic_write(&self.path(&snapshot.event_id), &bytes)?;
        debug!(
            "Saved snapshot of event {} ({} assignments)",
            snapshot.event_id,
            snapshot.assignments.len()
        );
        Ok(())
    }

    /// Remove an event's snapshot
    pub fn delete(&self, event_id: &str) -> StorageResult<()> {
        let path = self.path(event_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }

    /// Ids of all events with a snapshot, sorted
    pub fn list_events(&self) -> StorageResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::ReadError {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "json" {
                    return None;
                }
                Some(path.file_stem()?.to_string_lossy().into_owned())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Event this device last worked on
    pub fn current_event(&self) -> StorageResult<Option<String>> {
        let path = self.dir.join(CURRENT_EVENT_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let id = content.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::ReadError { path, source }),
        }
    }

    /// Remember the event this device works on
    pub fn set_current_event(&self, event_id: &str) -> StorageResult<()> {
        atomic_write(&self.dir.join(CURRENT_EVENT_FILE), event_id.as_bytes())
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::AtomicWriteFailed {
        from: temp_path,
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
