//! Storage errors
//!
//! One error type covers the history store and the local snapshot files.
//! File system failures are classified by kind so the CLI can tell the
//! operator what to do about them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied on '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No space left while writing '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Snapshot not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Snapshot could not be parsed; the bad file was moved aside
    #[error("Snapshot '{path}' is unreadable ({details}), moved to '{backup_path}'")]
    CorruptSnapshot {
        path: PathBuf,
        backup_path: PathBuf,
        details: String,
    },

    /// The temp file was written but could not replace the target
    #[error("Could not move '{from}' into place at '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("History database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row does not hold a valid assignment
    #[error("Invalid record '{row_key}' in event '{event_id}': {details}")]
    InvalidRecord {
        event_id: String,
        row_key: String,
        details: String,
    },

    /// History store cannot be reached
    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Classify an I/O error on `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            _ if is_disk_full(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// What the operator can do about it, if anything
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } | StorageError::CreateDirectory { .. } => {
                Some("Check that the data directory exists and is writable.")
            }
            StorageError::CorruptSnapshot { .. } => Some(
                "Run `finishline history --pull` to rebuild the event from peers and the history store.",
            ),
            StorageError::Unavailable(_) | StorageError::Database(_) => {
                Some("Peers still received the change. Retry once the history store is reachable.")
            }
            _ => None,
        }
    }
}

fn is_disk_full(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("disk full") || msg.contains("quota exceeded")
}

pub type StorageResult<T> = Result<T, StorageError>;
