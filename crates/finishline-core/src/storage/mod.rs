//! Storage layer
//!
//! Two kinds of storage live here:
//!
//! - **History store** ([`DurableStore`]): the system of record shared by all
//!   devices of an event, used for full-history recovery. [`SqliteStore`] is
//!   the file-backed implementation, [`MemoryStore`] the in-process one.
//! - **Snapshots** ([`SnapshotStore`]): this device's own replica saved
//!   between runs, one JSON file per event.

pub mod error;
mod memory;
pub mod schema;
pub mod snapshot;
mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Assignment;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use snapshot::{LocalSnapshot, SnapshotStore};
pub use sqlite::SqliteStore;

/// Rows are written in transactions of at most this many records
pub const UPSERT_BATCH_SIZE: usize = 100;

/// A device that has joined an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDevice {
    pub device_id: String,
    pub display_name: Option<String>,
    pub last_seen: i64,
}

/// The durable history store
///
/// Assignments are keyed by `(event_id, token)`. Writes replace whatever is
/// stored for the key; ordering between competing writers is decided by the
/// merge rule of the readers, not by the store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// All assignments recorded for an event
    async fn get_assignments(&self, event_id: &str) -> StorageResult<Vec<Assignment>>;

    /// Insert or replace assignments, attributed to `device_id`
    async fn upsert_assignments(
        &self,
        event_id: &str,
        assignments: &[Assignment],
        device_id: &str,
    ) -> StorageResult<()>;

    /// Remove a token's assignment; removing a missing one succeeds
    async fn delete_assignment(&self, event_id: &str, token: u32) -> StorageResult<()>;

    /// Record that a device is active in an event, keeping its display name
    async fn touch_device_last_seen(&self, event_id: &str, device_id: &str) -> StorageResult<()>;

    /// Set a device's display name within an event
    async fn set_device_name(
        &self,
        event_id: &str,
        device_id: &str,
        display_name: &str,
    ) -> StorageResult<()>;

    /// Highest token recorded for an event, 0 when none
    async fn highest_token(&self, event_id: &str) -> StorageResult<u32>;

    /// Devices that have joined an event, most recently seen first
    async fn devices(&self, event_id: &str) -> StorageResult<Vec<EventDevice>>;
}

/// Row key of a token (`42` -> `0042`)
pub fn row_key(token: u32) -> String {
    format!("{:04}", token)
}
