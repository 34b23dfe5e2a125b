//! Sync error types

use thiserror::Error;

use super::message::MessageError;
use crate::models::ValidationError;
use crate::relay::RelayError;
use crate::storage::StorageError;

/// Errors surfaced by the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// No live relay connection for the current event
    #[error("Not connected to the relay")]
    NotConnected,

    /// Operator input rejected before anything was broadcast
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// History store read or write failed
    #[error("History store error: {0}")]
    Store(#[from] StorageError),

    /// Inbound message could not be decoded
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether the change still reached peers or the local replica
    ///
    /// Store failures happen after the local change and the broadcast, so the
    /// operator's action is not lost.
    pub fn is_partial(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}
