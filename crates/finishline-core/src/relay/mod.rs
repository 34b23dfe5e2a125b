//! Relay transport boundary
//!
//! The relay is a publish/subscribe service: a connection joins named groups
//! (one per event), broadcasts named invocations with positional arguments to
//! a group, and receives every invocation broadcast to groups it belongs to,
//! including its own.
//!
//! A [`Relay`] only knows how to open connections. An open connection is a
//! [`RelayLink`]: commands go out through an unbounded sender, invocations
//! come in through an unbounded receiver, and the receiver yielding `None`
//! means the connection closed.
//!
//! ## Implementations
//!
//! - [`WebSocketRelay`]: CBOR frames over a WebSocket
//! - [`MemoryRelay`]: in-process hub for tests and local demos
//! - [`OfflineRelay`]: refuses every connection, for devices working offline

mod frame;
pub mod memory;
mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use frame::{ClientFrame, ServerFrame};
pub use memory::MemoryRelay;
pub use websocket::WebSocketRelay;

/// Errors raised while opening or using a relay connection
#[derive(Error, Debug)]
pub enum RelayError {
    /// Relay refused or is not reachable
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Transport-level connection failure
    #[error("Failed to connect to relay ({url}): {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// Relay answered but the handshake did not complete
    #[error("Relay handshake failed: {0}")]
    Handshake(String),

    /// No handshake response in time
    #[error("Timeout waiting for relay ({0}). Check that the relay is running.")]
    Timeout(String),

    /// Frame could not be encoded or decoded
    #[error("Relay frame codec error: {0}")]
    Codec(String),

    /// Connection is gone
    #[error("Relay connection closed")]
    Closed,

    /// This device works without a relay; retrying will not help
    #[error("Working offline")]
    Offline,
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// A named message with positional arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub target: String,
    pub arguments: Vec<Value>,
}

impl Invocation {
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

/// Commands sent over an open relay connection
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    /// Subscribe this connection to a group
    JoinGroup { group: String },
    /// Unsubscribe this connection from a group
    LeaveGroup { group: String },
    /// Send an invocation to every member of a group
    Broadcast { group: String, invocation: Invocation },
}

/// An open relay connection
pub struct RelayLink {
    /// Id the relay assigned to this connection
    pub connection_id: String,
    /// Outbound commands; closed once the connection is gone
    pub commands: mpsc::UnboundedSender<RelayCommand>,
    /// Inbound invocations; yields `None` when the connection closes
    pub invocations: mpsc::UnboundedReceiver<Invocation>,
}

/// A relay that can open connections
#[async_trait]
pub trait Relay: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> RelayResult<RelayLink>;
}

/// Relay for a device that works offline
///
/// Every connection attempt fails with [`RelayError::Offline`], so the
/// engine stays disconnected instead of reporting a connection nobody else
/// can reach.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRelay;

#[async_trait]
impl Relay for OfflineRelay {
    async fn connect(&self) -> RelayResult<RelayLink> {
        Err(RelayError::Offline)
    }
}
