//! Peer synchronisation
//!
//! Each device holds an [`EventReplica`] (event name, shared token counter,
//! held token) and an [`AssignmentRegister`] (token to athlete). Local
//! intents apply immediately and are broadcast through the relay; inbound
//! messages are merged with rules that converge regardless of order:
//!
//! - token claims only ever move the counter forward, and two devices
//!   holding the same token settle it by comparing origin ids
//! - assignments are last-writer-wins on timestamp, ties to the larger
//!   origin id
//! - a periodic digest exchange detects missing records and triggers a
//!   pull from the history store
//!
//! Messages that echo this device's own broadcasts, or that belong to another
//! event, never change state.

mod connection;
mod engine;
mod error;
mod gateway;
mod message;
mod reconciler;
mod register;
mod replica;

pub use connection::{Backoff, ConnectionStatus};
pub use engine::{DeviceState, EngineEvent, EngineHandle, SyncEngine, SyncTimings};
pub use error::{SyncError, SyncResult};
pub use gateway::AssignmentCheck;
pub use message::{MessageError, ProtocolMessage};
pub use reconciler::{Digest, Jitter};
pub use register::{AssignmentRegister, MergeOutcome};
pub use replica::{DetailsOutcome, EventReplica, TokenUsedOutcome};
