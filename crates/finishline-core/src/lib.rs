//! finishline core library
//!
//! This crate provides the peer synchronisation protocol behind finishline,
//! a tool that lets several devices at a timed event hand out sequential
//! finish tokens (`P0001`, `P0002`, ...) and record which athlete received
//! each one, without a central coordinator.
//!
//! # Architecture
//!
//! - **Relay**: publish/subscribe transport, devices in one event share a group
//! - **Durable store**: system of record used for full-history recovery
//! - **Sync engine**: local replica, merge rules, liveness and anti-entropy
//!
//! Every device applies its own intents optimistically, broadcasts them, and
//! merges what peers broadcast using last-writer-wins rules. A periodic digest
//! exchange detects divergence and triggers a pull from the durable store.
//!
//! # Quick Start
//!
//! ```text
//! let identity = Identity::with_config(config.clone()).session()?;
//! let engine = SyncEngine::new(identity, relay, store, SyncTimings::default(), state);
//! let handle = engine.start();
//!
//! let token = engine.claim_token().await?;
//! engine.save_assignment(token, "A42", "Sam", EntryMethod::Scan).await?;
//! ```
//!
//! # Modules
//!
//! - `config`: Application configuration
//! - `identity`: Device and session identifiers
//! - `models`: Assignments, wire records, token and barcode helpers
//! - `relay`: Relay transport boundary (WebSocket and in-memory)
//! - `storage`: Durable store boundary and local snapshots
//! - `sync`: Replica, register, connection manager and engine

pub mod config;
pub mod identity;
pub mod models;
pub mod relay;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use identity::{Identity, InitResult, SessionIdentity};
pub use models::{Assignment, EntryMethod, ValidationError, WireAssignment};
pub use relay::{MemoryRelay, OfflineRelay, Relay, WebSocketRelay};
pub use storage::{DurableStore, MemoryStore, SnapshotStore, SqliteStore, StorageError};
pub use sync::{
    ConnectionStatus, DeviceState, EngineEvent, EngineHandle, EventReplica, SyncEngine,
    SyncError, SyncTimings,
};
