//! Engine wiring for a single CLI invocation
//!
//! A session loads the current event from its snapshot, opens the history
//! store, and builds the sync engine. Commands that talk to peers call
//! [`Session::connect`]; if the relay cannot be reached the session falls back
//! to working offline so the operator is never blocked.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use finishline_core::models::new_event_id;
use finishline_core::relay::Relay;
use finishline_core::{
    Config, DeviceState, EngineHandle, Identity, OfflineRelay, SessionIdentity, SnapshotStore,
    SqliteStore, StorageError, SyncEngine, SyncTimings, WebSocketRelay,
};

use crate::output::Output;

/// How long networked commands wait for the relay
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to queued broadcasts before the connection is closed
const DRAIN_GRACE: Duration = Duration::from_millis(300);

pub struct Session {
    pub config: Config,
    pub engine: SyncEngine,
    identity: SessionIdentity,
    snapshots: SnapshotStore,
    handle: Option<EngineHandle>,
}

impl Session {
    /// Open the current event without connecting
    pub fn open(config: Config) -> Result<Self> {
        let identity = Identity::with_config(config.clone());
        if !identity.is_initialized() {
            bail!("Not initialized. Run `finishline init` first.");
        }
        let identity = identity.session().context("Failed to load device identity")?;
        let snapshots = SnapshotStore::new(config.snapshot_dir());
        let state = load_current_state(&snapshots)?;

        let engine = offline_engine(&config, &identity, state)?;
        Ok(Self {
            config,
            engine,
            identity,
            snapshots,
            handle: None,
        })
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Connect to the configured relay and start the background timers
    ///
    /// Returns whether the device is online. Without a relay URL, or when the
    /// relay cannot be reached in time, the session keeps working offline.
    pub async fn connect(&mut self, output: &Output) -> Result<bool> {
        let Some(url) = self.config.relay_url.clone() else {
            output.warn("No relay configured, working offline");
            return Ok(false);
        };

        let state = self.engine.state().await;
        let online = build_engine(
            &self.config,
            &self.identity,
            Arc::new(WebSocketRelay::new(url.clone())),
            state.clone(),
        )?;
        let handle = online.start();

        if online.wait_connected(CONNECT_TIMEOUT).await {
            info!("Connected to relay {}", url);
            self.engine = online;
            self.handle = Some(handle);
            return Ok(true);
        }

        handle.shutdown().await;
        warn!("Relay {} unreachable", url);
        output.warn(&format!("Relay {} unreachable, working offline", url));
        self.engine = offline_engine(&self.config, &self.identity, state)?;
        Ok(false)
    }

    /// Persist the current state and make its event the current one
    pub async fn save(&self) -> Result<()> {
        let mut snapshot = self.engine.snapshot().await;
        self.snapshots
            .save(&mut snapshot)
            .context("Failed to save event snapshot")?;
        self.snapshots
            .set_current_event(&snapshot.event_id)
            .context("Failed to record current event")?;
        Ok(())
    }

    /// Send anything pending, save, and disconnect
    pub async fn close(mut self) -> Result<()> {
        self.engine.flush_event_details().await;
        self.save().await?;

        if let Some(handle) = self.handle.take() {
            tokio::time::sleep(DRAIN_GRACE).await;
            handle.shutdown().await;
        }
        Ok(())
    }
}

/// Engine that never connects and reports itself disconnected
fn offline_engine(
    config: &Config,
    identity: &SessionIdentity,
    state: DeviceState,
) -> Result<SyncEngine> {
    build_engine(config, identity, Arc::new(OfflineRelay), state)
}

fn build_engine(
    config: &Config,
    identity: &SessionIdentity,
    relay: Arc<dyn Relay>,
    state: DeviceState,
) -> Result<SyncEngine> {
    let store_path = config.history_store_path();
    let store = SqliteStore::open(&store_path)
        .with_context(|| format!("Failed to open history store {:?}", store_path))?;

    Ok(SyncEngine::new(
        identity.clone(),
        relay,
        Arc::new(store),
        SyncTimings::default(),
        state,
    ))
}

/// State of the event the device last worked on, or a fresh event
pub fn load_current_state(snapshots: &SnapshotStore) -> Result<DeviceState> {
    let event_id = match snapshots
        .current_event()
        .context("Failed to read current event")?
    {
        Some(id) => id,
        None => return Ok(DeviceState::new(new_event_id())),
    };
    load_state(snapshots, &event_id)
}

/// Saved state of an event, or a fresh state when there is none
pub fn load_state(snapshots: &SnapshotStore, event_id: &str) -> Result<DeviceState> {
    match snapshots.load(event_id) {
        Ok(Some(snapshot)) => Ok(DeviceState::from_snapshot(snapshot)),
        Ok(None) => Ok(DeviceState::new(event_id)),
        Err(e @ StorageError::CorruptSnapshot { .. }) => {
            warn!("Starting event {} from scratch: {}", event_id, e);
            Ok(DeviceState::new(event_id))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load event {}", event_id)),
    }
}
