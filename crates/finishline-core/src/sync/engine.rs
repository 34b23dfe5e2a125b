//! Sync engine
//!
//! Owns this device's replica and register, the relay connection, and the
//! background timers. Inbound invocations are read by one task per relay
//! link and dispatched here; local intents live in the gateway module.
//!
//! ## Timers
//!
//! - every `liveness_check`: make sure the connection is alive, pinging the
//!   group when it has been quiet for longer than `ping_after`
//! - every `digest_interval`: broadcast a digest of the register while
//!   connected and holding at least one assignment
//!
//! Follow-up work triggered by peers (answering a new device, re-sending
//! history, pulling after a digest) runs after a random delay so a group of
//! devices does not answer in lockstep.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::connection::{Backoff, ConnectionManager, ConnectionStatus, Ensured};
use super::error::SyncResult;
use super::message::ProtocolMessage;
use super::reconciler::{Digest, Jitter};
use super::register::AssignmentRegister;
use super::replica::{EventReplica, TokenUsedOutcome};
use crate::identity::SessionIdentity;
use crate::models::{EntryMethod, WireAssignment};
use crate::relay::{Invocation, Relay};
use crate::storage::{DurableStore, LocalSnapshot};

/// Intervals, delays and limits used by the engine
#[derive(Debug, Clone)]
pub struct SyncTimings {
    /// How often the connection is checked
    pub liveness_check: Duration,
    /// A link with nothing received for longer than this is dead
    pub liveness_window: Duration,
    /// Quiet time after which a ping is sent
    pub ping_after: Duration,
    /// How often the digest is broadcast
    pub digest_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Connect attempts per liveness check
    pub connect_attempts: u32,
    /// Delay between (re)joining a group and pulling history
    pub pull_after_connect: Duration,
    /// Event detail changes closer together than this are sent once
    pub details_debounce: Duration,
    /// Delay before answering a device that joined
    pub announce_jitter: Jitter,
    /// Delay before re-sending history on request
    pub history_jitter: Jitter,
    /// Delay before pulling history after a mismatching digest
    pub digest_jitter: Jitter,
    /// Number of recent local assignments broadcast after a save
    pub recent_broadcast: usize,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            liveness_check: Duration::from_secs(2),
            liveness_window: Duration::from_secs(15),
            ping_after: Duration::from_secs(10),
            digest_interval: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            connect_attempts: 5,
            pull_after_connect: Duration::from_secs(1),
            details_debounce: Duration::from_millis(500),
            announce_jitter: Jitter::between(Duration::from_millis(100), Duration::from_millis(500)),
            history_jitter: Jitter::between(Duration::from_millis(100), Duration::from_millis(600)),
            digest_jitter: Jitter::between(Duration::from_millis(500), Duration::from_millis(1500)),
            recent_broadcast: 5,
        }
    }
}

/// Everything this device knows about the event it works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub replica: EventReplica,
    pub register: AssignmentRegister,
    /// Entry method the operator used last
    pub preferred_method: EntryMethod,
}

impl DeviceState {
    /// State for an event this device has not seen before
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            replica: EventReplica::new(event_id),
            register: AssignmentRegister::new(),
            preferred_method: EntryMethod::Manual,
        }
    }

    pub fn from_snapshot(snapshot: LocalSnapshot) -> Self {
        Self {
            replica: EventReplica {
                event_id: snapshot.event_id,
                name: snapshot.event_name,
                next_token: snapshot.next_token,
                current_token: snapshot.current_token,
            },
            register: AssignmentRegister::from_assignments(snapshot.assignments),
            preferred_method: snapshot.preferred_method,
        }
    }

    pub fn to_snapshot(&self) -> LocalSnapshot {
        LocalSnapshot {
            event_id: self.replica.event_id.clone(),
            event_name: self.replica.name.clone(),
            next_token: self.replica.next_token,
            current_token: self.replica.current_token,
            assignments: self.register.to_vec(),
            preferred_method: self.preferred_method,
            saved_at: 0,
        }
    }
}

/// Changes published by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Event name, next token or held token changed
    ReplicaChanged(EventReplica),
    /// Assignments for these tokens were added, replaced or removed
    AssignmentsChanged { tokens: Vec<u32> },
    /// A peer claimed the token this device holds
    TokenConflict { token: u32, rival: String, won: bool },
    /// A peer restarted the token sequence
    EventReset { origin_id: String },
    /// Another device joined the event
    PeerJoined { origin_id: String },
    /// A history pull finished
    HistoryMerged { received: usize, changed: usize },
    /// A history store write failed; the local change was kept
    StoreFailed { operation: String, message: String },
}

/// Handle to the engine's background task
///
/// Dropping the handle stops the task as well.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop the background task and close the relay connection
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Sync engine task failed: {}", e);
        }
    }
}

pub(super) struct Inner {
    pub(super) session: SessionIdentity,
    pub(super) timings: SyncTimings,
    pub(super) state: Mutex<DeviceState>,
    pub(super) connection: ConnectionManager,
    pub(super) store: Arc<dyn DurableStore>,
    events: mpsc::UnboundedSender<EngineEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    /// Event detail broadcasts requested so far
    details_requested: AtomicU64,
    /// Last request that was actually sent
    details_sent: AtomicU64,
}

/// The sync engine; clones share the same state
#[derive(Clone)]
pub struct SyncEngine {
    pub(super) inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        session: SessionIdentity,
        relay: Arc<dyn Relay>,
        store: Arc<dyn DurableStore>,
        timings: SyncTimings,
        state: DeviceState,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            relay,
            Backoff::new(timings.reconnect_initial, timings.reconnect_max),
            timings.liveness_window,
            timings.connect_attempts,
        );

        Self {
            inner: Arc::new(Inner {
                session,
                timings,
                state: Mutex::new(state),
                connection,
                store,
                events,
                event_rx: StdMutex::new(Some(event_rx)),
                details_requested: AtomicU64::new(0),
                details_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn session(&self) -> &SessionIdentity {
        &self.inner.session
    }

    /// Origin id stamped on everything this device sends
    pub fn origin_id(&self) -> &str {
        &self.inner.session.session_id
    }

    pub fn timings(&self) -> &SyncTimings {
        &self.inner.timings
    }

    /// Take the receiving end of the event stream; only the first call gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Watch the connection status
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection.connection_id()
    }

    pub async fn event_id(&self) -> String {
        self.inner.state.lock().await.replica.event_id.clone()
    }

    pub async fn replica(&self) -> EventReplica {
        self.inner.state.lock().await.replica.clone()
    }

    /// Copy of the full device state
    pub async fn state(&self) -> DeviceState {
        self.inner.state.lock().await.clone()
    }

    /// Current state in its saved form
    pub async fn snapshot(&self) -> LocalSnapshot {
        self.inner.state.lock().await.to_snapshot()
    }

    pub(super) fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Start the liveness and digest timers
    pub fn start(&self) -> EngineHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = self.clone();

        let task = tokio::spawn(async move {
            let timings = engine.inner.timings.clone();
            let mut liveness = tokio::time::interval(timings.liveness_check);
            liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut digest = tokio::time::interval_at(
                Instant::now() + timings.digest_interval,
                timings.digest_interval,
            );
            digest.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = liveness.tick() => {
                        // Reconnecting can take a while; stay responsive to shutdown
                        tokio::select! {
                            _ = engine.check_liveness() => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    _ = digest.tick() => engine.send_digest().await,
                }
            }

            engine.inner.connection.disconnect();
            debug!("Sync engine stopped");
        });

        EngineHandle { shutdown, task }
    }

    /// Make sure the device is connected and joined to its event's group
    ///
    /// On a new connection or a group change the device announces itself,
    /// records that it was seen, and pulls history shortly after.
    pub async fn ensure_connected(&self) -> bool {
        let event_id = self.event_id().await;

        match self.inner.connection.ensure(&event_id).await {
            Ensured::Alive => true,
            Ensured::Failed => false,
            Ensured::Rejoined => {
                self.after_join(&event_id).await;
                true
            }
            Ensured::Connected {
                generation,
                invocations,
            } => {
                self.spawn_reader(generation, invocations);
                self.after_join(&event_id).await;
                true
            }
        }
    }

    /// Keep calling [`Self::ensure_connected`] until it succeeds or `timeout`
    /// passes
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let attempt = async {
            while !self.ensure_connected().await {
                tokio::time::sleep(self.inner.timings.liveness_check).await;
            }
        };
        tokio::time::timeout(timeout, attempt).await.is_ok()
    }

    async fn after_join(&self, event_id: &str) {
        self.broadcast(&ProtocolMessage::DeviceAddedToEvent {
            origin_id: self.origin_id().to_string(),
            event_id: event_id.to_string(),
        });

        if let Err(e) = self
            .inner
            .store
            .touch_device_last_seen(event_id, &self.inner.session.device_id)
            .await
        {
            debug!("Failed to update last seen for event {}: {}", event_id, e);
        }

        self.spawn_after(self.inner.timings.pull_after_connect, |engine| async move {
            engine.recover_history("connect").await;
        });
    }

    /// Ask peers to rebroadcast what they hold, then pull from the history
    /// store. The history store may be local to this device, so peers are
    /// the only way back to broadcasts missed while away.
    async fn recover_history(&self, after: &str) {
        let event_id = self.event_id().await;
        self.broadcast(&ProtocolMessage::RequestFullHistory {
            origin_id: self.origin_id().to_string(),
            event_id,
        });
        if let Err(e) = self.pull_history().await {
            warn!("History pull after {} failed: {}", after, e);
        }
    }

    fn spawn_reader(&self, generation: u64, mut invocations: mpsc::UnboundedReceiver<Invocation>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(invocation) = invocations.recv().await {
                engine.inner.connection.record_message(generation);
                match ProtocolMessage::from_invocation(&invocation) {
                    Ok(message) => engine.dispatch(message).await,
                    Err(e) => warn!("Ignoring relay invocation: {}", e),
                }
            }
            engine.inner.connection.drop_link(generation);
        });
    }

    /// Run `f` on a clone of the engine after `delay`
    pub(super) fn spawn_after<F, Fut>(&self, delay: Duration, f: F)
    where
        F: FnOnce(SyncEngine) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(engine).await;
        });
    }

    /// Send a message over the current link; failures are logged, not fatal
    pub(super) fn broadcast(&self, message: &ProtocolMessage) -> bool {
        match self.inner.connection.broadcast(message.event_id(), message) {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not broadcast {}: {}", message.name(), e);
                false
            }
        }
    }

    /// Apply an inbound message
    async fn dispatch(&self, message: ProtocolMessage) {
        let local = self.origin_id().to_string();

        {
            let state = self.inner.state.lock().await;
            if message.event_id() != state.replica.event_id {
                debug!(
                    "Ignoring {} for event {}, this device is in {}",
                    message.name(),
                    message.event_id(),
                    state.replica.event_id
                );
                return;
            }
        }

        // Our own broadcasts come back; they only count as liveness
        if message.origin_id() == local {
            trace!("Own {} echoed back", message.name());
            return;
        }

        match message {
            ProtocolMessage::TokenUsed {
                origin_id, token, ..
            } => {
                let (outcome, changed) = {
                    let mut state = self.inner.state.lock().await;
                    let before = state.replica.clone();
                    let outcome = state.replica.apply_token_used(&local, &origin_id, token);
                    let changed = (state.replica != before).then(|| state.replica.clone());
                    (outcome, changed)
                };
                debug!("Received tokenUsed {} from {}", token, origin_id);

                match outcome {
                    TokenUsedOutcome::ConflictWon | TokenUsedOutcome::ConflictLost => {
                        self.emit(EngineEvent::TokenConflict {
                            token,
                            rival: origin_id,
                            won: outcome == TokenUsedOutcome::ConflictWon,
                        });
                    }
                    TokenUsedOutcome::Applied | TokenUsedOutcome::Ignored => {}
                }
                if let Some(replica) = changed {
                    self.emit(EngineEvent::ReplicaChanged(replica));
                }
            }

            ProtocolMessage::ResetEvent { origin_id, .. } => {
                let replica = {
                    let mut state = self.inner.state.lock().await;
                    state.replica.apply_reset(&local, &origin_id);
                    state.replica.clone()
                };
                info!("Event reset by {}", origin_id);
                self.emit(EngineEvent::EventReset { origin_id });
                self.emit(EngineEvent::ReplicaChanged(replica));
            }

            ProtocolMessage::SetEventDetails {
                origin_id,
                name,
                next_token,
                ..
            } => {
                let (outcome, replica) = {
                    let mut state = self.inner.state.lock().await;
                    let outcome =
                        state
                            .replica
                            .apply_event_details(&local, &origin_id, &name, next_token);
                    (outcome, state.replica.clone())
                };
                debug!(
                    "Received setEventDetails from {}: {:?} {:?}",
                    origin_id, name, next_token
                );
                if outcome.renamed || outcome.next_token_adopted {
                    self.emit(EngineEvent::ReplicaChanged(replica));
                }
            }

            ProtocolMessage::PingEvent { origin_id, .. } => {
                trace!("Ping from {}", origin_id);
            }

            ProtocolMessage::TokenAssignments {
                origin_id,
                assignments,
                ..
            } => {
                let records: Vec<_> = assignments
                    .into_iter()
                    .filter_map(|record| match record.into_assignment() {
                        Ok(assignment) => Some(assignment),
                        Err(e) => {
                            warn!("Dropping assignment from {}: {}", origin_id, e);
                            None
                        }
                    })
                    .collect();

                let outcome = self.inner.state.lock().await.register.merge(records);
                if outcome.changed() {
                    debug!(
                        "Merged assignments from {}: {:?}",
                        origin_id,
                        outcome.tokens()
                    );
                    self.emit(EngineEvent::AssignmentsChanged {
                        tokens: outcome.tokens(),
                    });
                }
            }

            ProtocolMessage::SyncDigest {
                origin_id,
                count,
                tokens,
                ..
            } => {
                let peer = Digest { count, tokens };
                let needs_sync = self.inner.state.lock().await.register.needs_sync(&peer);
                if needs_sync {
                    info!(
                        "Out of sync with {} ({} tokens), requesting history",
                        origin_id, peer.count
                    );
                    let delay = self.inner.timings.digest_jitter.sample();
                    self.spawn_after(delay, |engine| async move {
                        engine.recover_history("digest").await;
                    });
                }
            }

            ProtocolMessage::DeviceAddedToEvent { origin_id, .. } => {
                info!("Device {} joined the event", origin_id);
                self.emit(EngineEvent::PeerJoined { origin_id });

                let delay = self.inner.timings.announce_jitter.sample();
                self.spawn_after(delay, |engine| async move {
                    let worth_sharing = engine
                        .inner
                        .state
                        .lock()
                        .await
                        .replica
                        .has_non_default_state();
                    if worth_sharing {
                        engine.send_event_details_now().await;
                    }
                });
            }

            ProtocolMessage::RequestFullHistory { origin_id, .. } => {
                debug!("History requested by {}", origin_id);
                let delay = self.inner.timings.history_jitter.sample();
                self.spawn_after(delay, |engine| async move {
                    engine.broadcast_all_assignments().await;
                });
            }
        }
    }

    /// Pull every assignment of the current event from the history store and
    /// merge it; returns the number of tokens that changed
    pub async fn pull_history(&self) -> SyncResult<usize> {
        let event_id = self.event_id().await;

        let records = match self.inner.store.get_assignments(&event_id).await {
            Ok(records) => records,
            Err(e) => {
                self.emit(EngineEvent::StoreFailed {
                    operation: "get history".to_string(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let received = records.len();

        let outcome = {
            let mut state = self.inner.state.lock().await;
            // The device moved on while the pull was in flight
            if state.replica.event_id != event_id {
                return Ok(0);
            }
            state.register.merge(records)
        };

        info!(
            "Retrieved full history: {} assignments, {} changed",
            received,
            outcome.tokens().len()
        );
        if outcome.changed() {
            self.emit(EngineEvent::AssignmentsChanged {
                tokens: outcome.tokens(),
            });
        }
        self.emit(EngineEvent::HistoryMerged {
            received,
            changed: outcome.tokens().len(),
        });

        Ok(outcome.tokens().len())
    }

    async fn broadcast_all_assignments(&self) {
        let (event_id, records) = {
            let state = self.inner.state.lock().await;
            (state.replica.event_id.clone(), state.register.to_vec())
        };
        if records.is_empty() {
            return;
        }

        let device_id = &self.inner.session.device_id;
        self.broadcast(&ProtocolMessage::TokenAssignments {
            origin_id: self.origin_id().to_string(),
            event_id,
            assignments: records
                .iter()
                .map(|a| WireAssignment::from_assignment(a, device_id))
                .collect(),
        });
    }

    async fn check_liveness(&self) {
        if !self.ensure_connected().await {
            return;
        }

        let quiet = self
            .inner
            .connection
            .since_last_message()
            .is_some_and(|d| d > self.inner.timings.ping_after);
        if quiet {
            let event_id = self.event_id().await;
            self.broadcast(&ProtocolMessage::PingEvent {
                origin_id: self.origin_id().to_string(),
                event_id,
            });
        }
    }

    async fn send_digest(&self) {
        let (event_id, digest) = {
            let state = self.inner.state.lock().await;
            (state.replica.event_id.clone(), state.register.digest())
        };
        if digest.count == 0 || !self.inner.connection.is_alive(&event_id) {
            return;
        }

        self.broadcast(&ProtocolMessage::SyncDigest {
            origin_id: self.origin_id().to_string(),
            event_id,
            count: digest.count,
            tokens: digest.tokens,
        });
    }

    /// Broadcast the event's name and next token
    pub(super) async fn send_event_details_now(&self) {
        let replica = self.replica().await;
        self.broadcast(&ProtocolMessage::SetEventDetails {
            origin_id: self.origin_id().to_string(),
            event_id: replica.event_id,
            name: replica.name,
            next_token: Some(i64::from(replica.next_token)),
        });
    }

    /// Broadcast the event details once changes stop for `details_debounce`
    pub(super) fn schedule_event_details(&self) {
        let request = self.inner.details_requested.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_after(self.inner.timings.details_debounce, move |engine| async move {
            let inner = &engine.inner;
            let latest = inner.details_requested.load(Ordering::SeqCst) == request;
            if latest && inner.details_sent.fetch_max(request, Ordering::SeqCst) < request {
                engine.send_event_details_now().await;
            }
        });
    }

    /// Send pending event details right away instead of waiting
    pub async fn flush_event_details(&self) {
        let request = self.inner.details_requested.load(Ordering::SeqCst);
        if self.inner.details_sent.fetch_max(request, Ordering::SeqCst) < request {
            self.send_event_details_now().await;
        }
    }

    /// Drop pending event detail broadcasts
    pub(super) fn cancel_event_details(&self) {
        let request = self.inner.details_requested.load(Ordering::SeqCst);
        self.inner.details_sent.fetch_max(request, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn engine(relay: &MemoryRelay, store: &MemoryStore, origin: &str, state: DeviceState) -> SyncEngine {
        SyncEngine::new(
            SessionIdentity::with_session_id(format!("device-{}", origin), origin),
            Arc::new(relay.clone()),
            Arc::new(store.clone()),
            SyncTimings::default(),
            state,
        )
    }

    /// Connect a bare relay link to `group` to play a remote peer
    async fn peer_link(relay: &MemoryRelay, group: &str) -> crate::relay::RelayLink {
        let link = relay.connect().await.unwrap();
        link.commands
            .send(crate::relay::RelayCommand::JoinGroup {
                group: group.to_string(),
            })
            .unwrap();
        link
    }

    fn send(link: &crate::relay::RelayLink, group: &str, message: ProtocolMessage) {
        link.commands
            .send(crate::relay::RelayCommand::Broadcast {
                group: group.to_string(),
                invocation: message.to_invocation(),
            })
            .unwrap();
    }

    #[test]
    fn test_default_timings() {
        let timings = SyncTimings::default();
        assert_eq!(timings.liveness_check, Duration::from_secs(2));
        assert_eq!(timings.liveness_window, Duration::from_secs(15));
        assert_eq!(timings.ping_after, Duration::from_secs(10));
        assert_eq!(timings.digest_interval, Duration::from_secs(30));
        assert_eq!(timings.reconnect_max, Duration::from_secs(10));
        assert_eq!(timings.recent_broadcast, 5);
    }

    #[test]
    fn test_state_snapshot_round_trip_keeps_local_flags() {
        let mut state = DeviceState::new("evt");
        state.replica.next_token = 4;
        state.register.save_local(3, "A3", "", EntryMethod::Scan, "me");
        state.preferred_method = EntryMethod::Scan;

        let restored = DeviceState::from_snapshot(state.to_snapshot());
        assert_eq!(restored, state);
        assert!(restored.register.get(3).unwrap().is_local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_announces_and_touches_store() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));

        assert!(engine.ensure_connected().await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.status(), ConnectionStatus::Connected);
        assert_eq!(relay.broadcasts("evt", "deviceAddedToEvent").len(), 1);
        let devices = store.devices("evt").await.unwrap();
        assert_eq!(devices[0].device_id, "device-me");
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_event_and_self_echo_are_ignored() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        engine.ensure_connected().await;

        let peer = peer_link(&relay, "evt").await;
        send(
            &peer,
            "evt",
            ProtocolMessage::TokenUsed {
                origin_id: "peer".into(),
                event_id: "other".into(),
                token: 30,
            },
        );
        send(
            &peer,
            "evt",
            ProtocolMessage::TokenUsed {
                origin_id: "me".into(),
                event_id: "evt".into(),
                token: 40,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.replica().await.next_token, 1);

        send(
            &peer,
            "evt",
            ProtocolMessage::TokenUsed {
                origin_id: "peer".into(),
                event_id: "evt".into(),
                token: 5,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.replica().await.next_token, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_invocations_still_count_as_liveness() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        engine.ensure_connected().await;
        let peer = peer_link(&relay, "evt").await;

        tokio::time::advance(Duration::from_secs(12)).await;
        peer.commands
            .send(crate::relay::RelayCommand::Broadcast {
                group: "evt".to_string(),
                invocation: Invocation::new("mystery", vec![json!(1)]),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::advance(Duration::from_secs(12)).await;
        assert!(engine.inner.connection.is_alive("evt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_device_gets_details_only_when_non_default() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        engine.ensure_connected().await;
        let peer = peer_link(&relay, "evt").await;

        let joined = ProtocolMessage::DeviceAddedToEvent {
            origin_id: "peer".into(),
            event_id: "evt".into(),
        };
        send(&peer, "evt", joined.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(relay.broadcasts("evt", "setEventDetails").is_empty());

        engine.inner.state.lock().await.replica.next_token = 12;
        send(&peer, "evt", joined);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = relay.broadcasts("evt", "setEventDetails");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].arguments[3], json!(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_request_is_answered_with_everything() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let mut state = DeviceState::new("evt");
        for token in 1..=8 {
            state.register.save_local(token, "", "", EntryMethod::Qr, "me");
        }
        let engine = engine(&relay, &store, "me", state);
        engine.ensure_connected().await;
        let peer = peer_link(&relay, "evt").await;

        send(
            &peer,
            "evt",
            ProtocolMessage::RequestFullHistory {
                origin_id: "peer".into(),
                event_id: "evt".into(),
            },
        );
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = relay.broadcasts("evt", "tokenAssignments");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].arguments[2].as_array().unwrap().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_asks_peers_for_history() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        engine.ensure_connected().await;
        assert!(relay.broadcasts("evt", "requestFullHistory").is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let sent = relay.broadcasts("evt", "requestFullHistory");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].arguments[0], json!("me"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_digest_mismatch_asks_peers_for_history() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let timings = SyncTimings {
            pull_after_connect: Duration::from_secs(3600),
            ..SyncTimings::default()
        };
        let engine = SyncEngine::new(
            SessionIdentity::with_session_id("device-me", "me"),
            Arc::new(relay.clone()),
            Arc::new(store.clone()),
            timings,
            DeviceState::new("evt"),
        );
        engine.ensure_connected().await;
        let peer = peer_link(&relay, "evt").await;

        send(
            &peer,
            "evt",
            ProtocolMessage::SyncDigest {
                origin_id: "peer".into(),
                event_id: "evt".into(),
                count: 2,
                tokens: vec![1, 2],
            },
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(relay.broadcasts("evt", "requestFullHistory").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_used_is_not_a_replica_change() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let mut state = DeviceState::new("evt");
        state.replica.next_token = 10;
        let engine = engine(&relay, &store, "me", state);
        let mut events = engine.take_events().unwrap();
        engine.ensure_connected().await;
        let peer = peer_link(&relay, "evt").await;

        let used = |token| ProtocolMessage::TokenUsed {
            origin_id: "peer".into(),
            event_id: "evt".into(),
            token,
        };
        send(&peer, "evt", used(3));
        send(&peer, "evt", used(12));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ReplicaChanged(replica) = event {
                changes.push(replica.next_token);
            }
        }
        assert_eq!(changes, vec![13]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_history_after_event_switch_is_dropped() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));

        let mut state = engine.inner.state.lock().await;
        state.replica.event_id = "other".into();
        drop(state);

        assert_eq!(engine.pull_history().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_pings_when_quiet() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        let handle = engine.start();

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(!relay.broadcasts("evt", "pingEvent").is_empty());
        assert_eq!(relay.connection_count(), 1);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_relay_drops() {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let engine = engine(&relay, &store, "me", DeviceState::new("evt"));
        let handle = engine.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.status(), ConnectionStatus::Connected);

        relay.disconnect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.status(), ConnectionStatus::Connected);
        assert_eq!(relay.broadcasts("evt", "deviceAddedToEvent").len(), 2);

        handle.shutdown().await;
    }
}
