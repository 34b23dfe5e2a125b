//! Connection manager
//!
//! Owns this device's single relay connection. A connection counts as alive
//! only while the link is open, it has joined the current event's group, and
//! something arrived on it within the liveness window.
//!
//! Connect attempts are serialized behind one async lock that also holds the
//! backoff state: callers that arrive during an attempt wait for it and then
//! find the link alive instead of opening a second one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{SyncError, SyncResult};
use super::message::ProtocolMessage;
use crate::relay::{Invocation, Relay, RelayCommand, RelayError};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected; the next liveness check will try again
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and joined to the event's group
    Connected,
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Result of [`ConnectionManager::ensure`]
#[derive(Debug)]
pub enum Ensured {
    /// The existing link is alive
    Alive,
    /// The open link moved to the requested group
    Rejoined,
    /// A new link was opened; its invocations must be read by the caller
    Connected {
        generation: u64,
        invocations: mpsc::UnboundedReceiver<Invocation>,
    },
    /// Every attempt failed; the caller should try again later
    Failed,
}

struct ActiveLink {
    generation: u64,
    connection_id: String,
    group: String,
    commands: mpsc::UnboundedSender<RelayCommand>,
    last_message: Instant,
}

impl ActiveLink {
    fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Manages the relay connection
pub struct ConnectionManager {
    relay: Arc<dyn Relay>,
    link: StdMutex<Option<ActiveLink>>,
    next_generation: AtomicU64,
    connect_lock: Mutex<Backoff>,
    status: watch::Sender<ConnectionStatus>,
    liveness_window: Duration,
    max_attempts: u32,
}

impl ConnectionManager {
    pub fn new(
        relay: Arc<dyn Relay>,
        backoff: Backoff,
        liveness_window: Duration,
        max_attempts: u32,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            relay,
            link: StdMutex::new(None),
            next_generation: AtomicU64::new(0),
            connect_lock: Mutex::new(backoff),
            status,
            liveness_window,
            max_attempts: max_attempts.max(1),
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Watch the connection status
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Relay-assigned id of the open link
    pub fn connection_id(&self) -> Option<String> {
        self.link().as_ref().map(|l| l.connection_id.clone())
    }

    /// Whether the link is open, joined to `event_id`, and recently heard from
    pub fn is_alive(&self, event_id: &str) -> bool {
        self.link().as_ref().is_some_and(|l| {
            l.is_open() && l.group == event_id && l.last_message.elapsed() <= self.liveness_window
        })
    }

    /// Time since anything arrived on the open link
    pub fn since_last_message(&self) -> Option<Duration> {
        self.link().as_ref().map(|l| l.last_message.elapsed())
    }

    /// Note that something arrived on link `generation`
    pub fn record_message(&self, generation: u64) {
        if let Some(link) = self.link().as_mut() {
            if link.generation == generation {
                link.last_message = Instant::now();
            }
        }
    }

    /// Forget link `generation` after its connection closed
    ///
    /// A newer link is left alone.
    pub fn drop_link(&self, generation: u64) {
        let mut guard = self.link();
        if guard.as_ref().is_some_and(|l| l.generation == generation) {
            *guard = None;
            drop(guard);
            info!("Relay connection closed");
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Close the link
    pub fn disconnect(&self) {
        if self.link().take().is_some() {
            debug!("Relay link dropped");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Broadcast a message to `event_id`'s group over the open link
    pub fn broadcast(&self, event_id: &str, message: &ProtocolMessage) -> SyncResult<()> {
        let guard = self.link();
        let link = guard
            .as_ref()
            .filter(|l| l.is_open())
            .ok_or(SyncError::NotConnected)?;

        link.commands
            .send(RelayCommand::Broadcast {
                group: event_id.to_string(),
                invocation: message.to_invocation(),
            })
            .map_err(|_| SyncError::NotConnected)?;

        debug!("Broadcast {} to {}", message.name(), event_id);
        Ok(())
    }

    /// Make sure there is a live link joined to `event_id`
    ///
    /// Retries with backoff up to the attempt limit. The backoff carries over
    /// between calls until a connection succeeds.
    pub async fn ensure(&self, event_id: &str) -> Ensured {
        let mut backoff = self.connect_lock.lock().await;

        if self.is_alive(event_id) {
            return Ensured::Alive;
        }

        if self.switch_group(event_id) {
            return Ensured::Rejoined;
        }

        // Stale or closed: start over
        self.link().take();
        self.set_status(ConnectionStatus::Connecting);

        for attempt in 1..=self.max_attempts {
            match self.relay.connect().await {
                Ok(link) => {
                    backoff.reset();
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

                    if link
                        .commands
                        .send(RelayCommand::JoinGroup {
                            group: event_id.to_string(),
                        })
                        .is_err()
                    {
                        warn!("Relay link closed before joining {}", event_id);
                        continue;
                    }

                    info!(
                        connection_id = %link.connection_id,
                        "Connected to relay and joined event {}", event_id
                    );
                    *self.link() = Some(ActiveLink {
                        generation,
                        connection_id: link.connection_id,
                        group: event_id.to_string(),
                        commands: link.commands,
                        last_message: Instant::now(),
                    });
                    self.set_status(ConnectionStatus::Connected);

                    return Ensured::Connected {
                        generation,
                        invocations: link.invocations,
                    };
                }
                Err(RelayError::Offline) => {
                    debug!("No relay, staying offline");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        "Relay connection failed: {}. Retrying in {:?}", e, delay
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        Ensured::Failed
    }

    /// Move an open, recently active link to another group
    fn switch_group(&self, event_id: &str) -> bool {
        let mut guard = self.link();
        let Some(link) = guard.as_mut() else {
            return false;
        };
        if !link.is_open()
            || link.group == event_id
            || link.last_message.elapsed() > self.liveness_window
        {
            return false;
        }

        let leave = RelayCommand::LeaveGroup {
            group: link.group.clone(),
        };
        let join = RelayCommand::JoinGroup {
            group: event_id.to_string(),
        };
        if link.commands.send(leave).is_err() || link.commands.send(join).is_err() {
            return false;
        }

        info!("Switched relay group from {} to {}", link.group, event_id);
        link.group = event_id.to_string();
        link.last_message = Instant::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    fn manager(relay: &MemoryRelay) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(relay.clone()),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
            Duration::from_secs(15),
            3,
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connects_and_joins() {
        let relay = MemoryRelay::new();
        let manager = manager(&relay);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        assert!(matches!(manager.ensure("evt").await, Ensured::Connected { .. }));
        settle().await;
        assert_eq!(relay.group_size("evt"), 1);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert!(manager.is_alive("evt"));

        assert!(matches!(manager.ensure("evt").await, Ensured::Alive));
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_opens_one_connection() {
        let relay = MemoryRelay::new();
        let manager = Arc::new(manager(&relay));

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure("evt").await })
            })
            .collect();

        let mut connected = 0;
        for call in calls {
            if matches!(call.await.unwrap(), Ensured::Connected { .. }) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expires_without_messages() {
        let relay = MemoryRelay::new();
        let manager = manager(&relay);
        let Ensured::Connected { generation, .. } = manager.ensure("evt").await else {
            panic!("expected a new connection");
        };

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager.is_alive("evt"));
        manager.record_message(generation);

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(manager.is_alive("evt"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!manager.is_alive("evt"));

        // A stale link is replaced
        assert!(matches!(manager.ensure("evt").await, Ensured::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_does_not_drop_new_link() {
        let relay = MemoryRelay::new();
        let manager = manager(&relay);
        let Ensured::Connected { generation: old, .. } = manager.ensure("evt").await else {
            panic!("expected a new connection");
        };

        manager.disconnect();
        let Ensured::Connected { generation: new, .. } = manager.ensure("evt").await else {
            panic!("expected a new connection");
        };
        assert_ne!(old, new);

        manager.drop_link(old);
        assert!(manager.is_alive("evt"));

        manager.drop_link(new);
        assert!(!manager.is_alive("evt"));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_group_on_open_link() {
        let relay = MemoryRelay::new();
        let manager = manager(&relay);
        manager.ensure("first").await;

        assert!(matches!(manager.ensure("second").await, Ensured::Rejoined));
        settle().await;
        assert_eq!(relay.connection_count(), 1);
        assert_eq!(relay.group_size("first"), 0);
        assert_eq!(relay.group_size("second"), 1);
        assert!(manager.is_alive("second"));
        assert!(!manager.is_alive("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_relay_fails_after_retries() {
        let relay = MemoryRelay::new();
        relay.set_available(false);
        let manager = manager(&relay);

        let started = Instant::now();
        assert!(matches!(manager.ensure("evt").await, Ensured::Failed));
        // Slept 1s and 2s between the three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        relay.set_available(true);
        assert!(matches!(manager.ensure("evt").await, Ensured::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_relay_fails_at_once_and_stays_disconnected() {
        let manager = ConnectionManager::new(
            Arc::new(crate::relay::OfflineRelay),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
            Duration::from_secs(15),
            3,
        );

        let started = Instant::now();
        assert!(matches!(manager.ensure("evt").await, Ensured::Failed));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.connection_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_requires_link() {
        let relay = MemoryRelay::new();
        let manager = manager(&relay);
        let ping = ProtocolMessage::PingEvent {
            origin_id: "me".to_string(),
            event_id: "evt".to_string(),
        };

        assert!(matches!(
            manager.broadcast("evt", &ping),
            Err(SyncError::NotConnected)
        ));

        manager.ensure("evt").await;
        manager.broadcast("evt", &ping).unwrap();
        settle().await;
        assert_eq!(relay.broadcasts("evt", "pingEvent").len(), 1);
    }
}
