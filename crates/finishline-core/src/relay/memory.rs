//! In-memory relay
//!
//! A hub living in the current process. Groups fan out every broadcast to all
//! members, the sender included, the way the hosted relay does. The hub can
//! be switched off and can drop every connection, which is how tests
//! exercise reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Invocation, Relay, RelayCommand, RelayError, RelayLink, RelayResult};

/// In-process relay hub
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    unavailable: bool,
    connections: HashMap<String, Member>,
    groups: HashMap<String, HashSet<String>>,
    /// Every broadcast seen, in arrival order
    log: Vec<(String, Invocation)>,
}

struct Member {
    invocations: mpsc::UnboundedSender<Invocation>,
    // Dropping this ends the connection's pump task
    _kill: oneshot::Sender<()>,
}

impl MemoryRelay {
    /// Create a new, available hub
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept or refuse new connections
    pub fn set_available(&self, available: bool) {
        self.hub().unavailable = !available;
    }

    /// Close every open connection
    pub fn disconnect_all(&self) {
        let mut hub = self.hub();
        let count = hub.connections.len();
        hub.connections.clear();
        hub.groups.clear();
        debug!("Memory relay dropped {} connections", count);
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.hub().connections.len()
    }

    /// Number of connections subscribed to a group
    pub fn group_size(&self, group: &str) -> usize {
        self.hub().groups.get(group).map_or(0, HashSet::len)
    }

    /// Broadcasts sent to a group with the given target, oldest first
    pub fn broadcasts(&self, group: &str, target: &str) -> Vec<Invocation> {
        self.hub()
            .log
            .iter()
            .filter(|(g, inv)| g == group && inv.target == target)
            .map(|(_, inv)| inv.clone())
            .collect()
    }

    fn handle(&self, connection_id: &str, command: RelayCommand) {
        let mut hub = self.hub();
        match command {
            RelayCommand::JoinGroup { group } => {
                hub.groups
                    .entry(group)
                    .or_default()
                    .insert(connection_id.to_string());
            }
            RelayCommand::LeaveGroup { group } => {
                if let Some(members) = hub.groups.get_mut(&group) {
                    members.remove(connection_id);
                }
            }
            RelayCommand::Broadcast { group, invocation } => {
                let members: Vec<String> = hub
                    .groups
                    .get(&group)
                    .map(|m| m.iter().cloned().collect())
                    .unwrap_or_default();

                for member in members {
                    if let Some(conn) = hub.connections.get(&member) {
                        let _ = conn.invocations.send(invocation.clone());
                    }
                }
                hub.log.push((group, invocation));
            }
        }
    }

    fn remove(&self, connection_id: &str) {
        let mut hub = self.hub();
        hub.connections.remove(connection_id);
        for members in hub.groups.values_mut() {
            members.remove(connection_id);
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn connect(&self) -> RelayResult<RelayLink> {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (invocation_tx, invocation_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let connection_id = {
            let mut hub = self.hub();
            if hub.unavailable {
                return Err(RelayError::Unavailable("memory relay is switched off".into()));
            }
            hub.next_id += 1;
            let id = format!("mem-{}", hub.next_id);
            hub.connections.insert(
                id.clone(),
                Member {
                    invocations: invocation_tx,
                    _kill: kill_tx,
                },
            );
            id
        };

        let relay = self.clone();
        let id = connection_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = command_rx.recv() => match cmd {
                        Some(cmd) => relay.handle(&id, cmd),
                        None => break,
                    },
                    _ = &mut kill_rx => break,
                }
            }
            relay.remove(&id);
        });

        Ok(RelayLink {
            connection_id,
            commands: command_tx,
            invocations: invocation_rx,
        })
    }
}
