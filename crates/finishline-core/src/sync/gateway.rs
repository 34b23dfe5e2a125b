//! Local intents
//!
//! Everything the operator does goes through here. Each intent changes the
//! local state first, then makes sure the relay connection is up and tells
//! the peers. A missing connection never fails an intent: peers catch up
//! through history pulls and digests once the device is back.

use tracing::{info, warn};

use super::engine::{DeviceState, EngineEvent, SyncEngine};
use super::error::{SyncError, SyncResult};
use super::message::ProtocolMessage;
use super::replica::EventReplica;
use crate::models::{
    validate_barcode, validate_event_name, validate_token, Assignment, EntryMethod, WireAssignment,
};
use crate::storage::{EventDevice, StorageError};

/// What saving an assignment would overwrite or duplicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentCheck {
    pub token: u32,
    /// Barcode in canonical form
    pub athlete_barcode: String,
    /// Assignment the token already has
    pub existing: Option<Assignment>,
    /// Another token already given to the same athlete
    pub duplicate: Option<Assignment>,
}

impl AssignmentCheck {
    /// Whether the operator should confirm before saving
    pub fn needs_confirmation(&self) -> bool {
        self.duplicate.is_some()
            || self
                .existing
                .as_ref()
                .is_some_and(|a| a.athlete_barcode != self.athlete_barcode)
    }
}

impl SyncEngine {
    /// Take the next token and tell the peers
    pub async fn claim_token(&self) -> SyncResult<u32> {
        let (replica, token) = {
            let mut state = self.inner.state.lock().await;
            let token = state.replica.claim_next_token();
            (state.replica.clone(), token)
        };
        let event_id = replica.event_id.clone();
        self.emit(EngineEvent::ReplicaChanged(replica));

        self.ensure_connected().await;
        self.broadcast(&ProtocolMessage::TokenUsed {
            origin_id: self.origin_id().to_string(),
            event_id,
            token,
        });
        Ok(token)
    }

    /// Look up what saving `barcode` against `token` would collide with
    pub async fn check_assignment(&self, token: i64, barcode: &str) -> SyncResult<AssignmentCheck> {
        let token = validate_token(token)?;
        let athlete_barcode = validate_barcode(barcode)?;

        let state = self.inner.state.lock().await;
        Ok(AssignmentCheck {
            token,
            existing: state.register.get(token).cloned(),
            duplicate: state
                .register
                .find_duplicate_athlete(&athlete_barcode, token)
                .cloned(),
            athlete_barcode,
        })
    }

    /// Record which athlete received `token`
    ///
    /// The device's most recent assignments are broadcast and written to the
    /// history store. A store failure is returned as [`SyncError::Store`]
    /// after the local change and the broadcast have happened.
    pub async fn save_assignment(
        &self,
        token: u32,
        barcode: &str,
        athlete_name: &str,
        entry_method: EntryMethod,
    ) -> SyncResult<Assignment> {
        let token = validate_token(i64::from(token))?;
        let athlete_barcode = validate_barcode(barcode)?;

        let (event_id, assignment, recent) = {
            let mut state = self.inner.state.lock().await;
            let assignment = state.register.save_local(
                token,
                &athlete_barcode,
                athlete_name.trim(),
                entry_method,
                self.origin_id(),
            );
            state.preferred_method = entry_method;
            let recent = state.register.recent_local(self.inner.timings.recent_broadcast);
            (state.replica.event_id.clone(), assignment, recent)
        };
        info!("Assigned {} to {}", assignment.label(), athlete_barcode);
        self.emit(EngineEvent::AssignmentsChanged {
            tokens: vec![token],
        });

        self.ensure_connected().await;
        let device_id = &self.inner.session.device_id;
        self.broadcast(&ProtocolMessage::TokenAssignments {
            origin_id: self.origin_id().to_string(),
            event_id: event_id.clone(),
            assignments: recent
                .iter()
                .map(|a| WireAssignment::from_assignment(a, device_id))
                .collect(),
        });

        if let Err(e) = self
            .inner
            .store
            .upsert_assignments(&event_id, &recent, device_id)
            .await
        {
            return Err(self.store_failed("save assignments", e));
        }

        Ok(assignment)
    }

    /// Remove a token's assignment here and in the history store
    ///
    /// Peers are not told; they drop the record only when it is gone from
    /// the store and they start over from it.
    pub async fn clear_token(&self, token: i64) -> SyncResult<Option<Assignment>> {
        let token = validate_token(token)?;

        let (event_id, removed) = {
            let mut state = self.inner.state.lock().await;
            (state.replica.event_id.clone(), state.register.clear(token))
        };
        if removed.is_some() {
            self.emit(EngineEvent::AssignmentsChanged {
                tokens: vec![token],
            });
        }

        if let Err(e) = self.inner.store.delete_assignment(&event_id, token).await {
            return Err(self.store_failed("delete assignment", e));
        }
        Ok(removed)
    }

    /// Rename the event and/or move the shared token counter
    ///
    /// Both values are checked before either is applied. Peers hear about
    /// the change once edits stop for a moment.
    pub async fn set_event_details(
        &self,
        name: Option<&str>,
        next_token: Option<i64>,
    ) -> SyncResult<EventReplica> {
        let name = name.map(validate_event_name).transpose()?;
        let next_token = next_token.map(validate_token).transpose()?;

        let replica = {
            let mut state = self.inner.state.lock().await;
            if let Some(name) = &name {
                state.replica.rename(name)?;
            }
            if let Some(next) = next_token {
                state.replica.set_next_token(i64::from(next))?;
            }
            state.replica.clone()
        };
        self.emit(EngineEvent::ReplicaChanged(replica.clone()));

        self.ensure_connected().await;
        self.schedule_event_details();
        Ok(replica)
    }

    /// Start the token sequence over on every device
    ///
    /// Assignments are kept.
    pub async fn reset_event(&self) -> SyncResult<EventReplica> {
        let replica = {
            let mut state = self.inner.state.lock().await;
            state.replica.reset();
            state.replica.clone()
        };
        info!("Reset event {}", replica.event_id);
        self.emit(EngineEvent::ReplicaChanged(replica.clone()));

        self.ensure_connected().await;
        self.broadcast(&ProtocolMessage::ResetEvent {
            origin_id: self.origin_id().to_string(),
            event_id: replica.event_id.clone(),
        });
        Ok(replica)
    }

    /// Ask peers to re-send everything and pull the history store
    pub async fn request_history(&self) -> SyncResult<usize> {
        let event_id = self.event_id().await;
        if self.ensure_connected().await {
            self.broadcast(&ProtocolMessage::RequestFullHistory {
                origin_id: self.origin_id().to_string(),
                event_id,
            });
        }
        self.pull_history().await
    }

    /// Move this device to another event
    ///
    /// Pending work for the old event is dropped and the connection moves to
    /// the new event's group.
    pub async fn switch_event(&self, state: DeviceState) -> SyncResult<()> {
        let replica = state.replica.clone();
        {
            let mut current = self.inner.state.lock().await;
            if current.replica.event_id == replica.event_id {
                warn!("Already in event {}", replica.event_id);
            }
            *current = state;
        }
        self.cancel_event_details();
        info!("Switched to event {}", replica.event_id);
        self.emit(EngineEvent::ReplicaChanged(replica));

        self.ensure_connected().await;
        Ok(())
    }

    /// Store the operator-facing name of this device
    pub async fn set_device_name(&self, display_name: &str) -> SyncResult<()> {
        let event_id = self.event_id().await;
        self.inner
            .store
            .set_device_name(&event_id, &self.inner.session.device_id, display_name.trim())
            .await?;
        Ok(())
    }

    /// Devices the history store has seen in this event
    pub async fn devices(&self) -> SyncResult<Vec<EventDevice>> {
        let event_id = self.event_id().await;
        Ok(self.inner.store.devices(&event_id).await?)
    }

    /// Highest token with an assignment in the history store
    pub async fn highest_stored_token(&self) -> SyncResult<u32> {
        let event_id = self.event_id().await;
        Ok(self.inner.store.highest_token(&event_id).await?)
    }

    fn store_failed(&self, operation: &str, error: StorageError) -> SyncError {
        warn!("History store failed to {}: {}", operation, error);
        self.emit(EngineEvent::StoreFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        });
        SyncError::Store(error)
    }
}
