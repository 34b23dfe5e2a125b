//! In-memory history store
//!
//! Same semantics as the SQLite store, kept in a map. Cloning shares the
//! underlying data, so several engines in one process can use one store the
//! way devices share the hosted one. Failures can be switched on to exercise
//! error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DurableStore, EventDevice, StorageError, StorageResult};
use crate::models::{now_millis, Assignment};

#[derive(Default)]
struct Tables {
    /// event id -> token -> assignment
    assignments: HashMap<String, BTreeMap<u32, Assignment>>,
    /// event id -> device id -> device
    devices: HashMap<String, HashMap<String, EventDevice>>,
}

/// History store held in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StorageError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory store is switched off".to_string(),
            ));
        }
        Ok(self.tables.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_assignments(&self, event_id: &str) -> StorageResult<Vec<Assignment>> {
        Ok(self
            .tables()?
            .assignments
            .get(event_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_assignments(
        &self,
        event_id: &str,
        assignments: &[Assignment],
        _device_id: &str,
    ) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let rows = tables.assignments.entry(event_id.to_string()).or_default();
        for a in assignments {
            rows.insert(
                a.token,
                Assignment {
                    is_local: false,
                    ..a.clone()
                },
            );
        }
        Ok(())
    }

    async fn delete_assignment(&self, event_id: &str, token: u32) -> StorageResult<()> {
        if let Some(rows) = self.tables()?.assignments.get_mut(event_id) {
            rows.remove(&token);
        }
        Ok(())
    }

    async fn touch_device_last_seen(&self, event_id: &str, device_id: &str) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let device = tables
            .devices
            .entry(event_id.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_insert_with(|| EventDevice {
                device_id: device_id.to_string(),
                display_name: None,
                last_seen: 0,
            });
        device.last_seen = now_millis();
        Ok(())
    }

    async fn set_device_name(
        &self,
        event_id: &str,
        device_id: &str,
        display_name: &str,
    ) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let now = now_millis();
        let device = tables
            .devices
            .entry(event_id.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_insert_with(|| EventDevice {
                device_id: device_id.to_string(),
                display_name: None,
                last_seen: now,
            });
        device.display_name = Some(display_name.to_string());
        device.last_seen = device.last_seen.max(now);
        Ok(())
    }

    async fn highest_token(&self, event_id: &str) -> StorageResult<u32> {
        Ok(self
            .tables()?
            .assignments
            .get(event_id)
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn devices(&self, event_id: &str) -> StorageResult<Vec<EventDevice>> {
        let mut devices: Vec<EventDevice> = self
            .tables()?
            .devices
            .get(event_id)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }
}
