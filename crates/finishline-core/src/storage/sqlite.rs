//! SQLite history store
//!
//! File-backed [`DurableStore`]. Statements are short, so they run inline
//! on the calling task while holding the connection lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use super::schema::{init_schema, needs_init};
use super::{row_key, DurableStore, EventDevice, StorageError, StorageResult, UPSERT_BATCH_SIZE};
use crate::models::{format_token, now_millis, parse_token_label, Assignment, EntryMethod};

/// History store backed by a SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        debug!("Opened history store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_assignment(
    event_id: &str,
    row_key: String,
    athlete_id: String,
    athlete_name: String,
    entry_method: String,
    connection_id: String,
    timestamp: i64,
) -> StorageResult<Assignment> {
    let invalid = |details: String| StorageError::InvalidRecord {
        event_id: event_id.to_string(),
        row_key: row_key.clone(),
        details,
    };

    let token = parse_token_label(&row_key).map_err(|e| invalid(e.to_string()))?;
    let entry_method = entry_method
        .parse::<EntryMethod>()
        .map_err(|e| invalid(e.to_string()))?;

    Ok(Assignment {
        token,
        athlete_barcode: athlete_id,
        athlete_name,
        entry_method,
        timestamp,
        origin_id: connection_id,
        is_local: false,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_assignments(&self, event_id: &str) -> StorageResult<Vec<Assignment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT row_key, athlete_id, athlete_name, entry_method, connection_id, assignment_timestamp
             FROM token_assignments WHERE partition_key = ?1 ORDER BY row_key",
        )?;

        let rows = stmt.query_map([event_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut assignments = Vec::new();
        for row in rows {
            let (key, athlete_id, athlete_name, method, connection_id, timestamp) = row?;
            match row_to_assignment(
                event_id,
                key,
                athlete_id,
                athlete_name,
                method,
                connection_id,
                timestamp,
            ) {
                Ok(assignment) => assignments.push(assignment),
                Err(e) => warn!("Skipping stored record: {}", e),
            }
        }

        debug!(
            "Retrieved {} token assignments for event {}",
            assignments.len(),
            event_id
        );
        Ok(assignments)
    }

    async fn upsert_assignments(
        &self,
        event_id: &str,
        assignments: &[Assignment],
        device_id: &str,
    ) -> StorageResult<()> {
        if assignments.is_empty() {
            warn!("No assignments to save for event {}", event_id);
            return Ok(());
        }

        let mut conn = self.conn();
        for batch in assignments.chunks(UPSERT_BATCH_SIZE) {
            let tx = conn.transaction()?;
            for a in batch {
                tx.execute(
                    "INSERT INTO token_assignments
                        (partition_key, row_key, position, athlete_id, athlete_name,
                         entry_method, connection_id, device_id, assignment_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (partition_key, row_key) DO UPDATE SET
                        position = excluded.position,
                        athlete_id = excluded.athlete_id,
                        athlete_name = excluded.athlete_name,
                        entry_method = excluded.entry_method,
                        connection_id = excluded.connection_id,
                        device_id = excluded.device_id,
                        assignment_timestamp = excluded.assignment_timestamp",
                    params![
                        event_id,
                        row_key(a.token),
                        format_token(a.token),
                        a.athlete_barcode,
                        a.athlete_name,
                        a.entry_method.as_str(),
                        a.origin_id,
                        device_id,
                        a.timestamp,
                    ],
                )?;
            }
            tx.commit()?;
            info!(
                "Saved {} token assignments for event {}",
                batch.len(),
                event_id
            );
        }

        Ok(())
    }

    async fn delete_assignment(&self, event_id: &str, token: u32) -> StorageResult<()> {
        let removed = self.conn().execute(
            "DELETE FROM token_assignments WHERE partition_key = ?1 AND row_key = ?2",
            params![event_id, row_key(token)],
        )?;

        if removed == 0 {
            debug!(
                "Token {} not found for event {} (already cleared)",
                token, event_id
            );
        } else {
            info!("Cleared token {} for event {}", token, event_id);
        }
        Ok(())
    }

    async fn touch_device_last_seen(&self, event_id: &str, device_id: &str) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO event_devices (partition_key, row_key, display_name, last_seen_timestamp)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT (partition_key, row_key) DO UPDATE SET
                last_seen_timestamp = excluded.last_seen_timestamp",
            params![event_id, device_id, now_millis()],
        )?;
        debug!(
            "Updated last seen for device {} in event {}",
            device_id, event_id
        );
        Ok(())
    }

    async fn set_device_name(
        &self,
        event_id: &str,
        device_id: &str,
        display_name: &str,
    ) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO event_devices (partition_key, row_key, display_name, last_seen_timestamp)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (partition_key, row_key) DO UPDATE SET
                display_name = excluded.display_name,
                last_seen_timestamp = MAX(last_seen_timestamp, excluded.last_seen_timestamp)",
            params![event_id, device_id, display_name, now_millis()],
        )?;
        info!(
            "Set display name for device {} in event {} to {}",
            device_id, event_id, display_name
        );
        Ok(())
    }

    async fn highest_token(&self, event_id: &str) -> StorageResult<u32> {
        // MAX over no rows yields a single NULL
        let highest = self.conn().query_row(
            "SELECT MAX(CAST(row_key AS INTEGER)) FROM token_assignments WHERE partition_key = ?1",
            [event_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;

        Ok(highest.and_then(|h| u32::try_from(h).ok()).unwrap_or(0))
    }

    async fn devices(&self, event_id: &str) -> StorageResult<Vec<EventDevice>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT row_key, display_name, last_seen_timestamp FROM event_devices
             WHERE partition_key = ?1 ORDER BY last_seen_timestamp DESC",
        )?;

        let devices = stmt
            .query_map([event_id], |row| {
                Ok(EventDevice {
                    device_id: row.get(0)?,
                    display_name: row.get(1)?,
                    last_seen: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assignment(token: u32, barcode: &str, timestamp: i64) -> Assignment {
        Assignment {
            token,
            athlete_barcode: barcode.to_string(),
            athlete_name: String::new(),
            entry_method: EntryMethod::infer(barcode),
            timestamp,
            origin_id: "s1".to_string(),
            is_local: true,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_assignments("evt1", &[assignment(1, "A42", 100), assignment(2, "", 110)], "dev")
            .await
            .unwrap();

        let got = store.get_assignments("evt1").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].token, 1);
        assert_eq!(got[0].athlete_barcode, "A42");
        assert_eq!(got[0].origin_id, "s1");
        assert!(!got[0].is_local);
        assert_eq!(got[1].entry_method, EntryMethod::Qr);

        assert!(store.get_assignments("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_assignments("evt1", &[assignment(5, "A1", 100)], "dev")
            .await
            .unwrap();
        store
            .upsert_assignments("evt1", &[assignment(5, "A2", 200)], "dev")
            .await
            .unwrap();

        let got = store.get_assignments("evt1").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].athlete_barcode, "A2");
        assert_eq!(got[0].timestamp, 200);
    }

    #[tokio::test]
    async fn test_upsert_more_than_one_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let many: Vec<Assignment> = (1..=250).map(|t| assignment(t, "", t as i64)).collect();
        store.upsert_assignments("evt1", &many, "dev").await.unwrap();

        assert_eq!(store.get_assignments("evt1").await.unwrap().len(), 250);
        assert_eq!(store.highest_token("evt1").await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.delete_assignment("evt1", 7).await.unwrap();

        store
            .upsert_assignments("evt1", &[assignment(7, "A7", 1)], "dev")
            .await
            .unwrap();
        store.delete_assignment("evt1", 7).await.unwrap();
        assert!(store.get_assignments("evt1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_highest_token_empty_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.highest_token("evt1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_preserves_display_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_device_name("evt1", "dev", "Finish A").await.unwrap();
        store.touch_device_last_seen("evt1", "dev").await.unwrap();
        store.touch_device_last_seen("evt1", "dev2").await.unwrap();

        let devices = store.devices("evt1").await.unwrap();
        assert_eq!(devices.len(), 2);
        let named = devices.iter().find(|d| d.device_id == "dev").unwrap();
        assert_eq!(named.display_name.as_deref(), Some("Finish A"));
        let unnamed = devices.iter().find(|d| d.device_id == "dev2").unwrap();
        assert_eq!(unnamed.display_name, None);
    }

    #[tokio::test]
    async fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("history.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
            store
                .upsert_assignments("evt1", &[assignment(3, "A9", 5)], "dev")
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let got = store.get_assignments("evt1").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].athlete_barcode, "A9");
    }

    #[tokio::test]
    async fn test_invalid_rows_are_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_assignments("evt1", &[assignment(1, "A1", 1)], "dev")
            .await
            .unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO token_assignments VALUES ('evt1', 'junk', 'Pjunk', '', '', 'qr', '', '', 0)",
                [],
            )
            .unwrap();

        let got = store.get_assignments("evt1").await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
