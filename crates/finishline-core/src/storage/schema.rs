//! SQLite schema for the history store
//!
//! Rows are addressed by partition key (the event id) and row key, the way
//! the hosted table store lays them out, so a store file can be exported to
//! it unchanged.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per handed-out token; row_key is the zero-padded token
        CREATE TABLE IF NOT EXISTS token_assignments (
            partition_key TEXT NOT NULL,
            row_key TEXT NOT NULL,
            position TEXT NOT NULL,
            athlete_id TEXT NOT NULL,
            athlete_name TEXT NOT NULL,
            entry_method TEXT NOT NULL,
            connection_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            assignment_timestamp INTEGER NOT NULL,
            PRIMARY KEY (partition_key, row_key)
        );

        -- Devices that have joined an event
        CREATE TABLE IF NOT EXISTS event_devices (
            partition_key TEXT NOT NULL,
            row_key TEXT NOT NULL,
            display_name TEXT,
            last_seen_timestamp INTEGER NOT NULL,
            PRIMARY KEY (partition_key, row_key)
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
