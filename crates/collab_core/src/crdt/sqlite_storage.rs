//! SQLite-backed storage implementation.
//!
//! Persists the update log and version snapshots of every document in one
//! database file.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{DocumentStore, StorageResult, poisoned};
use super::types::{StoredUpdate, UpdateOrigin};
use crate::error::CollabError;
use crate::model::DocumentNode;
use crate::versions::{NewVersion, VersionInfo, VersionSnapshot};

/// SQLite-backed document store.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access. Version
/// numbers are assigned inside a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database.
    ///
    /// Data is lost when the store is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute_batch(
            r#"
            -- Encoded change batches
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            -- Index for efficient sync queries
            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);

            -- Append-only version history
            CREATE TABLE IF NOT EXISTS versions (
                doc_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT,
                created_at INTEGER NOT NULL,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                state_vector BLOB NOT NULL,
                PRIMARY KEY (doc_name, version)
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_origin(origin: String) -> UpdateOrigin {
    origin.parse().unwrap_or(UpdateOrigin::Remote)
}

impl DocumentStore for SqliteStore {
    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT doc_name FROM updates UNION SELECT doc_name FROM versions ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![
                name,
                update,
                origin.to_string(),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<StoredUpdate>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates WHERE doc_name = ? AND id > ? ORDER BY id ASC",
        )?;
        let updates = stmt
            .query_map(params![name, since_id], |row| {
                Ok(StoredUpdate {
                    update_id: row.get(0)?,
                    doc_name: name.to_string(),
                    data: row.get(1)?,
                    origin: parse_origin(row.get(2)?),
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    fn get_latest_update_id(&self, name: &str) -> StorageResult<i64> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let id: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM updates WHERE doc_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id.unwrap_or(0))
    }

    fn update_count(&self, name: &str) -> StorageResult<usize> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE doc_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn compact(&self, name: &str, merged: &[u8], up_to_id: i64) -> StorageResult<()> {
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id <= ?",
            params![name, up_to_id],
        )?;
        tx.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![
                name,
                merged,
                UpdateOrigin::Sync.to_string(),
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn insert_version(&self, name: &str, version: NewVersion) -> StorageResult<VersionSnapshot> {
        let content = serde_json::to_string(&version.content)?;
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM versions WHERE doc_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        let number = last as u64 + 1;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO versions (doc_name, version, name, created_at, author_id, content, state_vector)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                name,
                number as i64,
                version.name,
                created_at.timestamp_millis(),
                version.author_id,
                content,
                version.state_vector
            ],
        )?;
        tx.commit()?;
        // Round to the stored precision so reads compare equal.
        let created_at = millis_to_datetime(created_at.timestamp_millis());
        Ok(version.into_snapshot(number, created_at))
    }

    fn list_versions(&self, name: &str) -> StorageResult<Vec<VersionInfo>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT version, name, created_at, author_id FROM versions WHERE doc_name = ? ORDER BY version ASC",
        )?;
        let versions = stmt
            .query_map(params![name], |row| {
                Ok(VersionInfo {
                    version: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                    created_at: millis_to_datetime(row.get(2)?),
                    author_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    fn get_version(&self, name: &str, version: u64) -> StorageResult<Option<VersionSnapshot>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let row = conn
            .query_row(
                "SELECT name, created_at, author_id, content, state_vector FROM versions
                 WHERE doc_name = ? AND version = ?",
                params![name, version as i64],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((label, created_at, author_id, content, state_vector)) = row else {
            return Ok(None);
        };
        let content: DocumentNode = serde_json::from_str(&content).map_err(|e| {
            CollabError::Storage(format!("corrupt content of version {}: {}", version, e))
        })?;
        Ok(Some(VersionSnapshot {
            version,
            name: label,
            created_at: millis_to_datetime(created_at),
            author_id,
            content,
            state_vector,
        }))
    }
}
