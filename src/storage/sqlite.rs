// SQLite-backed key-value store

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::KeyValueStore;
use crate::error::StorageError;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS session_kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Durable store holding one row per session key
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::debug!("Opening session store: {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Database that lives only as long as this value
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM session_kv WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_kv WHERE key = ?", [key])?;
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM session_kv WHERE key = ?", [key])?;
        }
        tx.commit()?;
        Ok(())
    }
}
