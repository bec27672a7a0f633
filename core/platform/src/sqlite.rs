//! SQLite-backed key-value store.
//!
//! Persists credentials and the sync cursor outside the record database so
//! they survive a local store reset.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use musichub_common::{Error, Result};

use crate::kv::KeyValueStore;

/// Key-value store persisted in a single SQLite table.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Create or open a key-value database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::Storage(format!("Failed to open key-value store: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize key-value store: {}", e)))?;

        info!("Key-value store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("Key-value store lock poisoned".to_string()))?;
        f(&conn).map_err(|e| Error::Storage(format!("Key-value store query failed: {}", e)))
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        debug!("Persisting key: {}", key);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv_entries (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", [key])
                .map(|_| ())
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM kv_entries WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![prefix, prefix.chars().count() as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
    }
}
