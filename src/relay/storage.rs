//! Persistence for the configured relay list.
//!
//! The manager persists nothing but an ordered list of address strings.
//! Normalization and validation happen in the manager before and after
//! persistence; storage implementations store what they are given.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::error::{RelayError, RelayResult};

/// Settings key under which the relay list is stored.
const RELAY_LIST_KEY: &str = "configured_relays";

/// Load/save contract for the configured relay list.
///
/// Implementations must be `Send + Sync`; the manager may call them
/// from its reconciliation task.
pub trait RelayListStorage: Send + Sync {
    /// Loads the persisted relay list. An absent list is an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be read.
    fn load_relays(&self) -> RelayResult<Vec<String>>;

    /// Replaces the persisted relay list.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn save_relays(&self, relays: &[String]) -> RelayResult<()>;
}

/// `SQLite`-backed relay list storage.
///
/// Stores the list as a JSON array in a single settings row, so the
/// same database file can carry other client settings.
pub struct SqliteRelayStorage {
    conn: Mutex<Connection>,
}

impl SqliteRelayStorage {
    /// Opens (or creates) the settings database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or initialized.
    pub fn new(path: &Path) -> RelayResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Creates an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> RelayResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> RelayResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Storage(format!("Failed to acquire database lock: {e}")))?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }
}

impl RelayListStorage for SqliteRelayStorage {
    fn load_relays(&self) -> RelayResult<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Storage(format!("Failed to acquire database lock: {e}")))?;

        let row: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![RELAY_LIST_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| RelayError::Storage(format!("Failed to parse relay list: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    fn save_relays(&self, relays: &[String]) -> RelayResult<()> {
        let json = serde_json::to_string(relays)
            .map_err(|e| RelayError::Storage(format!("Failed to serialize relay list: {e}")))?;

        let conn = self
            .conn
            .lock()
            .map_err(|e| RelayError::Storage(format!("Failed to acquire database lock: {e}")))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![RELAY_LIST_KEY, json],
        )?;

        Ok(())
    }
}
