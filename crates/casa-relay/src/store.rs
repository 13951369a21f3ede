//! SQLite storage for the relay connection table
//!
//! One record per live signaling socket. The table is shared so any relay
//! instance can enumerate the full connection set when broadcasting,
//! regardless of which instance accepted which socket.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, error, info};

/// A persisted connection record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub created_at: i64,
}

/// SQLite storage backend for connection records
pub struct ConnectionStore {
    conn: Mutex<Connection>,
}

impl ConnectionStore {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing and single-node setups)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                connection_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        info!("Connection table schema initialized");
        Ok(())
    }

    /// Insert a record for a newly opened socket
    pub fn add_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = current_timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO connections (connection_id, created_at) VALUES (?1, ?2)",
            params![connection_id, now],
        )?;

        debug!("Connection recorded: {}", connection_id);
        Ok(())
    }

    /// Delete a record. Deleting a non-existent key is not an error.
    pub fn remove_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute(
            "DELETE FROM connections WHERE connection_id = ?1",
            params![connection_id],
        )?;

        debug!("Connection record removed: {}", connection_id);
        Ok(())
    }

    /// Check whether a record exists
    pub fn contains(&self, connection_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM connections WHERE connection_id = ?1)",
            params![connection_id],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    /// Full scan of the current connection set
    pub fn list_connections(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut stmt =
            conn.prepare("SELECT connection_id, created_at FROM connections ORDER BY created_at")?;

        let records: Vec<ConnectionRecord> = stmt
            .query_map([], |row| {
                Ok(ConnectionRecord {
                    connection_id: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    /// Total record count
    pub fn connection_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Storage errors
#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        error!("Database error: {:?}", e);
        StoreError::Database(e)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::LockPoisoned => {
                write!(f, "Lock poisoned: a thread panicked while holding the lock")
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = ConnectionStore::in_memory().unwrap();
        assert_eq!(store.connection_count().unwrap(), 0);
    }

    #[test]
    fn test_add_remove_connection() {
        let store = ConnectionStore::in_memory().unwrap();

        store.add_connection("conn-1").unwrap();
        assert!(store.contains("conn-1").unwrap());
        assert_eq!(store.connection_count().unwrap(), 1);

        store.remove_connection("conn-1").unwrap();
        assert!(!store.contains("conn-1").unwrap());
        assert_eq!(store.connection_count().unwrap(), 0);
    }

    #[test]
    fn test_remove_missing_is_not_an_error() {
        let store = ConnectionStore::in_memory().unwrap();
        store.remove_connection("never-existed").unwrap();
    }

    #[test]
    fn test_list_connections() {
        let store = ConnectionStore::in_memory().unwrap();

        store.add_connection("a").unwrap();
        store.add_connection("b").unwrap();
        store.add_connection("c").unwrap();

        let ids: Vec<String> = store
            .list_connections()
            .unwrap()
            .into_iter()
            .map(|r| r.connection_id)
            .collect();

        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
        assert!(ids.contains(&"c".to_string()));
    }

    #[test]
    fn test_reinsert_same_id() {
        let store = ConnectionStore::in_memory().unwrap();

        store.add_connection("dup").unwrap();
        store.add_connection("dup").unwrap();
        assert_eq!(store.connection_count().unwrap(), 1);
    }
}
