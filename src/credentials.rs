//! Credential storage.
//!
//! Maps a login to its password. Two backends are provided:
//! - `MemoryStore`: process-lifetime map, the default
//! - `SqliteStore`: a `users` table in a SQLite database file
//!
//! Passwords are stored and compared as given.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::info;

/// Credential storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store lock poisoned")]
    Poisoned,
    #[error("credential lookup was interrupted")]
    Interrupted,
}

/// Lookup and insertion of login credentials
pub trait CredentialStore: Send + Sync {
    /// Stored password for `login`, if the login exists
    fn lookup(&self, login: &str) -> Result<Option<String>, StoreError>;

    /// Insert a new login. Returns `false` if the login already exists.
    fn insert(&self, login: &str, password: &str) -> Result<bool, StoreError>;
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn lookup(&self, login: &str) -> Result<Option<String>, StoreError> {
        let users = self.users.read().map_err(|_| StoreError::Poisoned)?;
        Ok(users.get(login).cloned())
    }

    fn insert(&self, login: &str, password: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().map_err(|_| StoreError::Poisoned)?;
        if users.contains_key(login) {
            return Ok(false);
        }
        users.insert(login.to_string(), password.to_string());
        Ok(true)
    }
}

/// SQLite-backed credential store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened credential database");
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                login TEXT PRIMARY KEY,
                pass  TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CredentialStore for SqliteStore {
    fn lookup(&self, login: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let pass = conn
            .query_row(
                "SELECT pass FROM users WHERE login = ?1",
                params![login],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pass)
    }

    fn insert(&self, login: &str, password: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO users (login, pass) VALUES (?1, ?2)",
            params![login, password],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn CredentialStore) {
        assert_eq!(store.lookup("alice").unwrap(), None);
        assert!(store.insert("alice", "pw1").unwrap());
        assert!(!store.insert("alice", "pw2").unwrap());
        assert_eq!(store.lookup("alice").unwrap().as_deref(), Some("pw1"));
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("users.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            assert!(store.insert("bob", "secret").unwrap());
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.lookup("bob").unwrap().as_deref(), Some("secret"));
        assert!(!store.insert("bob", "other").unwrap());
    }
}
