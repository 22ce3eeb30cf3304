//! User Storage
//!
//! Storage backends for accounts, password hashes, unread backlogs, and
//! last-active timestamps. In-memory for tests and development, SQLite for
//! production.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use rusqlite::{params, Connection, OptionalExtension};

use crate::auth::{AuthError, PasswordHash};

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Account storage used by the authenticator.
pub trait UserStore: Send + Sync {
    /// Creates an account. Fails with `UserExists` on duplicates.
    fn create_user(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// Stored password hash, or `None` for an unknown user.
    fn credentials(&self, username: &str) -> Result<Option<PasswordHash>, AuthError>;

    /// Appends a message to the user's unread backlog.
    fn push_unread(&self, username: &str, body: &str) -> Result<(), AuthError>;

    /// Returns and clears the unread backlog, oldest first.
    fn take_unread(&self, username: &str) -> Result<Vec<String>, AuthError>;

    fn touch_last_active(&self, username: &str, at_secs: u64) -> Result<(), AuthError>;

    fn last_active(&self, username: &str) -> Result<Option<u64>, AuthError>;

    fn user_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Debug, Clone)]
struct UserRecord {
    password: PasswordHash,
    unread: Vec<String>,
    last_active_secs: Option<u64>,
}

pub struct MemoryUserStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        MemoryUserStore {
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryUserStore {
    fn create_user(&self, username: &str, password: &str) -> Result<(), AuthError> {
        // Hash outside the lock
        let password = PasswordHash::derive(password)?;
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        users.insert(
            username.to_string(),
            UserRecord {
                password,
                unread: Vec::new(),
                last_active_secs: None,
            },
        );
        Ok(())
    }

    fn credentials(&self, username: &str) -> Result<Option<PasswordHash>, AuthError> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users.get(username).map(|u| u.password.clone()))
    }

    fn push_unread(&self, username: &str, body: &str) -> Result<(), AuthError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let user = users
            .get_mut(username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;
        user.unread.push(body.to_string());
        Ok(())
    }

    fn take_unread(&self, username: &str) -> Result<Vec<String>, AuthError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        Ok(users
            .get_mut(username)
            .map(|u| std::mem::take(&mut u.unread))
            .unwrap_or_default())
    }

    fn touch_last_active(&self, username: &str, at_secs: u64) -> Result<(), AuthError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let user = users
            .get_mut(username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;
        user.last_active_secs = Some(at_secs);
        Ok(())
    }

    fn last_active(&self, username: &str) -> Result<Option<u64>, AuthError> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users.get(username).and_then(|u| u.last_active_secs))
    }

    fn user_count(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ============================================================================
// SQLite Storage
// ============================================================================

pub struct SqliteUserStore {
    conn: Mutex<Connection>,
}

impl SqliteUserStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                salt BLOB NOT NULL,
                password_hash BLOB NOT NULL,
                last_active_secs INTEGER
            )",
            [],
        )?;

        // AUTOINCREMENT id keeps backlog in insertion order
        conn.execute(
            "CREATE TABLE IF NOT EXISTS unread (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_unread_username ON unread(username)",
            [],
        )?;

        Ok(SqliteUserStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for SqliteUserStore {
    fn create_user(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let password = PasswordHash::derive(password)?;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO users (username, salt, password_hash) VALUES (?1, ?2, ?3)",
            params![username, password.salt, password.hash],
        )?;
        if inserted == 0 {
            return Err(AuthError::UserExists(username.to_string()));
        }
        Ok(())
    }

    fn credentials(&self, username: &str) -> Result<Option<PasswordHash>, AuthError> {
        let found = self
            .conn()
            .query_row(
                "SELECT salt, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(PasswordHash {
                        salt: row.get(0)?,
                        hash: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    fn push_unread(&self, username: &str, body: &str) -> Result<(), AuthError> {
        let conn = self.conn();
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![username],
            |row| row.get(0),
        )?;
        if !known {
            return Err(AuthError::UnknownUser(username.to_string()));
        }
        conn.execute(
            "INSERT INTO unread (username, body) VALUES (?1, ?2)",
            params![username, body],
        )?;
        Ok(())
    }

    fn take_unread(&self, username: &str) -> Result<Vec<String>, AuthError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let bodies = {
            let mut stmt =
                tx.prepare("SELECT body FROM unread WHERE username = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map(params![username], |row| row.get::<_, String>(0))?;
            let bodies = rows.collect::<Result<Vec<_>, _>>()?;
            bodies
        };
        tx.execute("DELETE FROM unread WHERE username = ?1", params![username])?;
        tx.commit()?;
        Ok(bodies)
    }

    fn touch_last_active(&self, username: &str, at_secs: u64) -> Result<(), AuthError> {
        let changed = self.conn().execute(
            "UPDATE users SET last_active_secs = ?1 WHERE username = ?2",
            params![at_secs as i64, username],
        )?;
        if changed == 0 {
            return Err(AuthError::UnknownUser(username.to_string()));
        }
        Ok(())
    }

    fn last_active(&self, username: &str) -> Result<Option<u64>, AuthError> {
        let value: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT last_active_secs FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten().map(|secs| secs as u64))
    }

    fn user_count(&self) -> usize {
        self.conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }
}

/// Creates a user store for the given backend.
///
/// The SQLite backend lives at `data_dir/users.db`; the directory is created if
/// missing.
pub fn create_user_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Box<dyn UserStore>, AuthError> {
    match (backend, data_dir) {
        (StorageBackend::Sqlite, Some(dir)) => {
            std::fs::create_dir_all(dir).map_err(|e| AuthError::Storage(e.to_string()))?;
            Ok(Box::new(SqliteUserStore::open(dir.join("users.db"))?))
        }
        (StorageBackend::Sqlite, None) => Ok(Box::new(SqliteUserStore::in_memory()?)),
        (StorageBackend::Memory, _) => Ok(Box::new(MemoryUserStore::new())),
    }
}

/// Parses `name:password,name:password` into pairs, skipping malformed items.
pub fn parse_seed_users(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .filter_map(|item| {
            let (name, password) = item.trim().split_once(':')?;
            if name.is_empty() || password.is_empty() {
                return None;
            }
            Some((name.to_string(), password.to_string()))
        })
        .collect()
}
