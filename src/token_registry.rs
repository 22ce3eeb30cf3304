// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Token Registry
//!
//! Tracks online sessions so notifications can reach the connection that
//! currently serves a token.
//!
//! The registry maps session tokens to the outbound notification queue of the
//! owning connection handler. It is the only structure mutated by several
//! connections at once; every operation takes the inner `RwLock` for its whole
//! duration, so register/unregister/lookup are atomic with respect to each
//! other.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Sending half of a connection's private notification queue.
pub type Outbox = mpsc::Sender<String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A token was registered twice. The newer entry replaced the older one.
    #[error("session token already registered")]
    DuplicateToken,
}

/// A registered online session.
#[derive(Debug, Clone)]
pub struct OnlineSession {
    pub username: String,
    pub outbox: Outbox,
}

/// Thread-safe token → online session map.
pub struct TokenRegistry {
    sessions: RwLock<HashMap<String, OnlineSession>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        TokenRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an online session.
    ///
    /// Tokens are server-generated and unique, so a duplicate is an invariant
    /// violation: the new entry overwrites the old one and `DuplicateToken` is
    /// returned for the caller to log. The replaced queue is dropped, which
    /// ends the stale connection's notification drain.
    pub fn register(
        &self,
        token: &str,
        username: &str,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = sessions.insert(
            token.to_string(),
            OnlineSession {
                username: username.to_string(),
                outbox,
            },
        );
        match previous {
            Some(old) => {
                warn!(
                    "Duplicate session token registered (was {}, now {})",
                    old.username, username
                );
                Err(RegistryError::DuplicateToken)
            }
            None => Ok(()),
        }
    }

    /// Removes a session. Returns false if the token was not registered.
    pub fn unregister(&self, token: &str) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.remove(token).is_some()
    }

    /// Resolves a token to its online session.
    pub fn lookup(&self, token: &str) -> Option<OnlineSession> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(token).cloned()
    }

    pub fn is_valid_session(&self, token: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.contains_key(token)
    }

    /// Copies out every online session so a broadcast can fan out without
    /// holding the lock while enqueueing.
    pub fn snapshot(&self) -> Vec<(String, OnlineSession)> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .iter()
            .map(|(token, session)| (token.clone(), session.clone()))
            .collect()
    }

    /// Returns the number of online sessions.
    pub fn online_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.len()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TokenRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register("tok-1", "alice", tx).unwrap();

        assert!(registry.is_valid_session("tok-1"));
        let session = registry.lookup("tok-1").unwrap();
        assert_eq!(session.username, "alice");

        session.outbox.try_send("hello".to_string()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_lookup_unknown_token() {
        let registry = TokenRegistry::new();
        assert!(registry.lookup("nope").is_none());
        assert!(!registry.is_valid_session("nope"));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = TokenRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register("tok-1", "alice", tx).unwrap();

        assert!(registry.unregister("tok-1"));
        assert!(!registry.is_valid_session("tok-1"));
        assert!(!registry.unregister("tok-1"));
        assert!(!registry.is_valid_session("tok-1"));
        assert_eq!(registry.online_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_token_overwrites() {
        let registry = TokenRegistry::new();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);

        registry.register("tok-1", "alice", old_tx).unwrap();
        assert_eq!(
            registry.register("tok-1", "alice", new_tx),
            Err(RegistryError::DuplicateToken)
        );
        assert_eq!(registry.online_count(), 1);

        // Old queue lost its only sender
        assert!(old_rx.recv().await.is_none());

        let session = registry.lookup("tok-1").unwrap();
        session.outbox.try_send("x".to_string()).unwrap();
        assert_eq!(new_rx.recv().await.unwrap(), "x");
    }

    #[test]
    fn test_snapshot_lists_all_sessions() {
        let registry = TokenRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        registry.register("a", "alice", tx1).unwrap();
        registry.register("b", "bob", tx2).unwrap();

        let mut names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|(_, s)| s.username)
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = std::sync::Arc::new(TokenRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let token = format!("tok-{}-{}", i, j);
                        let (tx, _rx) = mpsc::channel(1);
                        registry.register(&token, "user", tx).unwrap();
                        assert!(registry.is_valid_session(&token));
                        assert!(registry.unregister(&token));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.online_count(), 0);
    }
}
