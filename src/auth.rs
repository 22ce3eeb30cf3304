// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Authentication
//!
//! The [`Authenticator`] contract the command processor relies on, plus the
//! store-backed implementation that verifies PBKDF2 password hashes and issues
//! session tokens.

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::user_store::UserStore;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};
const SALT_LEN: usize = 16;
const HASH_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingCredentials,
    /// Unknown user and wrong password are deliberately indistinguishable.
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        AuthError::Storage(e.to_string())
    }
}

/// Result of a successful credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Freshly issued, never reused session token.
    pub token: String,
    pub username: String,
    /// Unread messages, oldest first.
    pub unread: Vec<String>,
}

/// Credential checking as seen by a connection.
///
/// Calls are synchronous and run on the calling connection's task; they must
/// not hold any lock shared with other connections while doing slow work.
pub trait Authenticator: Send + Sync {
    fn validate(&self, username: &str, password: &str) -> Result<AuthenticatedUser, AuthError>;

    /// Best-effort liveness timestamp. Callers log failures and move on.
    fn touch_last_active(&self, username: &str) -> Result<(), AuthError>;
}

/// Salted PBKDF2-HMAC-SHA256 password hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
}

impl PasswordHash {
    /// Hashes `password` under a fresh random salt.
    pub fn derive(password: &str) -> Result<Self, AuthError> {
        let mut salt = vec![0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| AuthError::Storage("system RNG unavailable".to_string()))?;
        Ok(Self::derive_with_salt(password, salt))
    }

    fn derive_with_salt(password: &str, salt: Vec<u8>) -> Self {
        let mut hash = vec![0u8; HASH_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            &salt,
            password.as_bytes(),
            &mut hash,
        );
        PasswordHash { salt, hash }
    }

    /// Constant-time comparison against `password`.
    pub fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            &self.salt,
            password.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }
}

/// Stand-in hash checked for unknown users, so a miss costs the same
/// derivation as a wrong password.
fn unknown_user_hash() -> &'static PasswordHash {
    static HASH: OnceLock<PasswordHash> = OnceLock::new();
    HASH.get_or_init(|| PasswordHash::derive_with_salt("", vec![0u8; SALT_LEN]))
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// [`Authenticator`] over a [`UserStore`].
///
/// A successful validation consumes the user's unread backlog, so each unread
/// message is replayed on exactly one login.
pub struct StoreAuthenticator {
    store: Arc<dyn UserStore>,
}

impl StoreAuthenticator {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        StoreAuthenticator { store }
    }
}

impl Authenticator for StoreAuthenticator {
    fn validate(&self, username: &str, password: &str) -> Result<AuthenticatedUser, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let Some(stored) = self.store.credentials(username)? else {
            unknown_user_hash().verify(password);
            return Err(AuthError::InvalidCredentials);
        };
        if !stored.verify(password) {
            return Err(AuthError::InvalidCredentials);
        }

        let unread = self.store.take_unread(username)?;
        Ok(AuthenticatedUser {
            token: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            unread,
        })
    }

    fn touch_last_active(&self, username: &str) -> Result<(), AuthError> {
        self.store.touch_last_active(username, now_secs())
    }
}
