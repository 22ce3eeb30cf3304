//! Server Configuration
//!
//! Configuration loaded from `CHAT_RELAY_*` environment variables. Unset or
//! unparsable values keep their defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::user_store::StorageBackend;

/// Chat relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Health/metrics HTTP listen address.
    pub metrics_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Seconds without client traffic before the connection is dropped.
    pub idle_timeout_secs: u64,
    /// Seconds a single outbound write may take before the peer is dropped.
    pub write_timeout_secs: u64,
    /// Per-connection notification queue capacity.
    pub queue_capacity: usize,
    /// Login attempts per minute per peer address (0 disables).
    pub login_rate_limit_per_min: u32,
    pub storage_backend: StorageBackend,
    pub data_dir: PathBuf,
    /// `name:password,...` accounts created at startup when missing.
    pub seed_users: Option<String>,
    /// Bearer token guarding `/metrics`.
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 7071)),
            max_connections: 1000,
            max_message_size: 64 * 1024,
            idle_timeout_secs: 300,
            write_timeout_secs: 10,
            queue_capacity: 64,
            login_rate_limit_per_min: 10,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            seed_users: None,
            metrics_token: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl ServerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, "CHAT_RELAY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(addr) = parsed(&lookup, "CHAT_RELAY_METRICS_ADDR") {
            config.metrics_addr = addr;
        }
        if let Some(val) = parsed(&lookup, "CHAT_RELAY_MAX_CONNECTIONS") {
            config.max_connections = val;
        }
        if let Some(val) = parsed(&lookup, "CHAT_RELAY_MAX_MESSAGE_SIZE") {
            config.max_message_size = val;
        }
        if let Some(val) = parsed(&lookup, "CHAT_RELAY_IDLE_TIMEOUT") {
            config.idle_timeout_secs = val;
        }
        if let Some(val) = parsed(&lookup, "CHAT_RELAY_WRITE_TIMEOUT") {
            config.write_timeout_secs = val;
        }
        // A zero-capacity queue cannot hold anything
        if let Some(val) = parsed::<usize>(&lookup, "CHAT_RELAY_QUEUE_CAPACITY") {
            if val > 0 {
                config.queue_capacity = val;
            }
        }
        if let Some(val) = parsed(&lookup, "CHAT_RELAY_LOGIN_RATE_LIMIT") {
            config.login_rate_limit_per_min = val;
        }
        if let Some(val) = lookup("CHAT_RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }
        if let Some(val) = lookup("CHAT_RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }
        config.seed_users = lookup("CHAT_RELAY_SEED_USERS").filter(|v| !v.is_empty());
        config.metrics_token = lookup("CHAT_RELAY_METRICS_TOKEN").filter(|v| !v.is_empty());

        config
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
