//! Connection Limiting
//!
//! Caps concurrent client connections. Each accepted socket holds a permit
//! for its whole lifetime; the permit returns to the pool when dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct ConnectionLimiter {
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Takes a slot without waiting. `None` when at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionGuard { _permit: permit })
    }

    pub fn active_count(&self) -> usize {
        self.max_connections - self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Releases its slot on drop.
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
}
