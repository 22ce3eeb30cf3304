// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Notification Dispatcher
//!
//! Decouples "a message was produced" from "a message reached a socket".
//! Publishing is a non-blocking `try_send` onto each destination's bounded
//! queue; the destination's own handler drains the queue and performs the
//! write. Per-destination order follows publish order.
//!
//! Overflow policy: a destination whose queue is full is treated as a slow
//! peer and disconnected. Its token is unregistered, which closes the queue;
//! the handler sees the closed queue and runs its offline cleanup. The
//! publisher never waits.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::metrics::RelayMetrics;
use crate::token_registry::{OnlineSession, TokenRegistry};

/// Who a notification is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One specific session.
    Session(String),
    /// Every online session except the origin, if any.
    Broadcast,
}

/// An immutable message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    target: Target,
    body: String,
    origin: Option<String>,
}

impl Notification {
    pub fn to_session(token: impl Into<String>, body: impl Into<String>) -> Self {
        Notification {
            target: Target::Session(token.into()),
            body: body.into(),
            origin: None,
        }
    }

    pub fn broadcast(body: impl Into<String>) -> Self {
        Notification {
            target: Target::Broadcast,
            body: body.into(),
            origin: None,
        }
    }

    /// Marks the session that produced this notification. Broadcasts skip it.
    pub fn from_origin(mut self, token: impl Into<String>) -> Self {
        self.origin = Some(token.into());
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Destinations the body was enqueued for.
    pub delivered: usize,
    /// Destinations that were evicted because their queue was full.
    pub evicted: usize,
}

pub struct NotificationDispatcher {
    registry: Arc<TokenRegistry>,
    metrics: RelayMetrics,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<TokenRegistry>, metrics: RelayMetrics) -> Self {
        NotificationDispatcher { registry, metrics }
    }

    /// Delivers a notification to its target(s).
    ///
    /// A session target that is no longer online is a tolerated race with
    /// disconnect and results in an empty report.
    pub fn publish(&self, notification: Notification) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match notification.target() {
            Target::Session(token) => {
                if let Some(session) = self.registry.lookup(token) {
                    self.enqueue(token, &session, notification.body(), &mut report);
                } else {
                    debug!("Notification target no longer online");
                }
            }
            Target::Broadcast => {
                for (token, session) in self.registry.snapshot() {
                    if notification.origin() == Some(token.as_str()) {
                        continue;
                    }
                    self.enqueue(&token, &session, notification.body(), &mut report);
                }
            }
        }

        report
    }

    fn enqueue(
        &self,
        token: &str,
        session: &OnlineSession,
        body: &str,
        report: &mut DeliveryReport,
    ) {
        match session.outbox.try_send(body.to_string()) {
            Ok(()) => {
                report.delivered += 1;
                self.metrics.notifications_delivered.inc();
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Notification queue full for {}, disconnecting slow session",
                    session.username
                );
                self.metrics.notifications_dropped.inc();
                if self.registry.unregister(token) {
                    report.evicted += 1;
                }
            }
            Err(TrySendError::Closed(_)) => {
                // Handler already gone; its cleanup will unregister the token.
                debug!("Notification queue closed for {}", session.username);
                self.metrics.notifications_dropped.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<TokenRegistry>, NotificationDispatcher) {
        let registry = Arc::new(TokenRegistry::new());
        let dispatcher = NotificationDispatcher::new(registry.clone(), RelayMetrics::new());
        (registry, dispatcher)
    }

    fn online(registry: &TokenRegistry, token: &str, capacity: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        registry.register(token, token, tx).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_target() {
        let (registry, dispatcher) = setup();
        let mut a = online(&registry, "a", 8);
        let mut b = online(&registry, "b", 8);

        let report = dispatcher.publish(Notification::to_session("a", "for a"));
        assert_eq!(report.delivered, 1);
        assert_eq!(a.recv().await.unwrap(), "for a");
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_unicast_to_offline_token_is_noop() {
        let (_registry, dispatcher) = setup();
        let report = dispatcher.publish(Notification::to_session("gone", "x"));
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let (registry, dispatcher) = setup();
        let mut a = online(&registry, "a", 8);
        let mut b = online(&registry, "b", 8);
        let mut c = online(&registry, "c", 8);

        let report = dispatcher.publish(Notification::broadcast("hey").from_origin("a"));
        assert_eq!(report.delivered, 2);
        assert_eq!(b.recv().await.unwrap(), "hey");
        assert_eq!(c.recv().await.unwrap(), "hey");
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_without_origin_reaches_everyone() {
        let (registry, dispatcher) = setup();
        let mut a = online(&registry, "a", 8);
        let mut b = online(&registry, "b", 8);

        dispatcher.publish(Notification::broadcast("all"));
        assert_eq!(a.recv().await.unwrap(), "all");
        assert_eq!(b.recv().await.unwrap(), "all");
    }

    #[tokio::test]
    async fn test_per_destination_fifo() {
        let (registry, dispatcher) = setup();
        let mut a = online(&registry, "a", 16);

        for i in 0..10 {
            dispatcher.publish(Notification::broadcast(format!("m{}", i)));
        }
        for i in 0..10 {
            assert_eq!(a.recv().await.unwrap(), format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_full_queue_evicts_slow_session() {
        let (registry, dispatcher) = setup();
        let mut slow = online(&registry, "slow", 1);
        let mut fast = online(&registry, "fast", 8);

        dispatcher.publish(Notification::broadcast("one"));
        let report = dispatcher.publish(Notification::broadcast("two"));

        assert_eq!(report.evicted, 1);
        assert!(!registry.is_valid_session("slow"));
        assert!(registry.is_valid_session("fast"));

        // Slow session drains what it had, then sees its queue closed
        assert_eq!(slow.recv().await.unwrap(), "one");
        assert!(slow.recv().await.is_none());

        assert_eq!(fast.recv().await.unwrap(), "one");
        assert_eq!(fast.recv().await.unwrap(), "two");
    }

    #[test]
    fn test_closed_queue_counts_as_dropped() {
        let (registry, dispatcher) = setup();
        let rx = online(&registry, "a", 4);
        drop(rx);

        let report = dispatcher.publish(Notification::to_session("a", "lost"));
        assert_eq!(report.delivered, 0);
        assert_eq!(dispatcher.metrics.notifications_dropped.get(), 1);
    }
}
