//! Prometheus Metrics
//!
//! Counters and gauges for connections, logins, and notification fan-out.

use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Relay server metrics. Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct RelayMetrics {
    pub registry: Arc<Registry>,

    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Currently open WebSocket connections.
    pub connections_active: IntGauge,
    /// Rejected or failed connections (limit reached, handshake errors).
    pub connection_errors: IntCounter,

    /// Requests processed by the command processor.
    pub requests_total: IntCounter,
    /// Successful logins.
    pub logins_total: IntCounter,
    /// Failed or throttled logins.
    pub login_failures: IntCounter,
    /// Sessions currently registered as online.
    pub sessions_online: IntGauge,

    /// Notifications enqueued for delivery.
    pub notifications_delivered: IntCounter,
    /// Notifications dropped because the destination queue was full or gone.
    pub notifications_dropped: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter names are unique");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge names are unique");
    gauge
}

impl RelayMetrics {
    /// Creates a new metrics instance with its own registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        RelayMetrics {
            connections_total: counter(
                &registry,
                "chat_relay_connections_total",
                "Total WebSocket connections accepted",
            ),
            connections_active: gauge(
                &registry,
                "chat_relay_connections_active",
                "Current active WebSocket connections",
            ),
            connection_errors: counter(
                &registry,
                "chat_relay_connection_errors_total",
                "Total rejected or failed connections",
            ),
            requests_total: counter(
                &registry,
                "chat_relay_requests_total",
                "Total requests processed",
            ),
            logins_total: counter(&registry, "chat_relay_logins_total", "Successful logins"),
            login_failures: counter(
                &registry,
                "chat_relay_login_failures_total",
                "Failed or throttled logins",
            ),
            sessions_online: gauge(
                &registry,
                "chat_relay_sessions_online",
                "Sessions currently online",
            ),
            notifications_delivered: counter(
                &registry,
                "chat_relay_notifications_delivered_total",
                "Notifications enqueued for delivery",
            ),
            notifications_dropped: counter(
                &registry,
                "chat_relay_notifications_dropped_total",
                "Notifications dropped (queue full or closed)",
            ),
            registry: Arc::new(registry),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
