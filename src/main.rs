// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! Authenticated broadcast messaging over WebSocket.
//! Provides:
//! - WebSocket endpoint for login, posting and pushed notifications
//! - HTTP endpoints for health checks and Prometheus metrics
//! - Login rate limiting and connection limits

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async_with_config;
use tracing::{error, info, warn};

use chat_relay::auth::{AuthError, Authenticator, StoreAuthenticator};
use chat_relay::config::ServerConfig;
use chat_relay::connection_limit::ConnectionLimiter;
use chat_relay::dispatcher::NotificationDispatcher;
use chat_relay::handler::{self, ConnectionDeps};
use chat_relay::http::{create_router, HttpState};
use chat_relay::metrics::RelayMetrics;
use chat_relay::rate_limit::RateLimiter;
use chat_relay::session::SessionDeps;
use chat_relay::token_registry::TokenRegistry;
use chat_relay::user_store::{create_user_store, parse_seed_users, UserStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env();
    let start_time = Instant::now();

    info!("Starting Chat Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    let store: Arc<dyn UserStore> = Arc::from(
        create_user_store(config.storage_backend, Some(&config.data_dir))
            .context("Failed to open user store")?,
    );

    if let Some(ref seed) = config.seed_users {
        for (username, password) in parse_seed_users(seed) {
            match store.create_user(&username, &password) {
                Ok(()) => info!("Created seed user {}", username),
                Err(AuthError::UserExists(_)) => {}
                Err(e) => warn!("Failed to create seed user {}: {}", username, e),
            }
        }
    }
    info!("Registered users: {}", store.user_count());

    let metrics = RelayMetrics::new();
    let registry = Arc::new(TokenRegistry::new());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry.clone(),
        metrics.clone(),
    ));
    let authenticator: Arc<dyn Authenticator> = Arc::new(StoreAuthenticator::new(store));
    let login_limiter = Arc::new(RateLimiter::new(config.login_rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.metrics_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
    }

    // Start HTTP server for health/metrics
    let http_router = create_router(HttpState {
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        registry: registry.clone(),
        started: start_time,
    });
    let http_listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.metrics_addr))?;
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // Remove stale login buckets every 10 minutes
    let cleanup_limiter = login_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(600)).await;
            let removed = cleanup_limiter.cleanup_inactive(Duration::from_secs(1800));
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    let deps = ConnectionDeps {
        session: SessionDeps {
            authenticator,
            registry,
            dispatcher,
            login_limiter,
            metrics: metrics.clone(),
            queue_capacity: config.queue_capacity,
        },
        max_message_size: config.max_message_size,
        idle_timeout: config.idle_timeout(),
        write_timeout: config.write_timeout(),
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind WebSocket listener on {}", config.listen_addr))?;
    info!("WebSocket server listening on {}", config.listen_addr);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let connection_guard = match connection_limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    connection_limiter.active_count(),
                    connection_limiter.max_connections()
                );
                metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        let metrics = metrics.clone();
        let handshake_timeout = deps.idle_timeout;
        let ws_config = handler::websocket_config(deps.max_message_size);

        tokio::spawn(async move {
            // Keep the guard alive for the duration of the connection
            let _guard = connection_guard;

            match tokio::time::timeout(
                handshake_timeout,
                accept_async_with_config(stream, Some(ws_config)),
            )
            .await
            {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();
                    handler::handle_connection(ws_stream, addr.ip(), deps).await;
                    metrics.connections_active.dec();
                }
                Ok(Err(e)) => {
                    warn!("WebSocket handshake failed: {}", e);
                    metrics.connection_errors.inc();
                }
                Err(_) => {
                    warn!("WebSocket handshake timeout");
                    metrics.connection_errors.inc();
                }
            }
        });
    }
}
