// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for chat relay integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::auth::StoreAuthenticator;
use chat_relay::dispatcher::NotificationDispatcher;
use chat_relay::handler::{self, websocket_config, ConnectionDeps};
use chat_relay::metrics::RelayMetrics;
use chat_relay::protocol::{
    decode_frame, encode_request, Command, Field, Request, ServerFrame, Status,
};
use chat_relay::rate_limit::RateLimiter;
use chat_relay::session::SessionDeps;
use chat_relay::token_registry::TokenRegistry;
use chat_relay::user_store::{MemoryUserStore, UserStore};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_USERS: &[(&str, &str)] = &[
    ("alice", "alice-pw"),
    ("bob", "bob-pw"),
    ("carol", "carol-pw"),
];

/// A running server plus handles on its shared state.
pub struct TestServer {
    pub url: String,
    pub store: Arc<MemoryUserStore>,
    pub registry: Arc<TokenRegistry>,
    pub metrics: RelayMetrics,
}

/// Knobs that differ between tests.
pub struct TestOptions {
    pub login_rate_limit: u32,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for TestOptions {
    fn default() -> Self {
        TestOptions {
            login_rate_limit: 0,
            queue_capacity: 64,
            idle_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
        }
    }
}

/// Creates a memory user store holding [`TEST_USERS`].
pub fn create_test_store() -> Arc<MemoryUserStore> {
    let store = Arc::new(MemoryUserStore::new());
    for (name, password) in TEST_USERS {
        store.create_user(name, password).unwrap();
    }
    store
}

/// Starts a server on an ephemeral port that accepts any number of clients.
pub async fn start_test_server(options: TestOptions) -> TestServer {
    let store = create_test_store();
    let metrics = RelayMetrics::new();
    let registry = Arc::new(TokenRegistry::new());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry.clone(),
        metrics.clone(),
    ));

    let deps = ConnectionDeps {
        session: SessionDeps {
            authenticator: Arc::new(StoreAuthenticator::new(store.clone())),
            registry: registry.clone(),
            dispatcher,
            login_limiter: Arc::new(RateLimiter::new(options.login_rate_limit)),
            metrics: metrics.clone(),
            queue_capacity: options.queue_capacity,
        },
        max_message_size: options.max_message_size,
        idle_timeout: options.idle_timeout,
        write_timeout: Duration::from_secs(5),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let deps = deps.clone();
            let config = websocket_config(deps.max_message_size);
            tokio::spawn(async move {
                if let Ok(ws) = accept_async_with_config(stream, Some(config)).await {
                    handler::handle_connection(ws, peer.ip(), deps).await;
                }
            });
        }
    });

    TestServer {
        url,
        store,
        registry,
        metrics,
    }
}

pub async fn connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

pub fn request(command: &str) -> Request {
    Request::new().with(Field::Command, command)
}

pub fn with_token(command: &str, token: &str) -> Request {
    request(command).with(Field::TokenId, token)
}

pub fn pass(user: &str, password: &str) -> Request {
    request("PASS")
        .with(Field::User, user)
        .with(Field::Password, password)
}

pub async fn send(ws: &mut WsClient, req: &Request) {
    let frame = encode_request(req).unwrap();
    ws.send(Message::Binary(frame)).await.unwrap();
}

/// Receives the next server frame.
pub async fn recv(ws: &mut WsClient) -> ServerFrame {
    let msg = timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Binary(data) => decode_frame(&data, usize::MAX).unwrap(),
        other => panic!("Expected Binary message, got {:?}", other),
    }
}

/// Try to receive a frame with a short timeout. Returns None if nothing arrives.
pub async fn try_recv(ws: &mut WsClient) -> Option<ServerFrame> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => decode_frame(&data, usize::MAX).ok(),
        _ => None,
    }
}

/// Sends a request and returns the response `(command, status, token)`.
pub async fn send_recv(ws: &mut WsClient, req: &Request) -> (Command, Status, Option<String>) {
    send(ws, req).await;
    match recv(ws).await {
        ServerFrame::Response(r) => (r.command, r.status, r.token),
        other => panic!("Expected Response, got {:?}", other),
    }
}

/// Receives the next frame and expects it to be a notification.
pub async fn recv_notification(ws: &mut WsClient) -> String {
    match recv(ws).await {
        ServerFrame::Notification { body } => body,
        other => panic!("Expected Notification, got {:?}", other),
    }
}

/// Logs in and consumes the welcome line. Returns the token and the welcome.
pub async fn login(ws: &mut WsClient, user: &str, password: &str) -> (String, String) {
    let (command, status, token) = send_recv(ws, &pass(user, password)).await;
    assert_eq!(command, Command::Pass);
    assert_eq!(status, Status::Success);
    let token = token.expect("PASS/SUCCESS carries a token");
    let welcome = recv_notification(ws).await;
    (token, welcome)
}

/// Reads until the server ends the stream. Panics if a data frame arrives.
pub async fn expect_closed(ws: &mut WsClient) {
    loop {
        match timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timeout waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Binary(data))) => {
                panic!("Expected close, got {:?}", decode_frame(&data, usize::MAX))
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Waits until `cond` holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
