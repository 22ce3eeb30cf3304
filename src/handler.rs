// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Owns one client connection: reads request frames, hands them to the
//! [`CommandProcessor`], writes responses, and drains the session's
//! notification queue onto the same socket. Both channels share one task, so
//! a response is always written before any notification its request caused
//! for this connection.

use std::net::IpAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    decode_request, encode_frame, Command, Response, ServerFrame, Status, CLOSE_SENTINEL,
};
use crate::session::{CommandProcessor, Outcome, SessionDeps};

/// Shared dependencies for handling a WebSocket connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub session: SessionDeps,
    pub max_message_size: usize,
    pub idle_timeout: Duration,
    /// Upper bound on a single outbound write. A peer slower than this is
    /// dropped.
    pub write_timeout: Duration,
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Client sent GBYE.
    Goodbye,
    /// The session's queue was closed from outside (slow peer or replaced token).
    Evicted,
    IdleTimeout,
    PeerClosed,
    TransportError,
}

impl ExitReason {
    /// Whether the socket can still take the closing sentinel.
    fn transport_usable(self) -> bool {
        matches!(
            self,
            ExitReason::Goodbye | ExitReason::Evicted | ExitReason::IdleTimeout
        )
    }
}

enum Event {
    Inbound(Option<Result<Message, tungstenite::Error>>),
    IdleTimeout,
    Queued(Option<String>),
}

/// Transport limits matching the codec's frame limit, so oversized messages
/// are refused before they are buffered.
pub fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Next queued notification, or never if the connection has no session yet.
async fn recv_queued(inbox: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Writes one message. Returns false if the peer is gone or too slow.
async fn send_message<W>(write: &mut W, message: Message, write_timeout: Duration) -> bool
where
    W: Sink<Message> + Unpin,
{
    matches!(
        timeout(write_timeout, write.send(message)).await,
        Ok(Ok(()))
    )
}

/// Encodes and writes one server frame.
async fn send_frame<W>(write: &mut W, frame: &ServerFrame, write_timeout: Duration) -> bool
where
    W: Sink<Message> + Unpin,
{
    let data = match encode_frame(frame) {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to encode frame: {}", e);
            return false;
        }
    };
    send_message(write, Message::Binary(data), write_timeout).await
}

/// Handles a WebSocket connection until GBYE, disconnect, or eviction.
pub async fn handle_connection<S>(
    ws_stream: WebSocketStream<S>,
    peer: IpAddr,
    deps: ConnectionDeps,
) -> ExitReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ConnectionDeps {
        session: session_deps,
        max_message_size,
        idle_timeout,
        write_timeout,
    } = deps;
    // Random label for logging. Tokens and usernames of idle peers stay out of logs.
    let session = &uuid::Uuid::new_v4().to_string()[..8];
    let metrics = session_deps.metrics.clone();
    let mut processor = CommandProcessor::new(session, peer, session_deps);

    let (mut write, mut read) = ws_stream.split();
    let mut inbox: Option<mpsc::Receiver<String>> = None;

    debug!("[{}] Connected", session);

    let reason = loop {
        let event = tokio::select! {
            inbound = timeout(idle_timeout, read.next()) => match inbound {
                Ok(msg) => Event::Inbound(msg),
                Err(_) => Event::IdleTimeout,
            },
            queued = recv_queued(&mut inbox) => Event::Queued(queued),
        };

        match event {
            Event::IdleTimeout => {
                warn!("[{}] Idle timeout", session);
                break ExitReason::IdleTimeout;
            }
            Event::Queued(Some(body)) => {
                let frame = ServerFrame::notification(body);
                if !send_frame(&mut write, &frame, write_timeout).await {
                    warn!("[{}] Failed to deliver notification", session);
                    break ExitReason::TransportError;
                }
            }
            Event::Queued(None) => {
                warn!("[{}] Notification queue closed, disconnecting", session);
                break ExitReason::Evicted;
            }
            Event::Inbound(None) => {
                debug!("[{}] Disconnected", session);
                break ExitReason::PeerClosed;
            }
            Event::Inbound(Some(Err(e))) => {
                warn!("[{}] Connection error: {}", session, e);
                break ExitReason::TransportError;
            }
            Event::Inbound(Some(Ok(Message::Binary(data)))) => {
                let request = match decode_request(&data, max_message_size) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("[{}] Malformed frame: {}", session, e);
                        let reply = Response::new(Command::Error, Status::ErrorParametersArguments);
                        if !send_frame(&mut write, &reply.into(), write_timeout).await {
                            break ExitReason::TransportError;
                        }
                        continue;
                    }
                };

                match processor.handle(&request).await {
                    Outcome::Reply(reply) => {
                        if !send_frame(&mut write, &reply.into(), write_timeout).await {
                            break ExitReason::TransportError;
                        }
                    }
                    Outcome::LoggedIn {
                        reply,
                        greeting,
                        inbox: rx,
                    } => {
                        // Replaces (and closes) the queue of a previous session
                        inbox = Some(rx);
                        if !send_frame(&mut write, &reply.into(), write_timeout).await {
                            break ExitReason::TransportError;
                        }
                        let mut delivered = true;
                        for line in greeting {
                            let frame = ServerFrame::notification(line);
                            if !send_frame(&mut write, &frame, write_timeout).await {
                                delivered = false;
                                break;
                            }
                        }
                        if !delivered {
                            break ExitReason::TransportError;
                        }
                    }
                    Outcome::Goodbye => break ExitReason::Goodbye,
                }
            }
            Event::Inbound(Some(Ok(Message::Ping(data)))) => {
                if !send_message(&mut write, Message::Pong(data), write_timeout).await {
                    warn!("[{}] Failed to answer ping", session);
                    break ExitReason::TransportError;
                }
            }
            Event::Inbound(Some(Ok(Message::Close(_)))) => {
                debug!("[{}] Client sent close", session);
                break ExitReason::PeerClosed;
            }
            Event::Inbound(Some(Ok(_))) => {
                // Ignore text, pong, etc.
            }
        }
    };

    // Offline cleanup runs on every exit path and is a no-op after GBYE
    processor.go_offline().await;
    drop(inbox);

    if reason == ExitReason::TransportError {
        metrics.connection_errors.inc();
    }
    if reason.transport_usable() {
        let sentinel = ServerFrame::notification(CLOSE_SENTINEL);
        if send_frame(&mut write, &sentinel, write_timeout).await {
            let _ = timeout(write_timeout, write.close()).await;
        }
    }

    info!("[{}] Connection closed ({:?})", session, reason);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_queued_without_session_never_resolves() {
        let mut inbox: Option<mpsc::Receiver<String>> = None;
        let result = timeout(Duration::from_millis(20), recv_queued(&mut inbox)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recv_queued_drains_in_order_then_reports_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut inbox = Some(rx);
        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();
        drop(tx);

        assert_eq!(recv_queued(&mut inbox).await.as_deref(), Some("one"));
        assert_eq!(recv_queued(&mut inbox).await.as_deref(), Some("two"));
        assert_eq!(recv_queued(&mut inbox).await, None);
    }

    #[tokio::test]
    async fn test_send_message_reports_sink_errors() {
        let sink = futures_util::sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        });
        futures_util::pin_mut!(sink);
        let pong = Message::Pong(vec![1]);
        assert!(!send_message(&mut sink, pong, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_send_message_gives_up_after_write_timeout() {
        let sink = futures_util::sink::unfold((), |(), _msg: Message| {
            std::future::pending::<Result<(), std::io::Error>>()
        });
        futures_util::pin_mut!(sink);
        let pong = Message::Pong(vec![1]);
        assert!(!send_message(&mut sink, pong, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_send_frame_writes_encoded_binary() {
        let mut sent = Vec::new();
        {
            let sink = futures_util::sink::unfold(&mut sent, |sent, msg: Message| async move {
                sent.push(msg);
                Ok::<_, std::io::Error>(sent)
            });
            futures_util::pin_mut!(sink);
            let frame = ServerFrame::notification("hi");
            assert!(send_frame(&mut sink, &frame, Duration::from_secs(1)).await);
        }
        let expected = encode_frame(&ServerFrame::notification("hi")).unwrap();
        assert_eq!(sent, vec![Message::Binary(expected)]);
    }

    #[test]
    fn test_websocket_config_caps_messages() {
        let config = websocket_config(4096);
        assert_eq!(config.max_message_size, Some(4096));
        assert_eq!(config.max_frame_size, Some(4096));
    }

    #[test]
    fn test_transport_usable() {
        assert!(ExitReason::Goodbye.transport_usable());
        assert!(ExitReason::Evicted.transport_usable());
        assert!(ExitReason::IdleTimeout.transport_usable());
        assert!(!ExitReason::PeerClosed.transport_usable());
        assert!(!ExitReason::TransportError.transport_usable());
    }
}
