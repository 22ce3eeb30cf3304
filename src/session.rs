// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command Processor
//!
//! Per-connection request/response state machine:
//!
//! ```text
//! UNAUTHENTICATED --PASS ok--> AUTHENTICATED/ONLINE --GBYE/disconnect--> TERMINATED
//!                                   |  SEND -> RECEIVING
//!                                   |  DATA (RECEIVING) -> broadcast, back to OFF
//! ```
//!
//! The processor owns the connection's state exclusively. It never touches the
//! socket; it returns an [`Outcome`] and the connection handler performs the
//! writes. Leaving the ONLINE state is idempotent and also runs on drop, so a
//! token never outlives its connection.
//!
//! Authenticator calls hash passwords and hit storage, so they run on the
//! blocking pool. The connection's task awaits them without holding up the
//! other connections sharing its worker.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Authenticator};
use crate::dispatcher::{Notification, NotificationDispatcher};
use crate::metrics::RelayMetrics;
use crate::protocol::{Command, Field, Request, Response, Status};
use crate::rate_limit::RateLimiter;
use crate::token_registry::{RegistryError, TokenRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationStatus {
    Unauthenticated,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivingMode {
    Off,
    Receiving,
}

/// The authenticated session a connection currently owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub token: String,
    pub username: String,
}

/// Mutable per-connection state.
///
/// `online == Online` implies `current` is set and its token is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub authentication: AuthenticationStatus,
    pub online: OnlineStatus,
    pub receiving: ReceivingMode,
    pub current: Option<ActiveSession>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState {
            authentication: AuthenticationStatus::Unauthenticated,
            online: OnlineStatus::Offline,
            receiving: ReceivingMode::Off,
            current: None,
        }
    }
}

/// What the connection handler must do after a request.
#[derive(Debug)]
pub enum Outcome {
    /// Write the response and keep reading.
    Reply(Response),
    /// Login succeeded. Write `reply`, then `greeting` on the notification
    /// channel, then start draining `inbox`.
    LoggedIn {
        reply: Response,
        greeting: Vec<String>,
        inbox: mpsc::Receiver<String>,
    },
    /// The session went offline on request; close the connection.
    Goodbye,
}

/// Shared collaborators every processor needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Arc<TokenRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub login_limiter: Arc<RateLimiter>,
    pub metrics: RelayMetrics,
    pub queue_capacity: usize,
}

pub fn welcome_message(username: &str, unread: usize) -> String {
    format!("Welcome {}, you have {} unread messages.", username, unread)
}

pub fn unread_message(body: &str) -> String {
    format!("[Unread] {}", body)
}

pub fn online_message(username: &str) -> String {
    format!("User {} has been online now.", username)
}

pub fn offline_message(username: &str) -> String {
    format!("User {} has been offline now.", username)
}

pub fn posted_message(username: &str, body: &str) -> String {
    format!("{} posted: {}", username, body)
}

pub struct CommandProcessor {
    /// Short random label for log lines. Tokens are never logged.
    label: String,
    peer: IpAddr,
    deps: SessionDeps,
    state: ConnectionState,
}

impl CommandProcessor {
    pub fn new(label: impl Into<String>, peer: IpAddr, deps: SessionDeps) -> Self {
        CommandProcessor {
            label: label.into(),
            peer,
            deps,
            state: ConnectionState::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Processes one request.
    pub async fn handle(&mut self, request: &Request) -> Outcome {
        self.deps.metrics.requests_total.inc();

        let command = match request.non_empty(Field::Command) {
            Some(raw) => match raw.parse::<Command>() {
                Ok(command) => command,
                Err(e) => {
                    debug!("[{}] {}", self.label, e);
                    return reply(Command::Error, Status::ErrorParametersArguments);
                }
            },
            None => return reply(Command::Error, Status::ErrorParametersArguments),
        };

        let token = match request.non_empty(Field::TokenId) {
            Some(token) => token,
            None => {
                return match command {
                    Command::Helo => reply(Command::Helo, Status::AuthenticationRequired),
                    Command::Pass => self.login(request).await,
                    _ => reply(Command::Error, Status::PermissionFailed),
                };
            }
        };

        if !self.owns_session(token) {
            return reply(command, Status::AuthenticationRequired);
        }

        match command {
            Command::Gbye => {
                self.go_offline().await;
                Outcome::Goodbye
            }
            Command::Send => {
                self.state.receiving = ReceivingMode::Receiving;
                reply(Command::Send, Status::ReadyListReceiving)
            }
            Command::Data => self.post(request),
            Command::Helo | Command::Pass | Command::Error => {
                reply(command, Status::ErrorParametersArguments)
            }
        }
    }

    /// A token is accepted only while it is registered and owned by this
    /// connection. Another connection's token is as good as no token.
    fn owns_session(&self, token: &str) -> bool {
        let owned = self
            .state
            .current
            .as_ref()
            .is_some_and(|session| session.token == token);
        owned && self.deps.registry.is_valid_session(token)
    }

    /// Runs an authenticator call on the blocking pool.
    async fn authenticate<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Authenticator) -> Result<T, AuthError> + Send + 'static,
    {
        let authenticator = self.deps.authenticator.clone();
        tokio::task::spawn_blocking(move || call(authenticator.as_ref()))
            .await
            .unwrap_or_else(|e| {
                Err(AuthError::Storage(format!(
                    "authenticator task failed: {}",
                    e
                )))
            })
    }

    async fn login(&mut self, request: &Request) -> Outcome {
        if !self.deps.login_limiter.consume(self.peer) {
            warn!("[{}] Login rate limited", self.label);
            self.deps.metrics.login_failures.inc();
            return reply(Command::Pass, Status::PermissionFailed);
        }

        let username = request.non_empty(Field::User).unwrap_or_default().to_string();
        let password = request.non_empty(Field::Password).unwrap_or_default().to_string();

        let validated = self
            .authenticate(move |auth| auth.validate(&username, &password))
            .await;
        let user = match validated {
            Ok(user) => user,
            Err(AuthError::Storage(e)) => {
                error!("[{}] Authenticator failure: {}", self.label, e);
                self.deps.metrics.login_failures.inc();
                return reply(Command::Pass, Status::PermissionFailed);
            }
            Err(e) => {
                debug!("[{}] Login rejected: {}", self.label, e);
                self.deps.metrics.login_failures.inc();
                return reply(Command::Pass, Status::PermissionFailed);
            }
        };

        // One connection owns at most one token
        self.go_offline().await;

        let (outbox, inbox) = mpsc::channel(self.deps.queue_capacity);
        if let Err(RegistryError::DuplicateToken) =
            self.deps.registry.register(&user.token, &user.username, outbox)
        {
            error!("[{}] Issued token collided with an online session", self.label);
        }

        self.state = ConnectionState {
            authentication: AuthenticationStatus::Authenticated,
            online: OnlineStatus::Online,
            receiving: ReceivingMode::Off,
            current: Some(ActiveSession {
                token: user.token.clone(),
                username: user.username.clone(),
            }),
        };
        self.touch_last_active(user.username.clone()).await;
        self.deps.metrics.logins_total.inc();
        self.update_online_gauge();
        info!("[{}] {} logged in", self.label, user.username);

        let mut greeting = Vec::with_capacity(user.unread.len() + 1);
        greeting.push(welcome_message(&user.username, user.unread.len()));
        greeting.extend(user.unread.iter().map(|body| unread_message(body)));

        self.deps.dispatcher.publish(
            Notification::broadcast(online_message(&user.username)).from_origin(&user.token),
        );

        Outcome::LoggedIn {
            reply: Response::with_token(Command::Pass, Status::Success, user.token),
            greeting,
            inbox,
        }
    }

    fn post(&mut self, request: &Request) -> Outcome {
        if self.state.receiving != ReceivingMode::Receiving {
            return reply(Command::Data, Status::TransmissionFailed);
        }
        let Some(message) = request.non_empty(Field::Message) else {
            return reply(Command::Data, Status::ErrorParametersArguments);
        };
        let Some(session) = self.state.current.as_ref() else {
            return reply(Command::Data, Status::TransmissionFailed);
        };

        let report = self.deps.dispatcher.publish(
            Notification::broadcast(posted_message(&session.username, message))
                .from_origin(&session.token),
        );
        debug!(
            "[{}] Broadcast post to {} sessions",
            self.label, report.delivered
        );

        self.state.receiving = ReceivingMode::Off;
        reply(Command::Data, Status::TransferActionCompleted)
    }

    /// Leaves the ONLINE state: unregisters the token and announces it.
    /// Returns false if the connection was not online. Safe to call repeatedly.
    pub async fn go_offline(&mut self) -> bool {
        match self.leave() {
            Some(username) => {
                self.touch_last_active(username).await;
                true
            }
            None => false,
        }
    }

    /// Synchronous part of going offline. Returns the username that left.
    fn leave(&mut self) -> Option<String> {
        let session = self.state.current.take()?;
        self.state = ConnectionState::default();

        self.deps.registry.unregister(&session.token);
        self.update_online_gauge();
        self.deps.dispatcher.publish(
            Notification::broadcast(offline_message(&session.username))
                .from_origin(&session.token),
        );
        info!("[{}] {} went offline", self.label, session.username);
        Some(session.username)
    }

    async fn touch_last_active(&self, username: String) {
        if let Err(e) = self
            .authenticate(move |auth| auth.touch_last_active(&username))
            .await
        {
            warn!("[{}] Failed to update last active time: {}", self.label, e);
        }
    }

    /// Fire-and-forget variant for paths that cannot await.
    fn touch_last_active_detached(&self, username: String) {
        let authenticator = self.deps.authenticator.clone();
        let label = self.label.clone();
        let touch = move || {
            if let Err(e) = authenticator.touch_last_active(&username) {
                warn!("[{}] Failed to update last active time: {}", label, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(touch);
            }
            Err(_) => touch(),
        }
    }

    fn update_online_gauge(&self) {
        self.deps
            .metrics
            .sessions_online
            .set(self.deps.registry.online_count() as i64);
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if let Some(username) = self.leave() {
            self.touch_last_active_detached(username);
        }
    }
}

fn reply(command: Command, status: Status) -> Outcome {
    Outcome::Reply(Response::new(command, status))
}
