// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Command and status vocabularies, the field-keyed request map, and the
//! length-prefixed JSON framing used on the WebSocket transport.
//!
//! Client frames are flat JSON objects of field name to string value:
//!
//! ```text
//! {"COMMAND": "PASS", "USER": "alice", "PASSWORD": "secret"}
//! ```
//!
//! Server frames are tagged so the client can tell command responses apart
//! from pushed notifications sharing the same socket.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Body pushed on the notification channel right before the server closes it.
pub const CLOSE_SENTINEL: &str = "exit";

/// Commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Helo,
    Pass,
    Gbye,
    Send,
    Data,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Helo => "HELO",
            Command::Pass => "PASS",
            Command::Gbye => "GBYE",
            Command::Send => "SEND",
            Command::Data => "DATA",
            Command::Error => "ERROR",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a `COMMAND` value is not part of the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELO" => Ok(Command::Helo),
            "PASS" => Ok(Command::Pass),
            "GBYE" => Ok(Command::Gbye),
            "SEND" => Ok(Command::Send),
            "DATA" => Ok(Command::Data),
            "ERROR" => Ok(Command::Error),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Status codes carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    PermissionFailed,
    AuthenticationRequired,
    ErrorParametersArguments,
    ReadyListReceiving,
    TransmissionFailed,
    TransferActionCompleted,
}

/// Request fields recognized by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    TokenId,
    Command,
    User,
    Password,
    Message,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TokenId => "TOKEN_ID",
            Field::Command => "COMMAND",
            Field::User => "USER",
            Field::Password => "PASSWORD",
            Field::Message => "MESSAGE",
        }
    }
}

/// One decoded inbound request. Lives for a single command-processing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    fields: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, mostly for clients and tests.
    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.fields.insert(field.as_str().to_string(), value.into());
        self
    }

    /// Raw field value, including empty strings.
    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields.get(field.as_str()).map(String::as_str)
    }

    /// Field value with empty strings treated as missing.
    pub fn non_empty(&self, field: Field) -> Option<&str> {
        self.get(field).filter(|v| !v.is_empty())
    }
}

impl From<HashMap<String, String>> for Request {
    fn from(fields: HashMap<String, String>) -> Self {
        Request { fields }
    }
}

/// A command tag plus status code. `PASS/SUCCESS` also carries the new token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub command: Command,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Response {
    pub fn new(command: Command, status: Status) -> Self {
        Response {
            command,
            status,
            token: None,
        }
    }

    pub fn with_token(command: Command, status: Status, token: impl Into<String>) -> Self {
        Response {
            command,
            status,
            token: Some(token.into()),
        }
    }
}

/// Everything the server writes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Answer to the request just processed.
    Response(Response),
    /// Asynchronously pushed message body.
    Notification { body: String },
}

impl ServerFrame {
    pub fn notification(body: impl Into<String>) -> Self {
        ServerFrame::Notification { body: body.into() }
    }
}

impl From<Response> for ServerFrame {
    fn from(response: Response) -> Self {
        ServerFrame::Response(response)
    }
}

/// Frame-level decoding failures. All of them are recoverable.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("frame length prefix {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

fn frame(json: Vec<u8>) -> Vec<u8> {
    let len = json.len() as u32;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&json);
    out
}

fn unframe(data: &[u8], max_size: usize) -> Result<&[u8], FrameError> {
    if data.len() > max_size {
        return Err(FrameError::TooLarge {
            size: data.len(),
            limit: max_size,
        });
    }
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::TooShort(data.len()));
    }
    let (header, payload) = data.split_at(FRAME_HEADER_SIZE);
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Decodes a client request frame.
pub fn decode_request(data: &[u8], max_size: usize) -> Result<Request, FrameError> {
    let payload = unframe(data, max_size)?;
    let fields: HashMap<String, String> = serde_json::from_slice(payload)?;
    Ok(Request::from(fields))
}

/// Encodes a client request frame.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, FrameError> {
    Ok(frame(serde_json::to_vec(&request.fields)?))
}

/// Encodes a server frame.
pub fn encode_frame(server_frame: &ServerFrame) -> Result<Vec<u8>, FrameError> {
    Ok(frame(serde_json::to_vec(server_frame)?))
}

/// Decodes a server frame (client side).
pub fn decode_frame(data: &[u8], max_size: usize) -> Result<ServerFrame, FrameError> {
    let payload = unframe(data, max_size)?;
    Ok(serde_json::from_slice(payload)?)
}
