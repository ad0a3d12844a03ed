//! Wire frame types for the edge ↔ client duplex stream.
//!
//! A single bidirectional stream carries a sequence of [`Frame`] values,
//! each bincode-encoded and length-prefixed (see [`crate::codec`]). Five
//! variants cover the whole protocol: control handshakes, requests,
//! responses, errors, and heartbeats.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::headers::HeaderMultiMap;

/// Hard ceiling on a single encoded frame, including its length prefix.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Request(RequestFrame),
    Response(ResponseFrame),
    Error(ErrorFrame),
    Heartbeat(HeartbeatFrame),
}

/// A control frame. `kind = Unknown` is overloaded today to carry the
/// registration handshake (see [`crate::registration`]) — spec.md §9 flags
/// this as an accidental wire encoding that a clean reimplementation
/// should give its own variant; [`Frame::Register`]-shaped helpers live in
/// the `registration` module and convert to/from this shape so the wire
/// grammar stays bit-exact while call sites never touch raw strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFrame {
    pub kind: ControlKind,
    /// Overloaded carrier for the registration tuple / assigned tunnel id.
    pub tunnel_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlKind {
    Unknown,
    Ack,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: Uuid,
    pub tunnel_id: Uuid,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: Uuid,
    pub tunnel_id: Uuid,
    pub payload: Payload,
    pub end_of_stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorFrame {
    pub request_id: Uuid,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatFrame {
    pub tunnel_id: Option<Uuid>,
    pub server_timestamp_unix_ms: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Http(HttpPayload),
    Tcp(TcpChunk),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpPayload {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMultiMap,
    pub body: Vec<u8>,
    pub remote_addr: String,
    /// Only populated on response frames.
    pub status: Option<u16>,
}

impl HttpPayload {
    pub fn request(
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMultiMap,
        body: Vec<u8>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body,
            remote_addr: remote_addr.into(),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpChunk {
    pub bytes: Vec<u8>,
    pub sequence: u64,
}

/// Error kinds surfaced by the core (spec.md §7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    InvalidArgument,
    AlreadyExists,
    ResourceExhausted,
    FailedPrecondition,
    DeadlineExceeded,
    Unavailable,
    Internal,
}
