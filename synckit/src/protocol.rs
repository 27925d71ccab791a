//! JSON wire protocol for the sync hub.
//!
//! Every frame is a UTF-8 text JSON object with a `type` discriminator:
//! ```text
//! {"type": "delta", "id": "…", "timestamp": 1700000000000,
//!  "documentId": "doc1", "delta": {…}, "vectorClock": {"a": 1}}
//! ```
//!
//! The discriminator is snake_case; every other field is camelCase.
//! Payload fields the hub never interprets (`delta`, `state`,
//! `permissions`, `details`) are carried as raw [`serde_json::Value`]
//! and re-emitted structurally unchanged on broadcast. Vector-clock
//! counters above 2^53 - 1 are rejected at decode, never truncated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::clock::VectorClock;

/// Wire `reason` strings for `error` frames.
pub mod reason {
    pub const INVALID_FRAME: &str = "invalid_frame";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown_message_type";
    pub const FRAME_TOO_LARGE: &str = "frame_too_large";
    pub const NOT_AUTHENTICATED: &str = "not_authenticated";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const AUTH_TIMEOUT: &str = "auth_timeout";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const NOT_SUBSCRIBED: &str = "not_subscribed";
    pub const CAUSALITY_VIOLATION: &str = "causality_violation";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// All `type` values the decoder accepts, exactly as they appear on the
/// wire.
pub const MESSAGE_TYPES: &[&str] = &[
    "connect",
    "disconnect",
    "ping",
    "pong",
    "auth",
    "auth_success",
    "auth_error",
    "subscribe",
    "unsubscribe",
    "sync_request",
    "sync_response",
    "delta",
    "ack",
    "awareness_update",
    "awareness_subscribe",
    "awareness_state",
    "error",
];

/// One delta as carried inside a `sync_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEnvelope {
    /// Opaque delta payload, passed through unchanged.
    pub delta: Value,
    pub vector_clock: VectorClock,
}

/// One client's presence entry as carried inside `awareness_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessPeer {
    pub client_id: String,
    /// Opaque presence state, passed through unchanged.
    pub state: Value,
    pub clock: u64,
}

/// Top-level protocol message, tagged by `type`.
///
/// Every variant carries `id` (sender-unique) and `timestamp` (Unix
/// milliseconds, informational only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Server greeting emitted after the WebSocket upgrade.
    Connect { id: String, timestamp: i64 },

    /// Client-initiated clean close notice.
    Disconnect { id: String, timestamp: i64 },

    Ping { id: String, timestamp: i64 },

    #[serde(rename_all = "camelCase")]
    Pong {
        id: String,
        timestamp: i64,
        /// `id` of the ping being answered.
        message_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Auth {
        id: String,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        /// Client-chosen identifier used in vector clocks.
        client_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        id: String,
        timestamp: i64,
        user_id: String,
        /// Opaque permission set, passed through unchanged.
        permissions: Value,
    },

    AuthError {
        id: String,
        timestamp: i64,
        reason: String,
    },

    #[serde(rename_all = "camelCase")]
    Subscribe {
        id: String,
        timestamp: i64,
        document_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        id: String,
        timestamp: i64,
        document_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SyncRequest {
        id: String,
        timestamp: i64,
        document_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        vector_clock: Option<VectorClock>,
    },

    #[serde(rename_all = "camelCase")]
    SyncResponse {
        id: String,
        timestamp: i64,
        /// `id` of the subscribe or sync_request being answered.
        request_id: String,
        document_id: String,
        /// The document's vector clock at response time.
        state: Value,
        deltas: Vec<DeltaEnvelope>,
    },

    #[serde(rename_all = "camelCase")]
    Delta {
        id: String,
        timestamp: i64,
        document_id: String,
        /// Opaque delta payload, passed through unchanged.
        delta: Value,
        vector_clock: VectorClock,
    },

    #[serde(rename_all = "camelCase")]
    Ack {
        id: String,
        timestamp: i64,
        /// `id` of the message being acknowledged.
        message_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AwarenessUpdate {
        id: String,
        timestamp: i64,
        document_id: String,
        client_id: String,
        /// Opaque presence state; `null` means the client has left.
        state: Value,
        clock: u64,
    },

    #[serde(rename_all = "camelCase")]
    AwarenessSubscribe {
        id: String,
        timestamp: i64,
        document_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AwarenessState {
        id: String,
        timestamp: i64,
        document_id: String,
        states: Vec<AwarenessPeer>,
    },

    Error {
        id: String,
        timestamp: i64,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

/// Wall-clock Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    /// Server greeting.
    pub fn connect() -> Self {
        Message::Connect {
            id: fresh_id(),
            timestamp: now_millis(),
        }
    }

    pub fn ping() -> Self {
        Message::Ping {
            id: fresh_id(),
            timestamp: now_millis(),
        }
    }

    pub fn pong(message_id: impl Into<String>) -> Self {
        Message::Pong {
            id: fresh_id(),
            timestamp: now_millis(),
            message_id: message_id.into(),
        }
    }

    pub fn ack(message_id: impl Into<String>) -> Self {
        Message::Ack {
            id: fresh_id(),
            timestamp: now_millis(),
            message_id: message_id.into(),
        }
    }

    pub fn auth_success(user_id: impl Into<String>, permissions: Value) -> Self {
        Message::AuthSuccess {
            id: fresh_id(),
            timestamp: now_millis(),
            user_id: user_id.into(),
            permissions,
        }
    }

    pub fn auth_error(reason: impl Into<String>) -> Self {
        Message::AuthError {
            id: fresh_id(),
            timestamp: now_millis(),
            reason: reason.into(),
        }
    }

    pub fn sync_response(
        request_id: impl Into<String>,
        document_id: impl Into<String>,
        state: &VectorClock,
        deltas: Vec<DeltaEnvelope>,
    ) -> Self {
        Message::SyncResponse {
            id: fresh_id(),
            timestamp: now_millis(),
            request_id: request_id.into(),
            document_id: document_id.into(),
            state: serde_json::to_value(state).unwrap_or(Value::Null),
            deltas,
        }
    }

    pub fn awareness_state(document_id: impl Into<String>, states: Vec<AwarenessPeer>) -> Self {
        Message::AwarenessState {
            id: fresh_id(),
            timestamp: now_millis(),
            document_id: document_id.into(),
            states,
        }
    }

    pub fn error(reason: impl Into<String>, details: Option<Value>) -> Self {
        Message::Error {
            id: fresh_id(),
            timestamp: now_millis(),
            reason: reason.into(),
            details,
        }
    }

    /// The wire discriminator for this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Disconnect { .. } => "disconnect",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Auth { .. } => "auth",
            Message::AuthSuccess { .. } => "auth_success",
            Message::AuthError { .. } => "auth_error",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::SyncRequest { .. } => "sync_request",
            Message::SyncResponse { .. } => "sync_response",
            Message::Delta { .. } => "delta",
            Message::Ack { .. } => "ack",
            Message::AwarenessUpdate { .. } => "awareness_update",
            Message::AwarenessSubscribe { .. } => "awareness_subscribe",
            Message::AwarenessState { .. } => "awareness_state",
            Message::Error { .. } => "error",
        }
    }

    /// The sender-unique message id.
    pub fn id(&self) -> &str {
        match self {
            Message::Connect { id, .. }
            | Message::Disconnect { id, .. }
            | Message::Ping { id, .. }
            | Message::Pong { id, .. }
            | Message::Auth { id, .. }
            | Message::AuthSuccess { id, .. }
            | Message::AuthError { id, .. }
            | Message::Subscribe { id, .. }
            | Message::Unsubscribe { id, .. }
            | Message::SyncRequest { id, .. }
            | Message::SyncResponse { id, .. }
            | Message::Delta { id, .. }
            | Message::Ack { id, .. }
            | Message::AwarenessUpdate { id, .. }
            | Message::AwarenessSubscribe { id, .. }
            | Message::AwarenessState { id, .. }
            | Message::Error { id, .. } => id,
        }
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// Parse a wire frame.
    ///
    /// Distinguishes malformed JSON (`invalid_frame`) from a well-formed
    /// object whose `type` the hub does not know
    /// (`unknown_message_type`), and rejects vector-clock counters
    /// outside the safe-integer range.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;

        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidFrame("missing type field".into()))?;
        if !MESSAGE_TYPES.contains(&type_name) {
            return Err(ProtocolError::UnknownType(type_name.to_string()));
        }

        let message: Message = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
        message.validate_counters()?;
        Ok(message)
    }

    /// Enforce the 2^53 - 1 counter ceiling on every clock this message
    /// carries.
    fn validate_counters(&self) -> Result<(), ProtocolError> {
        let check = |clock: &VectorClock| {
            clock
                .validate()
                .map_err(ProtocolError::CounterOutOfRange)
        };
        match self {
            Message::Delta { vector_clock, .. } => check(vector_clock),
            Message::SyncRequest {
                vector_clock: Some(clock),
                ..
            } => check(clock),
            Message::AwarenessUpdate { clock, .. } => {
                if *clock > crate::clock::SAFE_COUNTER_MAX {
                    Err(ProtocolError::CounterOutOfRange(*clock))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match the declared type.
    InvalidFrame(String),
    /// Well-formed object with a `type` the hub does not recognize.
    UnknownType(String),
    /// Frame exceeds the configured size cap.
    FrameTooLarge(usize),
    /// Vector-clock counter beyond 2^53 - 1.
    CounterOutOfRange(u64),
}

impl ProtocolError {
    /// The `reason` string an `error` reply should carry.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            ProtocolError::InvalidFrame(_) => reason::INVALID_FRAME,
            ProtocolError::UnknownType(_) => reason::UNKNOWN_MESSAGE_TYPE,
            ProtocolError::FrameTooLarge(_) => reason::FRAME_TOO_LARGE,
            ProtocolError::CounterOutOfRange(_) => reason::INVALID_FRAME,
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidFrame(e) => write!(f, "Invalid frame: {e}"),
            ProtocolError::UnknownType(t) => write!(f, "Unknown message type: {t}"),
            ProtocolError::FrameTooLarge(n) => write!(f, "Frame too large: {n} bytes"),
            ProtocolError::CounterOutOfRange(n) => {
                write!(f, "Vector clock counter out of range: {n}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
