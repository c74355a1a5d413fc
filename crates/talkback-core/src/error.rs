//! Protocol error taxonomy.

use thiserror::Error;

use crate::{ClientError, Payload, SessionId};

/// Result alias used throughout the talkback crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Protocol error.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame could not be decoded into an envelope. Fatal to the connection only.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// No handler is registered for an inbound action.
    #[error("Unknown action {action:?} (payload: {payload})")]
    UnknownAction { action: String, payload: Payload },

    /// `request()` was issued from inside inbound dispatch on the same connection.
    #[error("Request {action:?} issued from inside inbound dispatch would deadlock; spawn a task instead")]
    ReentrantRequest { action: String },

    /// The connection carrying a pending request went away.
    #[error("Connection lost")]
    ConnectionLost,

    /// The session currently has no attached connection.
    #[error("Session is not connected")]
    NotConnected,

    /// The session has been terminated.
    #[error("Session terminated")]
    Terminated,

    /// No live session has this identity.
    #[error("Session not found: {0}")]
    UnknownSession(SessionId),

    /// Actions owned by the protocol cannot be sent directly.
    #[error("Action {0:?} is reserved by the protocol")]
    ReservedAction(String),

    /// The client answered a request with a structured error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A supervised task failed.
    #[error("Task {name:?} failed: {reason}")]
    TaskFailed { name: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be converted to or from a typed value.
    #[error("Payload conversion error: {0}")]
    Payload(String),

    /// An envelope could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Application-level failure raised from a handler or hook.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error only concerns the offending message and the
    /// connection may continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownAction { .. })
    }
}
