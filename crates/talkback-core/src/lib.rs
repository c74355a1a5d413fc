//! Core building blocks for the talkback session protocol.
//!
//! This crate provides:
//! - `Envelope` - The `[action, payload]` wire unit and its MessagePack codec
//! - `Error` - Protocol error taxonomy shared by every layer
//! - `TalkConfig` - Protocol configuration
//! - `Transport` - The split duplex byte-stream a connection runs on

pub mod config;
pub mod envelope;
pub mod error;
pub mod transport;

pub use config::TalkConfig;
pub use envelope::{ClientError, Envelope, Payload, actions, from_payload, to_payload};
pub use error::{Error, Result, TransportError};
pub use transport::{Transport, TransportReceiver, TransportSender};

/// Session identifier.
pub type SessionId = uuid::Uuid;
