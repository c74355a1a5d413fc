//! Transport adapters for talkback sessions.
//!
//! Provides:
//! - WebSocket transport and `/ws` router (feature: websocket)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{WsTransport, create_ws_router};
