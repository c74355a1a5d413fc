//! Reconnect-resilient sessions for the talkback protocol.
//!
//! Provides:
//! - `Connection` - One physical transport attempt with inbound/outbound pumps
//! - `Session` - The logical client, surviving reconnects
//! - `SessionRegistry` - Identity to session map used for resumption
//! - `Supervisor` - Connection-scoped and persistent task scopes
//! - `SessionManager` - Drives connection attempts for one application

pub mod app;
pub mod connection;
pub mod manager;
pub mod pending;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use app::{AppSession, HandlerMap};
pub use connection::{Connection, ConnectionEnd, ConnectionId};
pub use manager::SessionManager;
pub use registry::{Claim, SessionRegistry};
pub use session::{Session, SessionCtx};
pub use supervisor::{Scope, Supervisor, TaskFailure};
