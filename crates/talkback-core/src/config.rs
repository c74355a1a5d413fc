//! Protocol configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 10;

/// How long the final `fatal` frame may take to flush.
pub const DEFAULT_FATAL_TIMEOUT_MS: u64 = 2000;

/// Largest accepted inbound frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Text carried by the `fatal` frame. Never includes error details.
pub const DEFAULT_FATAL_MESSAGE: &str = "The server encountered an internal error. Please reload.";

/// Settings shared by every session served under one manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkConfig {
    /// Application version. A client reporting a different one is told to reload.
    pub version: String,
    /// Messages that may be queued on a connection before `send` suspends.
    pub outbound_capacity: usize,
    /// Budget for flushing the `fatal` frame, in milliseconds.
    pub fatal_timeout_ms: u64,
    /// Payload of the `fatal` frame.
    pub fatal_message: String,
    /// Largest inbound frame an adapter should accept.
    pub max_frame_bytes: usize,
    /// Terminate a session left without a connection for this many seconds.
    /// `None` keeps detached sessions until they are terminated explicitly.
    pub detach_grace_secs: Option<u64>,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            fatal_timeout_ms: DEFAULT_FATAL_TIMEOUT_MS,
            fatal_message: DEFAULT_FATAL_MESSAGE.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            detach_grace_secs: None,
        }
    }
}

impl TalkConfig {
    /// Default configuration for the given application version.
    #[must_use]
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    /// Set the detach grace period.
    #[must_use]
    pub const fn with_detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace_secs = Some(grace.as_secs());
        self
    }

    #[must_use]
    pub const fn fatal_timeout(&self) -> Duration {
        Duration::from_millis(self.fatal_timeout_ms)
    }

    #[must_use]
    pub fn detach_grace(&self) -> Option<Duration> {
        self.detach_grace_secs.map(Duration::from_secs)
    }

    /// Queue depth, never below one.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity.max(1)
    }
}
