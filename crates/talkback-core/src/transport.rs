//! Transport traits.
//!
//! A transport is one physical duplex byte stream. Connections split it so
//! the inbound and outbound pumps can own their half independently.

use async_trait::async_trait;
use bytes::Bytes;

use crate::TransportError;

/// Receiving half of a transport.
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next frame.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` once the peer is gone.
    async fn receive(&mut self) -> Result<Bytes, TransportError>;
}

/// Sending half of a transport.
#[async_trait]
pub trait TransportSender: Send {
    /// Write one frame.
    ///
    /// # Errors
    /// Returns error if the frame cannot be written.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the stream. The default does nothing.
    ///
    /// # Errors
    /// Returns error if the close handshake fails.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A duplex byte stream handed to the core per connection attempt.
pub trait Transport: Send + 'static {
    /// Split into independently owned halves.
    fn split(self) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>);
}

#[cfg(feature = "memory")]
pub mod memory;
