//! In-memory transport pair.
//!
//! Bridges a server-side [`MemoryTransport`] to a [`MemoryClient`] that
//! speaks envelopes directly. The client can pause the server's writes to
//! simulate a stalled socket.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{Transport, TransportReceiver, TransportSender};
use crate::{
    Envelope, Error, Payload, Result, TransportError,
    envelope::{decode, encode},
};

/// Create a connected transport/client pair.
#[must_use]
pub fn pair() -> (MemoryTransport, MemoryClient) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = watch::channel(true);

    let transport = MemoryTransport {
        tx: server_tx,
        rx: server_rx,
        gate: gate_rx,
    };

    let client = MemoryClient {
        tx: Some(client_tx),
        rx: client_rx,
        gate: gate_tx,
    };

    (transport, client)
}

/// Server side of the pair.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    gate: watch::Receiver<bool>,
}

impl Transport for MemoryTransport {
    fn split(self) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let sender = MemorySender {
            tx: Some(self.tx),
            gate: self.gate,
        };
        let receiver = MemoryReceiver { rx: self.rx };
        (Box::new(sender), Box::new(receiver))
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        // A dropped client counts as an open gate; the send below reports the closure.
        let _ = self.gate.wait_for(|open| *open).await;
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }
}

/// Client side of the pair.
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    gate: watch::Sender<bool>,
}

impl MemoryClient {
    /// Send an envelope to the server.
    ///
    /// # Errors
    /// Returns error if the envelope cannot be encoded or the server is gone.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_raw(encode(envelope)?)
    }

    /// Send a one-way message to the server.
    ///
    /// # Errors
    /// Returns error if the server is gone.
    pub fn send_message(&self, action: &str, payload: impl Into<Payload>) -> Result<()> {
        self.send(&Envelope::message(action, payload))
    }

    /// Answer a server request.
    ///
    /// # Errors
    /// Returns error if the server is gone.
    pub fn reply(&self, id: u64, result: impl Into<Payload>) -> Result<()> {
        self.send(&Envelope::reply(id, result))
    }

    /// Send raw bytes, bypassing the codec.
    ///
    /// # Errors
    /// Returns error if the server is gone.
    pub fn send_raw(&self, frame: impl Into<Bytes>) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame.into())
            .map_err(|_| Error::Transport(TransportError::ConnectionClosed))
    }

    /// Receive the next envelope from the server.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` once the server side is closed and drained.
    pub async fn recv(&mut self) -> Result<Envelope> {
        let frame = self
            .rx
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)?;
        decode(&frame)
    }

    /// Receive without waiting. `None` if nothing is buffered.
    ///
    /// # Errors
    /// Returns error if a buffered frame does not decode.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(frame) => decode(&frame).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Hold server writes until [`resume_writes`](Self::resume_writes).
    pub fn pause_writes(&self) {
        self.gate.send_replace(false);
    }

    /// Release held server writes.
    pub fn resume_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Close the client-to-server direction, as a browser closing its socket would.
    pub fn close(&mut self) {
        self.tx = None;
    }
}
