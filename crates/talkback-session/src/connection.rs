//! One physical connection.
//!
//! A [`Connection`] owns a split transport and runs two pumps:
//!
//! - the inbound pump waits until a session is attached, then decodes frames
//!   and hands them to that session one at a time
//! - the outbound pump drains the send queue in FIFO order and writes frames
//!
//! The send queue is bounded. A queued message keeps its slot until the
//! outbound pump has written it, so a stalled transport suspends senders
//! instead of dropping messages.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use talkback_core::{
    Envelope, Error, Payload, Result, TalkConfig, Transport, TransportError, TransportReceiver,
    TransportSender, actions,
    envelope::{ERROR_KEY, decode, encode},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

use crate::supervisor::panic_message;

/// Process-unique connection number.
pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

tokio::task_local! {
    static DISPATCHING: ConnectionId;
}

/// Connection whose inbound dispatch the current task is running, if any.
pub(crate) fn current_dispatch() -> Option<ConnectionId> {
    DISPATCHING.try_with(|id| *id).ok()
}

/// Receiver of a connection's inbound traffic.
#[async_trait]
pub(crate) trait InboundSink: Send + Sync {
    /// Dispatch one inbound message. Runs inside the inbound pump.
    async fn deliver(
        self: Arc<Self>,
        conn: Arc<Connection>,
        action: String,
        payload: Payload,
    ) -> Result<()>;

    /// Hand a reply to whoever is waiting for it.
    fn resolve_reply(&self, conn: ConnectionId, id: u64, result: Payload);

    /// Both pumps have stopped and the transport is closed.
    async fn connection_ended(self: Arc<Self>, conn: Arc<Connection>, end: ConnectionEnd);
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed the transport.
    Closed,
    /// A newer connection took over the session.
    Superseded,
    /// The peer sent something that is not a valid frame.
    ProtocolError(String),
    /// The session failed; the client was sent a `fatal` notice.
    Fatal,
    /// Closed locally.
    Shutdown,
}

struct Queued {
    envelope: Envelope,
    _permit: OwnedSemaphorePermit,
}

/// One physical transport attempt.
pub struct Connection {
    id: ConnectionId,
    config: Arc<TalkConfig>,
    queue: mpsc::UnboundedSender<Queued>,
    permits: Arc<Semaphore>,
    writer: Arc<tokio::sync::Mutex<Box<dyn TransportSender>>>,
    next_request: AtomicU64,
    tasks: TaskTracker,
    cancel: CancellationToken,
    finished: CancellationToken,
    end: Mutex<Option<ConnectionEnd>>,
    fatal_sent: AtomicBool,
    sink: watch::Sender<Option<Weak<dyn InboundSink>>>,
}

impl Connection {
    /// Take over a transport and start both pumps.
    ///
    /// Inbound frames are held until a session attaches.
    #[must_use]
    pub fn open<T: Transport>(transport: T, config: Arc<TalkConfig>) -> Arc<Self> {
        let (writer, reader) = transport.split();
        let (queue, rx) = mpsc::unbounded_channel();
        let (sink, _) = watch::channel(None);
        let capacity = config.outbound_capacity();

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            config,
            queue,
            permits: Arc::new(Semaphore::new(capacity)),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            next_request: AtomicU64::new(0),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            end: Mutex::new(None),
            fatal_sent: AtomicBool::new(false),
            sink,
        });
        debug!(conn = conn.id, "Connection opened");

        conn.tasks.spawn(Arc::clone(&conn).inbound(reader));
        conn.tasks.spawn(Arc::clone(&conn).outbound(rx));
        conn.tasks.close();
        tokio::spawn(Arc::clone(&conn).finish());

        conn
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an envelope for the outbound pump.
    ///
    /// Suspends while the queue is full.
    ///
    /// # Errors
    /// Returns `ConnectionLost` if the connection is, or becomes, cancelled.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionLost);
        }
        let permit = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::ConnectionLost),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Error::ConnectionLost)?
            }
        };
        self.queue
            .send(Queued {
                envelope,
                _permit: permit,
            })
            .map_err(|_| Error::ConnectionLost)
    }

    /// Allocate the next correlation id for a request on this connection.
    pub fn next_correlation_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Route inbound traffic to `sink` and release the inbound pump.
    pub(crate) fn attach(&self, sink: Weak<dyn InboundSink>) {
        self.sink.send_replace(Some(sink));
    }

    fn sink(&self) -> Option<Arc<dyn InboundSink>> {
        self.sink.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn set_end(&self, end: ConnectionEnd) {
        let mut slot = self.end.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(end);
        }
    }

    fn end(&self) -> ConnectionEnd {
        self.end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(ConnectionEnd::Closed)
    }

    /// Stop both pumps because a newer connection took over.
    pub fn supersede(&self) {
        self.set_end(ConnectionEnd::Superseded);
        self.cancel.cancel();
    }

    /// Stop both pumps and close the transport.
    pub fn close(&self) {
        self.set_end(ConnectionEnd::Shutdown);
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the connection has fully shut down.
    pub async fn closed(&self) -> ConnectionEnd {
        self.finished.cancelled().await;
        self.end()
    }

    /// Tell the client its session died, then close.
    ///
    /// The notice is written directly to the transport, bypassing the queue,
    /// and is bounded by the configured fatal timeout. Caller cancellation
    /// does not abort the write. Only the first call sends anything.
    pub async fn fatal(self: &Arc<Self>) {
        if self.fatal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_end(ConnectionEnd::Fatal);

        // Spawned before cancelling so the finalizer waits for it.
        let this = Arc::clone(self);
        let mut write = self.tasks.spawn(async move {
            let frame = encode(&Envelope::message(
                actions::FATAL,
                this.config.fatal_message.as_str(),
            ))?;
            this.writer.lock().await.send(frame).await?;
            Ok::<_, Error>(())
        });
        self.cancel.cancel();

        match tokio::time::timeout(self.config.fatal_timeout(), &mut write).await {
            Ok(Ok(Ok(()))) => debug!(conn = self.id, "Fatal notice sent"),
            Ok(Ok(Err(e))) => debug!(conn = self.id, "Could not send fatal notice: {e}"),
            Ok(Err(e)) => warn!(conn = self.id, "Fatal notice task failed: {e}"),
            Err(_) => {
                write.abort();
                debug!(conn = self.id, "Fatal notice timed out");
            }
        }
    }

    async fn wait_attached(&self) -> bool {
        let mut rx = self.sink.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => false,
            attached = rx.wait_for(Option::is_some) => attached.is_ok(),
        }
    }

    async fn inbound(self: Arc<Self>, mut reader: Box<dyn TransportReceiver>) {
        if !self.wait_attached().await {
            return;
        }

        let end = loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break None,
                frame = reader.receive() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(TransportError::ConnectionClosed) => break Some(ConnectionEnd::Closed),
                Err(e) => break Some(ConnectionEnd::ProtocolError(e.to_string())),
            };

            let envelope = match decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(conn = self.id, "Dropping connection: {e}");
                    break Some(ConnectionEnd::ProtocolError(e.to_string()));
                }
            };

            let Some(sink) = self.sink() else {
                break Some(ConnectionEnd::Shutdown);
            };

            match envelope {
                Envelope::Reply { id, result } => sink.resolve_reply(self.id, id, result),
                Envelope::Request { action, id, .. } => {
                    warn!(conn = self.id, %action, id, "Client requests are not served");
                    let refusal = Payload::Map(vec![
                        (Payload::from(ERROR_KEY), Payload::from("unsupported")),
                        (Payload::from("action"), Payload::from(action)),
                    ]);
                    if self.send(Envelope::reply(id, refusal)).await.is_err() {
                        break None;
                    }
                }
                Envelope::Message { action, payload } => {
                    debug!(conn = self.id, %action, "Dispatching");
                    let deliver = sink.deliver(Arc::clone(&self), action.clone(), payload);
                    let dispatch =
                        DISPATCHING.scope(self.id, AssertUnwindSafe(deliver).catch_unwind());
                    let result = tokio::select! {
                        () = self.cancel.cancelled() => break None,
                        outcome = dispatch => outcome.unwrap_or_else(|panic| {
                            Err(Error::TaskFailed {
                                name: format!("dispatch of {action}"),
                                reason: panic_message(panic.as_ref()),
                            })
                        }),
                    };
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_recoverable() => warn!(conn = self.id, %action, "{e}"),
                        Err(e) => {
                            error!(conn = self.id, %action, "Handler failed: {e}");
                            self.fatal().await;
                            break None;
                        }
                    }
                }
            }
        };

        if let Some(end) = end {
            self.set_end(end);
        }
        self.cancel.cancel();
    }

    async fn outbound(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Queued>) {
        loop {
            let queued = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                queued = rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let frame = match encode(&queued.envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(conn = self.id, action = queued.envelope.action(), "Dropping unencodable message: {e}");
                    continue;
                }
            };

            let written = tokio::select! {
                () = self.cancel.cancelled() => break,
                written = async { self.writer.lock().await.send(frame).await } => written,
            };
            if let Err(e) = written {
                debug!(conn = self.id, "Write failed: {e}");
                self.set_end(ConnectionEnd::Closed);
                self.cancel.cancel();
                break;
            }
            drop(queued);
        }
    }

    async fn finish(self: Arc<Self>) {
        self.tasks.wait().await;

        let close = async { self.writer.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn = self.id, "Close failed: {e}"),
            Err(_) => debug!(conn = self.id, "Close timed out"),
        }

        let end = self.end();
        debug!(conn = self.id, ?end, "Connection finished");
        if let Some(sink) = self.sink() {
            let ended = AssertUnwindSafe(sink.connection_ended(Arc::clone(&self), end));
            if let Err(panic) = ended.catch_unwind().await {
                error!(conn = self.id, "Connection end hook panicked: {}", panic_message(panic.as_ref()));
            }
        }
        self.finished.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkback_core::transport::memory::{self, MemoryClient};
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, Payload, Option<ConnectionId>)>>,
        replies: Mutex<Vec<(u64, Payload)>>,
        ended: Mutex<Option<ConnectionEnd>>,
    }

    #[async_trait]
    impl InboundSink for RecordingSink {
        async fn deliver(
            self: Arc<Self>,
            _conn: Arc<Connection>,
            action: String,
            payload: Payload,
        ) -> Result<()> {
            let result = match action.as_str() {
                "explode" => Err(Error::Other(anyhow::anyhow!("handler exploded"))),
                "boom" => panic!("handler panicked"),
                "mystery" => Err(Error::UnknownAction {
                    action: action.clone(),
                    payload: payload.clone(),
                }),
                _ => Ok(()),
            };
            self.seen
                .lock()
                .unwrap()
                .push((action, payload, current_dispatch()));
            result
        }

        fn resolve_reply(&self, _conn: ConnectionId, id: u64, result: Payload) {
            self.replies.lock().unwrap().push((id, result));
        }

        async fn connection_ended(self: Arc<Self>, _conn: Arc<Connection>, end: ConnectionEnd) {
            *self.ended.lock().unwrap() = Some(end);
        }
    }

    fn open() -> (Arc<Connection>, MemoryClient, Arc<RecordingSink>) {
        open_with(TalkConfig::default())
    }

    fn open_with(config: TalkConfig) -> (Arc<Connection>, MemoryClient, Arc<RecordingSink>) {
        let (transport, client) = memory::pair();
        let conn = Connection::open(transport, Arc::new(config));
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn InboundSink> = Arc::downgrade(&sink) as Weak<dyn InboundSink>;
        conn.attach(weak);
        (conn, client, sink)
    }

    #[tokio::test]
    async fn test_outbound_is_fifo() {
        let (conn, mut client, _sink) = open();
        for i in 0..25u64 {
            conn.send(Envelope::message("n", i)).await.unwrap();
        }
        for i in 0..25u64 {
            assert_eq!(client.recv().await.unwrap(), Envelope::message("n", i));
        }
    }

    #[tokio::test]
    async fn test_eleventh_send_waits_for_flush() {
        let (conn, mut client, _sink) = open();
        client.pause_writes();

        for i in 0..10u64 {
            conn.send(Envelope::message("n", i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        {
            let mut eleventh = task::spawn(conn.send(Envelope::message("n", 10u64)));
            assert_pending!(eleventh.poll());
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_pending!(eleventh.poll());

            client.resume_writes();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_ready_ok!(eleventh.poll());
        }

        for i in 0..=10u64 {
            assert_eq!(client.recv().await.unwrap(), Envelope::message("n", i));
        }
    }

    #[tokio::test]
    async fn test_inbound_dispatch_marks_connection() {
        let (conn, client, sink) = open();
        client.send_message("button", "go").unwrap();
        client.send_message("form", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "button");
        assert_eq!(seen[0].2, Some(conn.id()));
        assert_eq!(seen[1].0, "form");
        assert_eq!(current_dispatch(), None);
    }

    #[tokio::test]
    async fn test_replies_bypass_dispatch() {
        let (_conn, client, sink) = open();
        client.reply(4, "answer").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sink.seen.lock().unwrap().is_empty());
        assert_eq!(
            sink.replies.lock().unwrap().as_slice(),
            &[(4, Payload::from("answer"))]
        );
    }

    #[tokio::test]
    async fn test_client_request_is_refused() {
        let (_conn, mut client, _sink) = open();
        client
            .send(&Envelope::request("getattr", 2, Payload::Nil))
            .unwrap();

        match client.recv().await.unwrap() {
            Envelope::Reply { id, result } => {
                assert_eq!(id, 2);
                let err = talkback_core::ClientError::from_reply(&result).unwrap();
                assert_eq!(err.error, Payload::from("unsupported"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (conn, client, sink) = open();
        client.send_raw(vec![0xc1u8]).unwrap();

        let end = conn.closed().await;
        assert!(matches!(end, ConnectionEnd::ProtocolError(_)));
        assert_eq!(sink.ended.lock().unwrap().clone(), Some(end));
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_connection() {
        let (conn, client, sink) = open();
        client.send_message("mystery", Payload::Nil).unwrap();
        client.send_message("after", Payload::Nil).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!conn.is_closed());
        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_sends_fatal_once() {
        let (conn, mut client, sink) = open();
        client.send_message("explode", Payload::Nil).unwrap();

        assert_eq!(conn.closed().await, ConnectionEnd::Fatal);
        assert_eq!(
            client.recv().await.unwrap(),
            Envelope::message(actions::FATAL, TalkConfig::default().fatal_message)
        );
        assert!(client.recv().await.is_err());
        assert_eq!(sink.ended.lock().unwrap().clone(), Some(ConnectionEnd::Fatal));

        // A second notice is suppressed.
        conn.fatal().await;
    }

    #[tokio::test]
    async fn test_handler_panic_sends_fatal() {
        let (conn, mut client, sink) = open();
        client.send_message("boom", Payload::Nil).unwrap();

        let end = tokio::time::timeout(Duration::from_secs(4), conn.closed())
            .await
            .expect("connection should close after a panicking handler");
        assert_eq!(end, ConnectionEnd::Fatal);
        assert_eq!(
            client.recv().await.unwrap(),
            Envelope::message(actions::FATAL, TalkConfig::default().fatal_message)
        );
        assert!(client.recv().await.is_err());
        assert_eq!(sink.ended.lock().unwrap().clone(), Some(ConnectionEnd::Fatal));
    }

    #[tokio::test]
    async fn test_fatal_on_stalled_transport_is_bounded() {
        let config = TalkConfig {
            fatal_timeout_ms: 100,
            ..TalkConfig::default()
        };
        let (conn, mut client, sink) = open_with(config);
        client.pause_writes();
        client.send_message("explode", Payload::Nil).unwrap();

        let started = tokio::time::Instant::now();
        let end = tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("teardown must not wait on a stalled transport");
        assert_eq!(end, ConnectionEnd::Fatal);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.ended.lock().unwrap().clone(), Some(ConnectionEnd::Fatal));

        // The notice never made it out and the transport is closed.
        assert!(client.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_ends_connection() {
        let (conn, mut client, _sink) = open();
        client.close();
        assert_eq!(conn.closed().await, ConnectionEnd::Closed);
        assert!(matches!(
            conn.send(Envelope::message("late", Payload::Nil)).await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_supersede_reports_reason() {
        let (conn, _client, sink) = open();
        conn.supersede();
        conn.close();
        assert_eq!(conn.closed().await, ConnectionEnd::Superseded);
        assert_eq!(
            sink.ended.lock().unwrap().clone(),
            Some(ConnectionEnd::Superseded)
        );
    }

    #[tokio::test]
    async fn test_frames_wait_for_attach() {
        let (transport, client) = memory::pair();
        let conn = Connection::open(transport, Arc::new(TalkConfig::default()));
        client.send_message("early", Payload::Nil).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sink = Arc::new(RecordingSink::default());
        conn.attach(Arc::downgrade(&sink) as Weak<dyn InboundSink>);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.seen.lock().unwrap()[0].0, "early");
    }
}
