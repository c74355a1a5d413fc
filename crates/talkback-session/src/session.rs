//! Logical client sessions.
//!
//! A [`Session`] outlives any single connection. It owns the application
//! value, the handler map, the pending-request table and a two-tier task
//! supervisor, and has at most one [`Connection`] attached at a time.

use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use talkback_core::{
    Envelope, Error, Payload, Result, SessionId, TalkConfig, actions,
    envelope::{map_get, to_payload},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    app::{AppSession, HandlerMap},
    connection::{Connection, ConnectionEnd, InboundSink, current_dispatch},
    pending::PendingRequests,
    registry::{Claim, SessionRegistry},
    supervisor::{Scope, Supervisor, TaskFailure},
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One logical client.
pub struct Session<A: AppSession> {
    me: Weak<Self>,
    app: A,
    id: RwLock<SessionId>,
    config: Arc<TalkConfig>,
    handlers: Arc<HandlerMap<A>>,
    registry: Weak<SessionRegistry<A>>,
    connection: Mutex<Option<Arc<Connection>>>,
    pending: PendingRequests,
    supervisor: Supervisor,
    generation: AtomicU64,
    acknowledged: AtomicBool,
    terminated: AtomicBool,
}

impl<A: AppSession> Session<A> {
    /// Create a session with a fresh identity and register it.
    pub(crate) async fn create(
        app: A,
        config: Arc<TalkConfig>,
        handlers: Arc<HandlerMap<A>>,
        registry: &Arc<SessionRegistry<A>>,
    ) -> Arc<Self> {
        let (supervisor, failures) = Supervisor::new();
        let session = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            app,
            id: RwLock::new(Uuid::new_v4()),
            config,
            handlers,
            registry: Arc::downgrade(registry),
            connection: Mutex::new(None),
            pending: PendingRequests::new(),
            supervisor,
            generation: AtomicU64::new(0),
            acknowledged: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        registry.register(Arc::clone(&session)).await;
        tokio::spawn(watch_failures(Arc::downgrade(&session), failures));
        debug!(session = %session.id(), "Session created");
        session
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        *self.id.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_id(&self, id: SessionId) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    #[must_use]
    pub const fn app(&self) -> &A {
        &self.app
    }

    #[must_use]
    pub fn config(&self) -> &TalkConfig {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current_connection().is_some_and(|c| !c.is_closed())
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.current_connection()
            .is_some_and(|current| Arc::ptr_eq(&current, conn))
    }

    fn ctx(self: &Arc<Self>) -> SessionCtx<A> {
        SessionCtx::new(Arc::clone(self))
    }

    /// Attach a connection, superseding the previous one.
    ///
    /// # Errors
    /// Returns `Terminated` if the session has ended, or whatever
    /// `on_connected` fails with.
    pub(crate) async fn attach(self: &Arc<Self>, conn: Arc<Connection>) -> Result<()> {
        if self.is_terminated() {
            conn.close();
            return Err(Error::Terminated);
        }

        let previous = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&conn));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.supervisor.renew_connection_scope();

        if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &conn)) {
            info!(session = %self.id(), old = previous.id(), new = conn.id(), "Superseding connection");
            previous.supersede();
            self.pending.fail_connection(previous.id());
        }

        let sink: Weak<dyn InboundSink> = self.me.clone();
        conn.attach(sink);
        info!(session = %self.id(), conn = conn.id(), "Connection attached");

        let ctx = self.ctx();
        self.supervisor
            .spawn_in(Scope::Connection, "talk", async move { ctx.app().talk(&ctx).await });

        self.app.on_connected(&self.ctx()).await
    }

    async fn detach(self: &Arc<Self>, conn: &Arc<Connection>) {
        let was_current = {
            let mut current = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *current = None;
                true
            } else {
                false
            }
        };
        if !was_current {
            self.pending.fail_connection(conn.id());
            return;
        }

        self.supervisor.cancel(Scope::Connection);
        self.pending.fail_connection(conn.id());
        info!(session = %self.id(), conn = conn.id(), "Connection detached");
        self.app.on_disconnected(&self.ctx()).await;

        // Nobody can resume an identity that was never acknowledged.
        if self.acknowledged.load(Ordering::SeqCst) {
            self.start_detach_grace();
        } else {
            debug!(session = %self.id(), "Dropping session that never completed a handshake");
            self.terminate().await;
        }
    }

    fn start_detach_grace(self: &Arc<Self>) {
        let Some(grace) = self.config.detach_grace() else {
            return;
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.generation.load(Ordering::SeqCst) == generation
                && session.current_connection().is_none()
            {
                info!(session = %session.id(), "Detach grace period expired");
                session.terminate().await;
            }
        });
    }

    /// End the session: unregister it, close its connection, fail pending
    /// requests and cancel every task. Idempotent.
    pub async fn terminate(self: &Arc<Self>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_if(self).await;
        }

        let conn = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = &conn {
            conn.close();
        }
        self.pending.fail_all();
        self.supervisor.shutdown(SHUTDOWN_TIMEOUT).await;

        if conn.is_some() {
            self.app.on_disconnected(&self.ctx()).await;
        }
        info!(session = %self.id(), "Session terminated");
    }

    /// Kill the session after an unrecoverable error.
    async fn fail(self: &Arc<Self>, err: &Error) {
        debug!(session = %self.id(), "Failing session: {err}");
        if let Some(conn) = self.current_connection() {
            conn.fatal().await;
        }
        self.terminate().await;
    }

    /// Drop a session that lost an identity claim. Runs no hooks and leaves
    /// the connection to its new owner.
    async fn discard(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending.fail_all();
        self.supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
        debug!(session = %self.id(), "Fresh session discarded");
    }

    async fn send_setup_ack(&self, conn: &Connection) -> Result<()> {
        let ack = Payload::Map(vec![
            (Payload::from("version"), Payload::from(self.config.version.as_str())),
            (Payload::from("uuid"), Payload::from(self.id().to_string())),
        ]);
        conn.send(Envelope::message(actions::SETUP, ack)).await?;
        self.acknowledged.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_setup(self: &Arc<Self>, conn: &Arc<Connection>, data: Payload) -> Result<()> {
        if let Some(version) = map_get(&data, "version").filter(|v| !v.is_nil()) {
            if version.as_str() != Some(self.config.version.as_str()) {
                info!(session = %self.id(), client = %version, "Client version mismatch, reloading");
                return conn.send(Envelope::message(actions::RELOAD, true)).await;
            }
        }

        let uuid = match map_get(&data, "uuid").filter(|v| !v.is_nil()) {
            None => None,
            Some(raw) => {
                let parsed = raw.as_str().and_then(|s| Uuid::parse_str(s).ok());
                if parsed.is_none() {
                    warn!(session = %self.id(), "Ignoring unparseable client identity {raw}");
                }
                parsed
            }
        };

        if let Some(uuid) = uuid.filter(|u| *u != self.id()) {
            let registry = self.registry.upgrade().ok_or(Error::Terminated)?;
            match registry.claim(self, uuid).await {
                Claim::Existing(existing) => {
                    info!(session = %uuid, conn = conn.id(), "Resuming session");
                    existing.attach(Arc::clone(conn)).await?;
                    existing.send_setup_ack(conn).await?;
                    self.discard().await;
                    return Ok(());
                }
                Claim::Adopted => {
                    info!(session = %uuid, conn = conn.id(), "Adopted client identity");
                }
            }
        }

        self.send_setup_ack(conn).await?;
        let token = map_get(&data, "token").filter(|t| !t.is_nil()).cloned();
        self.app.show_main(&self.ctx(), token).await
    }

    async fn send(&self, action: &str, payload: Payload) -> Result<()> {
        if actions::is_reserved(action) {
            return Err(Error::ReservedAction(action.to_string()));
        }
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        let conn = self.current_connection().ok_or(Error::NotConnected)?;
        conn.send(Envelope::message(action, payload)).await
    }

    async fn request(&self, action: &str, payload: Payload) -> Result<Payload> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        let conn = self.current_connection().ok_or(Error::NotConnected)?;
        if current_dispatch() == Some(conn.id()) {
            return Err(Error::ReentrantRequest {
                action: action.to_string(),
            });
        }

        let id = conn.next_correlation_id();
        let (_guard, reply) = self.pending.register(conn.id(), id);
        debug!(session = %self.id(), conn = conn.id(), id, %action, "Request");
        conn.send(Envelope::request(action, id, payload)).await?;
        reply.await.map_err(|_| Error::ConnectionLost)?
    }
}

#[async_trait]
impl<A: AppSession> InboundSink for Session<A> {
    async fn deliver(
        self: Arc<Self>,
        conn: Arc<Connection>,
        action: String,
        payload: Payload,
    ) -> Result<()> {
        if action == actions::SETUP {
            return self.handle_setup(&conn, payload).await;
        }
        let ctx = self.ctx();
        match self.handlers.get(&action) {
            Some(handler) => handler(ctx, payload).await,
            None => self.app.on_unknown_message(&ctx, action, payload).await,
        }
    }

    fn resolve_reply(&self, conn: u64, id: u64, result: Payload) {
        self.pending.resolve(conn, id, result);
    }

    async fn connection_ended(self: Arc<Self>, conn: Arc<Connection>, end: ConnectionEnd) {
        match end {
            ConnectionEnd::Fatal if self.is_current(&conn) => self.terminate().await,
            _ => self.detach(&conn).await,
        }
    }
}

async fn watch_failures<A: AppSession>(
    session: Weak<Session<A>>,
    mut failures: mpsc::UnboundedReceiver<TaskFailure>,
) {
    while let Some(failure) = failures.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        let lost = matches!(failure.error, Error::ConnectionLost | Error::NotConnected);
        if failure.scope == Scope::Connection && lost {
            debug!(session = %session.id(), task = %failure.name, "Task lost its connection");
            continue;
        }
        error!(session = %session.id(), task = %failure.name, "Task failed: {}", failure.error);
        session.fail(&failure.error).await;
    }
}

/// Handle to a session given to handlers, hooks and tasks.
pub struct SessionCtx<A: AppSession> {
    session: Arc<Session<A>>,
}

impl<A: AppSession> Clone for SessionCtx<A> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<A: AppSession> SessionCtx<A> {
    pub(crate) const fn new(session: Arc<Session<A>>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    #[must_use]
    pub fn app(&self) -> &A {
        self.session.app()
    }

    #[must_use]
    pub fn title(&self) -> &str {
        self.session.app().title()
    }

    /// Configured protocol version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.session.config.version
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session<A>> {
        &self.session
    }

    /// Send a one-way message. Suspends while the outbound queue is full.
    ///
    /// # Errors
    /// Returns `NotConnected` while no connection is attached,
    /// `ReservedAction` for protocol-owned actions, or `ConnectionLost` if the
    /// connection drops while waiting for queue space.
    pub async fn send(&self, action: &str, payload: impl Into<Payload> + Send) -> Result<()> {
        self.session.send(action, payload.into()).await
    }

    /// Send a one-way message with a serializable payload.
    ///
    /// # Errors
    /// As [`send`](Self::send), plus `Payload` if serialization fails.
    pub async fn send_value<T: Serialize + Sync>(&self, action: &str, value: &T) -> Result<()> {
        let payload = to_payload(value)?;
        self.session.send(action, payload).await
    }

    /// Send a request and wait for the client's reply.
    ///
    /// # Errors
    /// Returns `ReentrantRequest` inside inbound dispatch, `ConnectionLost`
    /// if the connection goes away first, or `Client` for an error reply.
    pub async fn request(&self, action: &str, payload: impl Into<Payload> + Send) -> Result<Payload> {
        self.session.request(action, payload.into()).await
    }

    /// Spawn a supervised task. An error or panic in it kills the session,
    /// except for a connection-scoped task losing its connection.
    ///
    /// Returns a token that cancels the task.
    pub fn spawn<F>(&self, scope: Scope, name: impl Into<String>, fut: F) -> CancellationToken
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.session.supervisor.spawn_in(scope, name, fut)
    }

    /// Send a ping token. The client echoes it back as `pong` and presents it
    /// again on reconnect.
    ///
    /// # Errors
    /// As [`send`](Self::send).
    pub async fn ping(&self, token: impl Into<Payload> + Send) -> Result<()> {
        self.session.send(actions::PING, token.into()).await
    }

    /// Send a ping token as a request. Returns the client's previous token.
    ///
    /// # Errors
    /// As [`request`](Self::request).
    pub async fn ping_wait(&self, token: impl Into<Payload> + Send) -> Result<Payload> {
        self.session.request(actions::PING, token.into()).await
    }

    /// End the session without a fatal notice.
    pub async fn terminate(&self) {
        let session = Arc::clone(&self.session);
        let id = session.id();
        // Detached so that a task terminating its own session is not cut short
        // by the cancellation it triggers.
        if let Err(e) = tokio::spawn(async move { session.terminate().await }).await {
            warn!(session = %id, "Terminate task failed: {e}");
        }
    }
}
