//! Session manager driving connection attempts end to end.

use std::sync::Arc;

use talkback_core::{Error, Result, SessionId, TalkConfig, Transport};
use tracing::{debug, error, info};

use crate::{
    app::{AppSession, HandlerMap},
    connection::{Connection, ConnectionEnd},
    registry::SessionRegistry,
    session::{Session, SessionCtx},
};

type Factory<A> = Box<dyn Fn() -> A + Send + Sync>;

/// Owns configuration, the handler map, the registry and the session factory
/// for one application.
pub struct SessionManager<A: AppSession> {
    config: Arc<TalkConfig>,
    handlers: Arc<HandlerMap<A>>,
    registry: Arc<SessionRegistry<A>>,
    factory: Factory<A>,
}

impl<A: AppSession> SessionManager<A> {
    /// Create a new session manager.
    #[must_use]
    pub fn new(config: TalkConfig, factory: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Arc::new(HandlerMap::for_app()),
            registry: Arc::new(SessionRegistry::new()),
            factory: Box::new(factory),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TalkConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry<A>> {
        &self.registry
    }

    /// Serve one connection attempt until it ends.
    ///
    /// Creates a fresh session, runs its `init` hook and attaches the
    /// connection. The handshake may then move the connection over to a
    /// resumed session.
    ///
    /// # Errors
    /// Returns error if `init` or `on_connected` fails. The session is dropped
    /// in that case.
    pub async fn accept<T: Transport>(&self, transport: T) -> Result<ConnectionEnd> {
        let conn = Connection::open(transport, Arc::clone(&self.config));
        let session = Session::create(
            (self.factory)(),
            Arc::clone(&self.config),
            Arc::clone(&self.handlers),
            &self.registry,
        )
        .await;
        let ctx = SessionCtx::new(Arc::clone(&session));

        if let Err(e) = session.app().init(&ctx).await {
            error!(session = %session.id(), "Session init failed: {e}");
            conn.close();
            session.terminate().await;
            return Err(e);
        }

        if let Err(e) = session.attach(Arc::clone(&conn)).await {
            error!(session = %session.id(), "Attaching connection failed: {e}");
            conn.fatal().await;
            session.terminate().await;
            return Err(e);
        }
        drop(ctx);
        drop(session);

        let end = conn.closed().await;
        debug!(conn = conn.id(), ?end, "Connection attempt finished");
        Ok(end)
    }

    /// Handle to a live session.
    pub async fn lookup(&self, id: SessionId) -> Option<SessionCtx<A>> {
        self.registry.lookup(id).await.map(SessionCtx::new)
    }

    /// Terminate a session.
    ///
    /// # Errors
    /// Returns `UnknownSession` if no live session has this identity.
    pub async fn terminate(&self, id: SessionId) -> Result<()> {
        let session = self
            .registry
            .lookup(id)
            .await
            .ok_or(Error::UnknownSession(id))?;
        info!(session = %id, "Terminating session");
        session.terminate().await;
        Ok(())
    }

    /// Terminate every live session.
    pub async fn shutdown(&self) {
        for session in self.registry.snapshot().await {
            session.terminate().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }
}
