//! Application hooks and handler registration.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use talkback_core::{Error, Payload, Result, actions};
use tracing::warn;

use crate::session::SessionCtx;

type Handler<A> =
    Arc<dyn Fn(SessionCtx<A>, Payload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Application side of a session.
///
/// One value is created per session by the manager's factory. Handlers for
/// inbound actions are registered once per type through
/// [`register`](Self::register); everything else is a lifecycle hook.
///
/// Hooks and handlers run inside inbound dispatch. Calling
/// [`SessionCtx::request`] from there fails with `ReentrantRequest`; spawn a
/// task instead.
#[async_trait]
pub trait AppSession: Send + Sync + Sized + 'static {
    /// Session title.
    fn title(&self) -> &str {
        "talkback"
    }

    /// Register handlers for inbound actions.
    fn register(handlers: &mut HandlerMap<Self>) {
        let _ = handlers;
    }

    /// Setup before any connection is attached. An error aborts the
    /// connection attempt and drops the session.
    async fn init(&self, _ctx: &SessionCtx<Self>) -> Result<()> {
        Ok(())
    }

    /// Show the main view after a completed handshake.
    ///
    /// `token` is the value the client last answered a ping with, or `None`
    /// for a fresh page.
    async fn show_main(&self, ctx: &SessionCtx<Self>, token: Option<Payload>) -> Result<()>;

    /// A connection was attached, fresh or resumed.
    async fn on_connected(&self, _ctx: &SessionCtx<Self>) -> Result<()> {
        Ok(())
    }

    /// The attached connection went away or the session ended.
    async fn on_disconnected(&self, _ctx: &SessionCtx<Self>) {}

    /// Catch-all for actions without a handler.
    ///
    /// # Errors
    /// The default fails with `UnknownAction`, which is logged and does not
    /// end the connection.
    async fn on_unknown_message(
        &self,
        _ctx: &SessionCtx<Self>,
        action: String,
        payload: Payload,
    ) -> Result<()> {
        Err(Error::UnknownAction { action, payload })
    }

    /// Connection-scoped main routine, started on every attach and cancelled
    /// when the connection goes away. The default does nothing.
    async fn talk(&self, _ctx: &SessionCtx<Self>) -> Result<()> {
        Ok(())
    }
}

/// Action name to handler map, built once per session type.
pub struct HandlerMap<A: AppSession> {
    handlers: HashMap<String, Handler<A>>,
}

impl<A: AppSession> HandlerMap<A> {
    /// Create a map holding the built-in handlers.
    #[must_use]
    pub fn new() -> Self {
        let mut map = Self {
            handlers: HashMap::new(),
        };
        map.on(actions::PONG, |_ctx, _token| async { Ok(()) });
        map
    }

    /// Build the map for `A`.
    #[must_use]
    pub fn for_app() -> Self {
        let mut map = Self::new();
        A::register(&mut map);
        map
    }

    /// Register a handler, replacing any previous one for the action.
    ///
    /// Protocol-owned actions cannot be handled and are ignored with a warning.
    pub fn on<F, Fut>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(SessionCtx<A>, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let action = action.into();
        if actions::is_reserved(&action) {
            warn!(%action, "Ignoring handler for reserved action");
            return self;
        }
        let handler: Handler<A> = Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload)));
        self.handlers.insert(action, handler);
        self
    }

    pub(crate) fn get(&self, action: &str) -> Option<Handler<A>> {
        self.handlers.get(action).cloned()
    }

    #[must_use]
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<A: AppSession> Default for HandlerMap<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buttons;

    #[async_trait]
    impl AppSession for Buttons {
        fn register(handlers: &mut HandlerMap<Self>) {
            handlers
                .on("button", |_ctx, _name| async { Ok(()) })
                .on("form", |_ctx, _data| async { Ok(()) });
        }

        async fn show_main(&self, _ctx: &SessionCtx<Self>, _token: Option<Payload>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_for_app_includes_builtins() {
        let map = HandlerMap::<Buttons>::for_app();
        assert!(map.contains("button"));
        assert!(map.contains("form"));
        assert!(map.contains(actions::PONG));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_reserved_actions_are_refused() {
        let mut map = HandlerMap::<Buttons>::new();
        map.on("setup", |_ctx, _p| async { Ok(()) });
        map.on("reply", |_ctx, _p| async { Ok(()) });
        assert!(!map.contains("setup"));
        assert!(!map.contains("reply"));
    }

    #[test]
    fn test_later_registration_overrides() {
        let mut map = HandlerMap::<Buttons>::new();
        map.on(actions::PONG, |_ctx, _p| async { Err(Error::Terminated) });
        assert_eq!(map.len(), 1);
    }
}
