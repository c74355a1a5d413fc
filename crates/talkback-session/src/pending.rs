//! Outstanding request table.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use talkback_core::{Error, Payload, Result, envelope::reply_result};
use tokio::sync::oneshot;
use tracing::warn;

use crate::connection::ConnectionId;

type Waiter = oneshot::Sender<Result<Payload>>;
type Key = (ConnectionId, u64);

/// Waiters for replies, keyed by the connection the request went out on and
/// its correlation id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Arc<Mutex<HashMap<Key, Waiter>>>,
}

/// Removes its waiter when dropped, so an abandoned request leaves nothing behind.
pub struct PendingGuard {
    key: Key,
    waiters: Arc<Mutex<HashMap<Key, Waiter>>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for a request about to be sent.
    #[must_use]
    pub fn register(
        &self,
        conn: ConnectionId,
        id: u64,
    ) -> (PendingGuard, oneshot::Receiver<Result<Payload>>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert((conn, id), tx);
        let guard = PendingGuard {
            key: (conn, id),
            waiters: Arc::clone(&self.waiters),
        };
        (guard, rx)
    }

    /// Resolve a waiter with the client's reply.
    ///
    /// A reply carrying the error key resolves as [`Error::Client`]. Replies
    /// nobody waits for any more are dropped.
    pub fn resolve(&self, conn: ConnectionId, id: u64, result: Payload) {
        let Some(waiter) = self.lock().remove(&(conn, id)) else {
            warn!(conn, id, "Reply for unknown or abandoned request");
            return;
        };
        let _ = waiter.send(reply_result(result).map_err(Error::from));
    }

    /// Fail every waiter on one connection with `ConnectionLost`.
    pub fn fail_connection(&self, conn: ConnectionId) {
        let failed: Vec<Waiter> = {
            let mut waiters = self.lock();
            let keys: Vec<Key> = waiters.keys().filter(|(c, _)| *c == conn).copied().collect();
            keys.iter().filter_map(|k| waiters.remove(k)).collect()
        };
        for waiter in failed {
            let _ = waiter.send(Err(Error::ConnectionLost));
        }
    }

    /// Fail every waiter with `ConnectionLost`.
    pub fn fail_all(&self) {
        let failed: Vec<Waiter> = self.lock().drain().map(|(_, w)| w).collect();
        for waiter in failed {
            let _ = waiter.send(Err(Error::ConnectionLost));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let pending = PendingRequests::new();
        let (_guard, rx) = pending.register(1, 0);
        pending.resolve(1, 0, Payload::from(42));
        assert_eq!(rx.await.unwrap().unwrap(), Payload::from(42));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_becomes_client_error() {
        let pending = PendingRequests::new();
        let (_guard, rx) = pending.register(1, 3);
        pending.resolve(
            1,
            3,
            Payload::Map(vec![
                (Payload::from("_error"), Payload::from("KeyError")),
                (Payload::from("key"), Payload::from("x")),
            ]),
        );
        match rx.await.unwrap() {
            Err(Error::Client(err)) => {
                assert_eq!(err.error, Payload::from("KeyError"));
                assert_eq!(err.get("key"), Some(&Payload::from("x")));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_connection_is_scoped() {
        let pending = PendingRequests::new();
        let (_g1, rx1) = pending.register(1, 0);
        let (_g2, rx2) = pending.register(2, 0);

        pending.fail_connection(1);
        assert!(matches!(rx1.await.unwrap(), Err(Error::ConnectionLost)));
        assert_eq!(pending.len(), 1);

        pending.fail_all();
        assert!(matches!(rx2.await.unwrap(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_dropped_guard_removes_waiter() {
        let pending = PendingRequests::new();
        let (guard, _rx) = pending.register(7, 9);
        assert_eq!(pending.len(), 1);
        drop(guard);
        assert!(pending.is_empty());
        // Late reply is ignored.
        pending.resolve(7, 9, Payload::Nil);
    }
}
