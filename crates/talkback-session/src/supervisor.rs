//! Two-tier task supervision.
//!
//! Every session owns a persistent scope that lives as long as the session
//! and a connection scope, nested inside it, that is replaced whenever a
//! connection attaches. Cancelling the persistent scope cancels both.
//!
//! Tasks that return an error or panic are reported on the failure channel
//! handed out by [`Supervisor::new`]. Tasks stopped through cancellation are
//! not failures.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use talkback_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// Supervision scope of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Cancelled when the current connection goes away.
    Connection,
    /// Survives reconnects; cancelled only when the session ends.
    Persistent,
}

/// A supervised task that did not finish cleanly.
#[derive(Debug)]
pub struct TaskFailure {
    pub name: String,
    pub scope: Scope,
    pub error: Error,
}

#[derive(Clone)]
struct ScopeHandle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ScopeHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
        }
    }

    fn cancel(&self) {
        self.tracker.close();
        self.token.cancel();
    }
}

/// Owner of a session's two task scopes.
pub struct Supervisor {
    persistent: ScopeHandle,
    connection: Mutex<ScopeHandle>,
    failures: mpsc::UnboundedSender<TaskFailure>,
}

impl Supervisor {
    /// Create a supervisor and the receiver its task failures are reported on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let persistent = ScopeHandle::new(CancellationToken::new());
        let connection = ScopeHandle::new(persistent.token.child_token());
        let supervisor = Self {
            persistent,
            connection: Mutex::new(connection),
            failures,
        };
        (supervisor, rx)
    }

    fn handle(&self, scope: Scope) -> ScopeHandle {
        match scope {
            Scope::Persistent => self.persistent.clone(),
            Scope::Connection => self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Spawn a task into a scope.
    ///
    /// Returns a token that cancels just this task. A task spawned into an
    /// already cancelled scope never runs.
    pub fn spawn_in<F>(&self, scope: Scope, name: impl Into<String>, fut: F) -> CancellationToken
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.handle(scope);
        let token = handle.token.child_token();
        let task_token = token.clone();
        let failures = self.failures.clone();

        handle.tracker.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = task_token.cancelled() => {
                    debug!(task = %name, ?scope, "Task cancelled");
                    return;
                }
                outcome = AssertUnwindSafe(fut).catch_unwind() => outcome,
            };

            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(task = %name, ?scope, "Task finished");
                    return;
                }
                Ok(Err(e)) => e,
                Err(panic) => Error::TaskFailed {
                    name: name.clone(),
                    reason: panic_message(panic.as_ref()),
                },
            };

            if failures.send(TaskFailure { name, scope, error }).is_err() {
                warn!("Task failed after its session was dropped");
            }
        });

        token
    }

    /// Cancel every task in a scope. Cancelling the persistent scope also
    /// cancels the connection scope.
    pub fn cancel(&self, scope: Scope) {
        self.handle(scope).cancel();
    }

    /// Cancel the current connection scope and open a fresh one.
    pub fn renew_connection_scope(&self) {
        let fresh = ScopeHandle::new(self.persistent.token.child_token());
        let old = std::mem::replace(
            &mut *self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        old.cancel();
    }

    /// Whether the persistent scope has been cancelled.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.persistent.token.is_cancelled()
    }

    /// Cancel both scopes and wait up to `timeout` for their tasks to stop.
    pub async fn shutdown(&self, timeout: Duration) {
        let connection = self.handle(Scope::Connection);
        self.persistent.cancel();
        connection.cancel();

        let drain = async {
            connection.tracker.wait().await;
            self.persistent.tracker.wait().await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Supervised tasks still running after {timeout:?}");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}
