//! Process-wide session registry.

use std::{collections::HashMap, sync::Arc};

use talkback_core::SessionId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{app::AppSession, session::Session};

/// Outcome of a session claiming a client-supplied identity.
pub enum Claim<A: AppSession> {
    /// Another live session already has the identity. The claiming session
    /// has been removed from the registry.
    Existing(Arc<Session<A>>),
    /// The identity was free and the claiming session now carries it.
    Adopted,
}

/// Identity to session map. Holds the only long-lived strong references to
/// sessions.
pub struct SessionRegistry<A: AppSession> {
    sessions: RwLock<HashMap<SessionId, Arc<Session<A>>>>,
}

impl<A: AppSession> SessionRegistry<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session under its current identity, replacing any entry
    /// with the same identity.
    pub async fn register(&self, session: Arc<Session<A>>) {
        let id = session.id();
        self.sessions.write().await.insert(id, session);
        debug!(session = %id, "Session registered");
    }

    pub async fn lookup(&self, id: SessionId) -> Option<Arc<Session<A>>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn unregister(&self, id: SessionId) -> Option<Arc<Session<A>>> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            debug!(session = %id, "Session unregistered");
        }
        removed
    }

    /// Remove `session` only if it is the entry under its identity.
    pub async fn unregister_if(&self, session: &Arc<Session<A>>) -> bool {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        if sessions.get(&id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&id);
            debug!(session = %id, "Session unregistered");
            true
        } else {
            false
        }
    }

    /// Let `session` claim `id` in one step.
    ///
    /// If another session already holds `id`, the claimant is removed and the
    /// holder returned. Otherwise the claimant is re-keyed under `id`.
    pub async fn claim(&self, session: &Arc<Session<A>>, id: SessionId) -> Claim<A> {
        let mut sessions = self.sessions.write().await;
        let current = session.id();
        let owned = sessions
            .get(&current)
            .is_some_and(|s| Arc::ptr_eq(s, session));

        if let Some(existing) = sessions.get(&id).filter(|s| !Arc::ptr_eq(s, session)) {
            let existing = Arc::clone(existing);
            if owned {
                sessions.remove(&current);
            }
            return Claim::Existing(existing);
        }

        if owned {
            sessions.remove(&current);
        }
        session.set_id(id);
        sessions.insert(id, Arc::clone(session));
        debug!(from = %current, to = %id, "Session re-keyed");
        Claim::Adopted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Point-in-time copy of every live session.
    pub async fn snapshot(&self) -> Vec<Arc<Session<A>>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

impl<A: AppSession> Default for SessionRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}
