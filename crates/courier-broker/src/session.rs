// Live connections and the principals bound to them.
use courier_common::ids::ConnectionId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::auth::Principal;

#[derive(Debug)]
struct SessionState {
    id: ConnectionId,
    principal: Principal,
    // Per-connection token that scopes every inbox this session creates.
    inbox_root: String,
    connected_at: Instant,
    closed: AtomicBool,
}

/// Handle to an authenticated connection. Clones share state.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionState>,
}

impl Session {
    fn new(principal: Principal) -> Self {
        let id = ConnectionId::new();
        Self {
            inner: Arc::new(SessionState {
                id,
                principal,
                inbox_root: ConnectionId::new().simple(),
                connected_at: Instant::now(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    pub fn account(&self) -> &str {
        self.inner.principal.account()
    }

    pub fn inbox_root(&self) -> &str {
        &self.inner.inbox_root
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // True only for the caller that performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub(crate) fn register(&self, principal: Principal) -> Session {
        let session = Session::new(principal);
        self.sessions.insert(session.id(), session.clone());
        metrics::gauge!("courier_connections").set(self.sessions.len() as f64);
        session
    }

    pub(crate) fn deregister(&self, id: ConnectionId) -> Option<Session> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        metrics::gauge!("courier_connections").set(self.sessions.len() as f64);
        removed
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
