use super::session::Session;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{fmt, sync::Arc};

/// Correlation key of a session in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Original dialog id of an orchestrated call.
    Orchestrated(String),
    /// Call-ID of a non-orchestrated dialog.
    Auxiliary(String),
    /// Alias set of a liveness probe.
    Ping(String),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Orchestrated(id) => write!(f, "orch:{}", id),
            SessionKey::Auxiliary(id) => write!(f, "aux:{}", id),
            SessionKey::Ping(id) => write!(f, "ping:{}", id),
        }
    }
}

/// Process-wide map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    /// Returns the session for `key`, creating it with `create` under the
    /// map's entry lock so concurrent callers never build two. The flag is
    /// `true` when this call created it.
    pub fn find_or_create<E>(
        &self,
        key: SessionKey,
        create: impl FnOnce(&SessionKey) -> Result<Session, E>,
    ) -> Result<(Arc<Session>, bool), E> {
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let session = Arc::new(create(entry.key())?);
                entry.insert(session.clone());
                Ok((session, true))
            }
        }
    }

    /// Removes `key` only while it still maps to `session`.
    pub fn remove(&self, key: &SessionKey, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
