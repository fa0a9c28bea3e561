//! Registries mapping stable ids to live [`Session`]s (spec §4.6).
//!
//! Two lookups are needed in practice: the server side keys sessions by
//! the client identity presented during the TLS+Upgrade handshake (spec
//! §4.10), while a backup job keys its VSSFS session by job id (spec
//! §4.7). Both are just O(1) concurrent maps; [`SessionManager`] is
//! generic over the key type so both reuse the same bookkeeping
//! (registration logging, removal closing the session) rather than
//! duplicating it.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::mux::Mux;
use crate::session::Session;

/// Keeps a set of live [`Session`]s addressable by `K`, closing each one
/// when it's removed so callers never leak a reconnect loop or accept
/// task.
pub struct SessionManager<K, M: Mux> {
    sessions: DashMap<K, Arc<Session<M>>>,
    label: &'static str,
}

impl<K, M> SessionManager<K, M>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    M: Mux + 'static,
{
    pub fn new(label: &'static str) -> Self {
        Self { sessions: DashMap::new(), label }
    }

    /// Registers `session` under `key`, replacing and closing any session
    /// previously registered there (spec §4.7: starting a new session for
    /// a key that already has one live tears the old one down first).
    pub fn insert(&self, key: K, session: Arc<Session<M>>) {
        if let Some((_, previous)) = self.sessions.remove(&key) {
            previous.close();
        }
        self.sessions.insert(key.clone(), session);
        info!(key = ?key, label = self.label, live = self.sessions.len(), "session registered");
    }

    pub fn get(&self, key: &K) -> Option<Arc<Session<M>>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes and closes the session registered under `key`, if any.
    pub fn remove(&self, key: &K) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.close();
            info!(key = ?key, label = self.label, live = self.sessions.len(), "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArpcError;
    use crate::session::{ReconnectFn, SessionConfig};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    struct DeadMux;

    #[async_trait]
    impl Mux for DeadMux {
        type Stream = DuplexStream;

        async fn open_stream(&self) -> Result<Self::Stream, ArpcError> {
            Err(ArpcError::ConnectionLost)
        }

        async fn accept_stream(&self) -> Result<Self::Stream, ArpcError> {
            Err(ArpcError::ConnectionLost)
        }
    }

    fn never_reconnect() -> ReconnectFn<DeadMux> {
        Arc::new(|| Box::pin(async { Err(ArpcError::ConnectionLost) }))
    }

    #[tokio::test]
    async fn inserting_over_an_existing_key_closes_the_old_session() {
        let manager: SessionManager<String, DeadMux> = SessionManager::new("test");
        let first = Session::new(DeadMux, never_reconnect(), SessionConfig::default());
        manager.insert("job1".to_string(), Arc::clone(&first));
        assert!(!first.is_closed());

        let second = Session::new(DeadMux, never_reconnect(), SessionConfig::default());
        manager.insert("job1".to_string(), Arc::clone(&second));

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn remove_closes_and_drops_the_session() {
        let manager: SessionManager<String, DeadMux> = SessionManager::new("test");
        let session = Session::new(DeadMux, never_reconnect(), SessionConfig::default());
        manager.insert("job1".to_string(), Arc::clone(&session));
        manager.remove(&"job1".to_string());

        assert!(session.is_closed());
        assert!(manager.get(&"job1".to_string()).is_none());
        assert!(manager.is_empty());
    }
}
