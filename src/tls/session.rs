//! Resumable sessions and the bounded session cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use zeroize::Zeroize;

use crate::tls::crypto::MASTER_SECRET_LEN;

pub const SESSION_ID_LEN: usize = 32;
pub type SessionId = [u8; SESSION_ID_LEN];

/// What a resumed handshake needs: id, master secret and suite.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    master: [u8; MASTER_SECRET_LEN],
    cipher_suite: u16,
    created: Instant,
}

impl Session {
    pub fn new(id: SessionId, master: [u8; MASTER_SECRET_LEN], cipher_suite: u16) -> Self {
        Self {
            id,
            master,
            cipher_suite,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn master_secret(&self) -> &[u8; MASTER_SECRET_LEN] {
        &self.master
    }

    pub fn cipher_suite(&self) -> u16 {
        self.cipher_suite
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.created.elapsed() >= lifetime
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.master.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &hex_prefix(&self.id))
            .field("cipher_suite", &format_args!("{:#06x}", self.cipher_suite))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(id: &[u8]) -> String {
    id.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Server-side cache, shared by clone. Holds at most `capacity` sessions,
/// evicting the oldest; entries past `lifetime` are treated as misses.
#[derive(Clone)]
pub struct SessionCache {
    entries: Arc<DashMap<SessionId, Session>>,
    capacity: usize,
    lifetime: Duration,
}

impl SessionCache {
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            capacity,
            lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A live session for `id`. Expired entries are removed on the way.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        let session = self.entries.get(id).map(|e| e.value().clone())?;
        if session.is_expired(self.lifetime) {
            self.entries.remove(id);
            return None;
        }
        Some(session)
    }

    /// Store or refresh a session.
    pub fn insert(&self, session: Session) {
        if self.capacity == 0 {
            return;
        }
        self.purge_expired();
        if !self.entries.contains_key(session.id()) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().created())
                .map(|e| *e.key());
            if let Some(id) = oldest {
                self.entries.remove(&id);
            }
        }
        self.entries.insert(*session.id(), session);
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn purge_expired(&self) {
        let lifetime = self.lifetime;
        self.entries.retain(|_, s| !s.is_expired(lifetime));
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tag: u8) -> Session {
        Session::new([tag; SESSION_ID_LEN], [tag; MASTER_SECRET_LEN], 0xCCA9)
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = SessionCache::new(4, Duration::from_secs(10));
        cache.insert(session(1));
        assert!(cache.get(&[1; SESSION_ID_LEN]).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&[1; SESSION_ID_LEN]).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_is_evicted_at_capacity() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        cache.insert(session(1));
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.insert(session(2));
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.insert(session(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&[1; SESSION_ID_LEN]).is_none());
        assert!(cache.get(&[3; SESSION_ID_LEN]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reinsert_refreshes_timestamp() {
        let cache = SessionCache::new(2, Duration::from_secs(10));
        cache.insert(session(1));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert(session(1));
        tokio::time::advance(Duration::from_secs(8)).await;
        let got = cache.get(&[1; SESSION_ID_LEN]).unwrap();
        assert_eq!(got.master_secret(), &[1; MASTER_SECRET_LEN]);
    }
}
