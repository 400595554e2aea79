use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use super::types::ConversationThread;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on thread {thread_id}: expected {expected}, found {actual}")]
    VersionConflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("history of thread {0} cannot shrink")]
    HistoryRewrite(String),

    #[error("thread store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Versioned persistence for conversation threads.
///
/// `put` succeeds only when the stored version equals `expected_version`
/// (0 meaning "no thread stored yet") and returns the new version.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError>;

    async fn put(
        &self,
        thread: &ConversationThread,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Drop threads idle past their TTL. Returns how many were removed.
    async fn purge_idle(&self) -> Result<usize, StoreError>;
}

struct StoredThread {
    thread: ConversationThread,
    last_access: Instant,
}

impl StoredThread {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_access.elapsed() > ttl
    }
}

/// DashMap-backed thread store with idle expiry.
#[derive(Clone)]
pub struct InMemoryThreadStore {
    storage: Arc<DashMap<String, StoredThread>>,
    idle_ttl: Duration,
}

impl InMemoryThreadStore {
    pub fn new(idle_ttl: Duration) -> Self {
        info!("Initializing in-memory thread store (idle ttl: {:?})", idle_ttl);
        Self {
            storage: Arc::new(DashMap::new()),
            idle_ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl Default for InMemoryThreadStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError> {
        let Some(mut entry) = self.storage.get_mut(thread_id) else {
            return Ok(None);
        };

        // Lazy expiry
        if entry.is_expired(self.idle_ttl) {
            drop(entry);
            self.storage.remove(thread_id);
            debug!("Thread {} expired, removed from store", thread_id);
            return Ok(None);
        }

        entry.last_access = Instant::now();
        Ok(Some(entry.thread.clone()))
    }

    async fn put(
        &self,
        thread: &ConversationThread,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let new_version = expected_version + 1;
        let mut stored = thread.clone();
        stored.version = new_version;

        match self.storage.entry(thread.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = !current.is_expired(self.idle_ttl);
                let actual = if live { current.thread.version } else { 0 };

                if actual != expected_version {
                    return Err(StoreError::VersionConflict {
                        thread_id: thread.id.clone(),
                        expected: expected_version,
                        actual,
                    });
                }
                if live && thread.history.len() < current.thread.history.len() {
                    return Err(StoreError::HistoryRewrite(thread.id.clone()));
                }

                occupied.insert(StoredThread {
                    thread: stored,
                    last_access: Instant::now(),
                });
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StoreError::VersionConflict {
                        thread_id: thread.id.clone(),
                        expected: expected_version,
                        actual: 0,
                    });
                }
                vacant.insert(StoredThread {
                    thread: stored,
                    last_access: Instant::now(),
                });
            }
        }

        debug!("Stored thread {} at version {}", thread.id, new_version);
        Ok(new_version)
    }

    async fn purge_idle(&self) -> Result<usize, StoreError> {
        let start_len = self.storage.len();
        let ttl = self.idle_ttl;
        self.storage.retain(|_, stored| !stored.is_expired(ttl));
        let count = start_len.saturating_sub(self.storage.len());

        if count > 0 {
            info!("Purged {} idle threads", count);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conversation::types::Turn;

    #[tokio::test]
    async fn test_put_and_get_bumps_version() {
        let store = InMemoryThreadStore::default();
        let mut thread = ConversationThread::new("t1");

        let v1 = store.put(&thread, 0).await.unwrap();
        assert_eq!(v1, 1);

        thread.history.push(Turn::user("hello"));
        let v2 = store.put(&thread, v1).await.unwrap();
        assert_eq!(v2, 2);

        let loaded = store.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.history.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryThreadStore::default();
        let thread = ConversationThread::new("t1");
        store.put(&thread, 0).await.unwrap();

        let err = store.put(&thread, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_history_cannot_shrink() {
        let store = InMemoryThreadStore::default();
        let mut thread = ConversationThread::new("t1");
        thread.history.push(Turn::user("a"));
        let v1 = store.put(&thread, 0).await.unwrap();

        thread.history.clear();
        let err = store.put(&thread, v1).await.unwrap_err();
        assert!(matches!(err, StoreError::HistoryRewrite(_)));
    }

    #[tokio::test]
    async fn test_idle_threads_expire() {
        let store = InMemoryThreadStore::new(Duration::from_millis(20));
        store.put(&ConversationThread::new("t1"), 0).await.unwrap();
        store.put(&ConversationThread::new("t2"), 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("t1").await.unwrap().is_none());
        assert_eq!(store.purge_idle().await.unwrap(), 1);
        assert!(store.is_empty());

        // An expired slot behaves like an absent one.
        store.put(&ConversationThread::new("t1"), 0).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
