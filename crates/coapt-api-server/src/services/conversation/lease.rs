use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-thread exclusive leases.
///
/// Holders of the same thread id queue in arrival order (tokio's mutex is
/// FIFO); different thread ids never contend.
#[derive(Clone, Default)]
pub struct ThreadLeases {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one invocation on a thread.
pub struct ThreadLease {
    thread_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        debug!("Lease released for thread {}", self.thread_id);
    }
}

impl ThreadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, thread_id: &str) -> ThreadLease {
        let lock = self
            .locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        debug!("Lease acquired for thread {}", thread_id);

        ThreadLease {
            thread_id: thread_id.to_string(),
            _guard: guard,
        }
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_thread_is_exclusive() {
        let leases = ThreadLeases::new();
        let first = leases.acquire("t1").await;

        let contender = {
            let leases = leases.clone();
            tokio::spawn(async move {
                let _lease = leases.acquire("t1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_millis(200), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_threads_do_not_block() {
        let leases = ThreadLeases::new();
        let _a = leases.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), leases.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_drops_idle_locks() {
        let leases = ThreadLeases::new();
        let held = leases.acquire("held").await;
        drop(leases.acquire("idle").await);

        assert_eq!(leases.prune(), 1);
        assert_eq!(leases.len(), 1);
        drop(held);
        assert_eq!(leases.prune(), 1);
        assert!(leases.is_empty());
    }
}
