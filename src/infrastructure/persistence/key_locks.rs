//! Per-key async locks.
//!
//! A lock is created the first time a key is requested and dropped again as
//! soon as nobody holds or awaits it, so the map only ever contains keys in
//! flight. Waiters on one key are served in the order they asked. Guards own
//! a handle on the map and may be moved into spawned tasks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Map of locks keyed by cache key. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    locks: Arc<LockMap>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and takes it. Other keys are unaffected.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self.locks.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody waits for this key.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyLocks::new());
        let first_done = Arc::new(AtomicBool::new(false));

        let guard = locks.lock("k").await;
        let waiter = {
            let locks = locks.clone();
            let first_done = first_done.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
                first_done.load(Ordering::SeqCst)
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        first_done.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _held = locks.lock("a").await;

        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let locks = KeyLocks::new();
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let first = locks.lock("k").await;
        let mut waiters = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let order_tx = order_tx.clone();
            waiters.push(tokio::spawn(async move {
                let _guard = locks.lock("k").await;
                let _ = order_tx.send(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(i) = order_rx.try_recv() {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_guard_moves_into_task() {
        let locks = KeyLocks::new();
        let started = tokio::time::Instant::now();
        let guard = locks.lock("k").await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        let _again = locks.lock("k").await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_uncontended_locks_are_dropped() {
        let locks = KeyLocks::new();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.in_flight(), 2);
        }
        assert_eq!(locks.in_flight(), 0);
    }
}
