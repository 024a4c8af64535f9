//! Persistence port definition.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::domain::entities::PersistenceEntry;
use crate::domain::errors::PersistenceResult;

/// Key-value blob store backing the business-object cacher.
///
/// Implementations guarantee per-key atomic replace-or-insert and reject
/// empty keys with [`PersistenceError::InvalidKey`].
///
/// [`PersistenceError::InvalidKey`]: crate::domain::errors::PersistenceError::InvalidKey
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Prepares the storage. Must be called before any other operation.
    async fn initialize(&self) -> PersistenceResult<()>;

    /// Reads the entry stored under `key`.
    async fn read_entry(&self, key: &str) -> PersistenceResult<Option<PersistenceEntry>>;

    /// Stores `payload` under `key`, replacing any previous entry.
    /// Returns a copy of the payload when `return_copy` is set.
    async fn write_entry(
        &self,
        key: &str,
        payload: Bytes,
        timestamp: DateTime<Utc>,
        context: Option<Bytes>,
        return_copy: bool,
    ) -> PersistenceResult<Option<Bytes>>;

    /// Removes the entry stored under `key`, if any.
    async fn remove_entry(&self, key: &str) -> PersistenceResult<()>;

    /// Lists every stored key.
    async fn list_keys(&self) -> PersistenceResult<Vec<String>>;

    /// Returns when `key` was last written.
    async fn last_update(&self, key: &str) -> PersistenceResult<Option<DateTime<Utc>>>;

    /// Removes every entry.
    async fn clear(&self) -> PersistenceResult<()>;

    /// Flushes and releases the storage. Further calls fail with `Closed`.
    async fn close(&self) -> PersistenceResult<()>;

    /// Applies the backend's clean-up policy. Returns the number of removed entries.
    async fn run_cleanup_policy(&self) -> PersistenceResult<usize>;

    /// Deletes the underlying storage so that `initialize` starts afresh.
    async fn purge(&self) -> PersistenceResult<()>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::errors::{PersistenceError, check_key};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// In-memory persistence for testing.
    #[derive(Default)]
    pub struct MemoryPersistence {
        entries: RwLock<BTreeMap<String, PersistenceEntry>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        corrupted: RwLock<Vec<String>>,
        failing_writes: AtomicBool,
    }

    impl MemoryPersistence {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts an entry directly.
        pub async fn seed(&self, entry: PersistenceEntry) {
            self.entries.write().await.insert(entry.key.clone(), entry);
        }

        /// Makes reads of `key` fail as corrupted.
        pub async fn corrupt(&self, key: &str) {
            self.corrupted.write().await.push(key.to_string());
        }

        /// Makes every later write fail as if the backend were closed.
        pub fn fail_writes(&self) {
            self.failing_writes.store(true, Ordering::SeqCst);
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Persistence for MemoryPersistence {
        fn name(&self) -> &str {
            "memory"
        }

        async fn initialize(&self) -> PersistenceResult<()> {
            Ok(())
        }

        async fn read_entry(&self, key: &str) -> PersistenceResult<Option<PersistenceEntry>> {
            check_key(key)?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.corrupted.read().await.iter().any(|k| k == key) {
                return Err(PersistenceError::corrupted(key));
            }
            Ok(self.entries.read().await.get(key).cloned())
        }

        async fn write_entry(
            &self,
            key: &str,
            payload: Bytes,
            timestamp: DateTime<Utc>,
            context: Option<Bytes>,
            return_copy: bool,
        ) -> PersistenceResult<Option<Bytes>> {
            check_key(key)?;
            if self.failing_writes.load(Ordering::SeqCst) {
                return Err(PersistenceError::closed(self.name()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let copy = return_copy.then(|| payload.clone());
            self.entries.write().await.insert(
                key.to_string(),
                PersistenceEntry::new(key, payload, timestamp, context),
            );
            Ok(copy)
        }

        async fn remove_entry(&self, key: &str) -> PersistenceResult<()> {
            check_key(key)?;
            self.entries.write().await.remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> PersistenceResult<Vec<String>> {
            Ok(self.entries.read().await.keys().cloned().collect())
        }

        async fn last_update(&self, key: &str) -> PersistenceResult<Option<DateTime<Utc>>> {
            check_key(key)?;
            Ok(self.entries.read().await.get(key).map(|e| e.timestamp))
        }

        async fn clear(&self) -> PersistenceResult<()> {
            self.entries.write().await.clear();
            Ok(())
        }

        async fn close(&self) -> PersistenceResult<()> {
            Ok(())
        }

        async fn run_cleanup_policy(&self) -> PersistenceResult<usize> {
            Ok(0)
        }

        async fn purge(&self) -> PersistenceResult<()> {
            self.clear().await
        }
    }
}
