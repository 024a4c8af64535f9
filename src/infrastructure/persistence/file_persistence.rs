//! File-per-key persistence backend.
//!
//! Each payload lives in its own numbered file under the storage directory,
//! with a small header carrying the timestamp and the optional context. A
//! sidecar index maps keys to file names and is rewritten on every structural
//! change. Reads and writes of one key are serialized; different keys proceed
//! concurrently.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::domain::entities::{PersistenceEntry, UriUsage, timestamp_from_millis};
use crate::domain::errors::{PersistenceError, PersistenceResult, check_key};
use crate::domain::ports::Persistence;

use super::file_index::{FileIndex, INDEX_FILE};
use super::key_locks::KeyLocks;

/// Default number of files kept before the least used half is dropped.
pub const DEFAULT_MAX_FILE_COUNT: usize = 512;

const MAGIC: &[u8; 4] = b"VCE1";
const HEADER_LEN: usize = 4 + 8 + 4;
const NO_CONTEXT: u32 = u32::MAX;

#[derive(Debug)]
enum IndexState {
    Uninitialized,
    Open(FileIndex),
    Closed,
}

/// Persistence storing one file per key.
#[derive(Debug)]
pub struct FilePersistence {
    directory: PathBuf,
    max_file_count: usize,
    index: Mutex<IndexState>,
    locks: KeyLocks,
}

impl FilePersistence {
    /// Creates a backend rooted at `directory`. Nothing touches the disk
    /// before [`Persistence::initialize`].
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, max_file_count: usize) -> Self {
        Self {
            directory: directory.into(),
            max_file_count: max_file_count.max(1),
            index: Mutex::new(IndexState::Uninitialized),
            locks: KeyLocks::new(),
        }
    }

    /// The storage directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }

    fn state_error(&self, state: &IndexState) -> PersistenceError {
        match state {
            IndexState::Closed => PersistenceError::closed(self.name()),
            _ => PersistenceError::not_initialized(self.name()),
        }
    }

    /// Runs `f` on the open index.
    async fn with_index<T>(&self, f: impl FnOnce(&mut FileIndex) -> T) -> PersistenceResult<T> {
        let mut state = self.index.lock().await;
        match &mut *state {
            IndexState::Open(index) => Ok(f(index)),
            other => Err(self.state_error(other)),
        }
    }

    async fn save_index(&self, index: &FileIndex) -> PersistenceResult<()> {
        write_atomically(&self.directory.join(INDEX_FILE), index.render().as_bytes()).await
    }

    async fn delete_file(&self, file: &str) {
        if let Err(e) = fs::remove_file(self.file_path(file)).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(file, error = %e, "Failed to delete payload file");
        }
    }

    /// Deletes the files of entries already dropped from the index. Each file
    /// goes under its key's lock, and is kept if the index points at it again.
    /// The caller must not hold the lock of any dropped key.
    async fn delete_dropped(&self, dropped: Vec<UriUsage>) {
        for usage in dropped {
            let _guard = self.locks.lock(&usage.uri).await;
            let reused = self
                .with_index(|index| {
                    index
                        .get(&usage.uri)
                        .is_some_and(|current| current.storage_file == usage.storage_file)
                })
                .await
                .unwrap_or(false);
            if reused {
                continue;
            }
            self.delete_file(&usage.storage_file).await;
        }
    }

    /// Looks up the file of `key`, allocating one (and evicting if the
    /// directory is full) when it is new. Evicted entries land in `evicted`
    /// even when saving the index fails.
    async fn file_for_write(
        &self,
        key: &str,
        evicted: &mut Vec<UriUsage>,
    ) -> PersistenceResult<String> {
        let mut state = self.index.lock().await;
        let index = match &mut *state {
            IndexState::Open(index) => index,
            other => return Err(self.state_error(other)),
        };

        if let Some(file) = index.touch(key) {
            return Ok(file);
        }

        if index.len() >= self.max_file_count {
            evicted.extend(index.evict_least_used());
            debug!(
                evicted = evicted.len(),
                max = self.max_file_count,
                "File count ceiling reached, dropped least used entries"
            );
        }
        let file = index.allocate(key);
        self.save_index(index).await?;
        Ok(file)
    }

    async fn write_locked(
        &self,
        key: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
        context: Option<&[u8]>,
        evicted: &mut Vec<UriUsage>,
    ) -> PersistenceResult<()> {
        let file = self.file_for_write(key, evicted).await?;
        let encoded = encode_payload_file(payload, timestamp, context)?;
        write_atomically(&self.file_path(&file), &encoded).await?;
        trace!(key, file = %file, size = payload.len(), "Entry written");
        Ok(())
    }

    /// Drops `key` from the index after its file vanished.
    async fn forget_missing(&self, key: &str) -> PersistenceResult<()> {
        let mut state = self.index.lock().await;
        if let IndexState::Open(index) = &mut *state
            && index.remove(key).is_some()
        {
            warn!(key, "Payload file missing, dropping index entry");
            self.save_index(index).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    fn name(&self) -> &str {
        "file"
    }

    async fn initialize(&self) -> PersistenceResult<()> {
        fs::create_dir_all(&self.directory).await?;

        let index = match fs::read_to_string(self.directory.join(INDEX_FILE)).await {
            Ok(text) => FileIndex::parse(&text)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => FileIndex::new(),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(PersistenceError::corrupted("index file is not valid UTF-8"));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            directory = %self.directory.display(),
            entries = index.len(),
            "File persistence initialized"
        );
        *self.index.lock().await = IndexState::Open(index);
        Ok(())
    }

    async fn read_entry(&self, key: &str) -> PersistenceResult<Option<PersistenceEntry>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;

        let Some(file) = self.with_index(|index| index.touch(key)).await? else {
            trace!(key, "File persistence miss");
            return Ok(None);
        };

        match fs::read(self.file_path(&file)).await {
            Ok(raw) => {
                let (timestamp, context, payload) = decode_payload_file(Bytes::from(raw), key)?;
                Ok(Some(PersistenceEntry::new(key, payload, timestamp, context)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget_missing(key).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
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
        let mut evicted = Vec::new();
        let guard = self.locks.lock(key).await;
        let written = self
            .write_locked(key, &payload, timestamp, context.as_deref(), &mut evicted)
            .await;
        drop(guard);

        // Victims are locked one at a time, with no other key held.
        self.delete_dropped(evicted).await;
        written?;
        Ok(return_copy.then_some(payload))
    }

    async fn remove_entry(&self, key: &str) -> PersistenceResult<()> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;

        let removed = {
            let mut state = self.index.lock().await;
            let index = match &mut *state {
                IndexState::Open(index) => index,
                other => return Err(self.state_error(other)),
            };
            let removed = index.remove(key);
            if removed.is_some() {
                self.save_index(index).await?;
            }
            removed
        };

        if let Some(usage) = removed {
            self.delete_file(&usage.storage_file).await;
        }
        Ok(())
    }

    async fn list_keys(&self) -> PersistenceResult<Vec<String>> {
        self.with_index(|index| index.keys().cloned().collect())
            .await
    }

    async fn last_update(&self, key: &str) -> PersistenceResult<Option<DateTime<Utc>>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;

        let Some(file) = self
            .with_index(|index| index.get(key).map(|usage| usage.storage_file.clone()))
            .await?
        else {
            return Ok(None);
        };

        let mut header = [0u8; HEADER_LEN];
        match fs::File::open(self.file_path(&file)).await {
            Ok(mut handle) => {
                handle.read_exact(&mut header).await.map_err(|_| {
                    PersistenceError::corrupted(format!("truncated payload file for {key}"))
                })?;
                let (timestamp, _) = decode_header(&header, key)?;
                Ok(Some(timestamp))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> PersistenceResult<()> {
        let removed = {
            let mut state = self.index.lock().await;
            let index = match &mut *state {
                IndexState::Open(index) => index,
                other => return Err(self.state_error(other)),
            };
            let removed = index.clear();
            self.save_index(index).await?;
            removed
        };

        let count = removed.len();
        self.delete_dropped(removed).await;
        debug!(count, "File persistence cleared");
        Ok(())
    }

    async fn close(&self) -> PersistenceResult<()> {
        let mut state = self.index.lock().await;
        if let IndexState::Open(index) = &*state {
            self.save_index(index).await?;
        }
        *state = IndexState::Closed;
        debug!(directory = %self.directory.display(), "File persistence closed");
        Ok(())
    }

    async fn run_cleanup_policy(&self) -> PersistenceResult<usize> {
        let evicted = {
            let mut state = self.index.lock().await;
            let index = match &mut *state {
                IndexState::Open(index) => index,
                other => return Err(self.state_error(other)),
            };
            if index.len() < self.max_file_count {
                return Ok(0);
            }
            let evicted = index.evict_least_used();
            self.save_index(index).await?;
            evicted
        };

        let count = evicted.len();
        self.delete_dropped(evicted).await;
        Ok(count)
    }

    async fn purge(&self) -> PersistenceResult<()> {
        let mut state = self.index.lock().await;
        match fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *state = IndexState::Uninitialized;
        warn!(directory = %self.directory.display(), "File persistence purged");
        Ok(())
    }
}

/// Writes through a temporary file in the same directory, then renames it
/// over `path`, so readers never see a partial file.
async fn write_atomically(path: &Path, contents: &[u8]) -> PersistenceResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn encode_payload_file(
    payload: &[u8],
    timestamp: DateTime<Utc>,
    context: Option<&[u8]>,
) -> PersistenceResult<Bytes> {
    let context_len = context.map_or(0, <[u8]>::len);
    let mut out = BytesMut::with_capacity(HEADER_LEN + context_len + payload.len());
    out.put_slice(MAGIC);
    out.put_i64(timestamp.timestamp_millis());
    match context {
        Some(context) => {
            let len = u32::try_from(context.len())
                .ok()
                .filter(|len| *len != NO_CONTEXT)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "context exceeds 4 GiB")
                })?;
            out.put_u32(len);
            out.put_slice(context);
        }
        None => out.put_u32(NO_CONTEXT),
    }
    out.put_slice(payload);
    Ok(out.freeze())
}

fn decode_header(header: &[u8], key: &str) -> PersistenceResult<(DateTime<Utc>, u32)> {
    if header.len() < HEADER_LEN || &header[..4] != MAGIC {
        return Err(PersistenceError::corrupted(format!("bad payload header for {key}")));
    }
    let mut millis = [0u8; 8];
    millis.copy_from_slice(&header[4..12]);
    let mut context_len = [0u8; 4];
    context_len.copy_from_slice(&header[12..16]);
    Ok((
        timestamp_from_millis(i64::from_be_bytes(millis)),
        u32::from_be_bytes(context_len),
    ))
}

fn decode_payload_file(
    raw: Bytes,
    key: &str,
) -> PersistenceResult<(DateTime<Utc>, Option<Bytes>, Bytes)> {
    let (timestamp, context_len) = decode_header(&raw, key)?;
    let body = raw.slice(HEADER_LEN..);

    if context_len == NO_CONTEXT {
        return Ok((timestamp, None, body));
    }
    let context_len = context_len as usize;
    if context_len > body.len() {
        return Err(PersistenceError::corrupted(format!(
            "context of {key} overruns the payload file"
        )));
    }
    Ok((
        timestamp,
        Some(body.slice(..context_len)),
        body.slice(context_len..),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, max_files: usize) -> FilePersistence {
        let backend = FilePersistence::new(dir.path().join("store"), max_files);
        backend.initialize().await.unwrap();
        backend
    }

    fn ts(millis: i64) -> DateTime<Utc> {
        timestamp_from_millis(millis)
    }

    #[tokio::test]
    async fn test_round_trip_with_context() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;

        backend
            .write_entry(
                "https://example.com/feed",
                Bytes::from_static(b"{\"items\":[]}"),
                ts(1_700_000_000_000),
                Some(Bytes::from_static(b"ctx")),
                false,
            )
            .await
            .unwrap();

        let entry = backend
            .read_entry("https://example.com/feed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload, Bytes::from_static(b"{\"items\":[]}"));
        assert_eq!(entry.timestamp, ts(1_700_000_000_000));
        assert_eq!(entry.context, Some(Bytes::from_static(b"ctx")));
        assert_eq!(
            backend.last_update("https://example.com/feed").await.unwrap(),
            Some(ts(1_700_000_000_000))
        );
    }

    #[tokio::test]
    async fn test_round_trip_without_context_and_copy() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;

        let copy = backend
            .write_entry("k", Bytes::from_static(b"v"), ts(5), None, true)
            .await
            .unwrap();
        assert_eq!(copy, Some(Bytes::from_static(b"v")));

        let entry = backend.read_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.context, None);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;

        assert!(matches!(
            backend.read_entry("").await,
            Err(PersistenceError::InvalidKey)
        ));
        assert!(matches!(
            backend
                .write_entry(" ", Bytes::new(), Utc::now(), None, false)
                .await,
            Err(PersistenceError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir, 16).await;
            backend
                .write_entry("a", Bytes::from_static(b"1"), ts(1), None, false)
                .await
                .unwrap();
            backend
                .write_entry("b", Bytes::from_static(b"2"), ts(2), None, false)
                .await
                .unwrap();
            backend.remove_entry("a").await.unwrap();
            backend.close().await.unwrap();
            assert!(matches!(
                backend.read_entry("b").await,
                Err(PersistenceError::Closed { .. })
            ));
        }

        let backend = open(&dir, 16).await;
        assert_eq!(backend.list_keys().await.unwrap(), vec!["b".to_string()]);
        let entry = backend.read_entry("b").await.unwrap().unwrap();
        assert_eq!(entry.payload, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_uninitialized_backend_refuses_work() {
        let dir = TempDir::new().unwrap();
        let backend = FilePersistence::new(dir.path(), 4);
        assert!(matches!(
            backend.list_keys().await,
            Err(PersistenceError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_count_ceiling_evicts_least_used_half() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 4).await;

        for key in ["a", "b", "c", "d"] {
            backend
                .write_entry(key, Bytes::from_static(b"x"), ts(1), None, false)
                .await
                .unwrap();
        }
        for _ in 0..3 {
            backend.read_entry("a").await.unwrap();
            backend.read_entry("c").await.unwrap();
        }

        backend
            .write_entry("e", Bytes::from_static(b"x"), ts(1), None, false)
            .await
            .unwrap();

        let mut keys = backend.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "c", "e"]);
        assert!(backend.read_entry("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_reported() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;
        backend
            .write_entry("k", Bytes::from_static(b"v"), ts(1), None, false)
            .await
            .unwrap();

        let file = backend
            .with_index(|index| index.get("k").unwrap().storage_file.clone())
            .await
            .unwrap();
        fs::write(backend.file_path(&file), b"garbage").await.unwrap();

        let err = backend.read_entry("k").await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_corrupted_index_fails_initialize_and_purge_recovers() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        fs::create_dir_all(&root).await.unwrap();
        fs::write(root.join(INDEX_FILE), "this line has no separator\n")
            .await
            .unwrap();

        let backend = FilePersistence::new(&root, 4);
        assert!(backend.initialize().await.unwrap_err().is_corruption());

        backend.purge().await.unwrap();
        backend.initialize().await.unwrap();
        assert!(backend.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_payload_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;
        backend
            .write_entry("k", Bytes::from_static(b"v"), ts(1), None, false)
            .await
            .unwrap();
        let file = backend
            .with_index(|index| index.get("k").unwrap().storage_file.clone())
            .await
            .unwrap();
        fs::remove_file(backend.file_path(&file)).await.unwrap();

        assert!(backend.read_entry("k").await.unwrap().is_none());
        assert!(backend.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_key_serialize() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(open(&dir, 16).await);

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    backend
                        .write_entry("shared", Bytes::from(vec![i; 1024]), ts(i64::from(i)), None, false)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let entry = backend.read_entry("shared").await.unwrap().unwrap();
        let value = entry.payload[0];
        assert!(entry.payload.iter().all(|b| *b == value));
        assert_eq!(entry.timestamp, ts(i64::from(value)));
        assert_eq!(backend.list_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_proceed_while_one_is_held() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;

        let _held = backend.locks.lock("busy").await;
        let other = tokio::time::timeout(
            Duration::from_millis(500),
            backend.write_entry("free", Bytes::from_static(b"v"), ts(1), None, false),
        )
        .await;
        assert!(other.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), backend.read_entry("busy")).await;
        assert!(blocked.is_err());
    }

    async fn payload_files(backend: &FilePersistence) -> Vec<String> {
        let mut dir_entries = fs::read_dir(backend.directory()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir_entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != INDEX_FILE {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_eviction_waits_for_evicted_key() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(open(&dir, 2).await);
        for key in ["a", "b"] {
            backend
                .write_entry(key, Bytes::from_static(b"v"), ts(1), None, false)
                .await
                .unwrap();
        }
        backend.read_entry("b").await.unwrap();
        let file_a = backend
            .with_index(|index| index.get("a").unwrap().storage_file.clone())
            .await
            .unwrap();

        let held = backend.locks.lock("a").await;
        let writer = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .write_entry("c", Bytes::from_static(b"v"), ts(1), None, false)
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert!(fs::try_exists(backend.file_path(&file_a)).await.unwrap());

        drop(held);
        writer.await.unwrap();

        let mut keys = backend.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(!fs::try_exists(backend.file_path(&file_a)).await.unwrap());
        assert_eq!(payload_files(&backend).await.len(), keys.len());
    }

    #[tokio::test]
    async fn test_rewrite_during_eviction_leaves_no_orphans() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(open(&dir, 4).await);

        let writers: Vec<_> = (0..40)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    let key = format!("k{}", i % 10);
                    backend
                        .write_entry(&key, Bytes::from(vec![1u8; 64]), ts(1), None, false)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let indexed = backend.list_keys().await.unwrap().len();
        assert!(indexed <= 4);
        assert_eq!(payload_files(&backend).await.len(), indexed);
    }

    #[tokio::test]
    async fn test_clear_removes_files() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir, 16).await;
        for key in ["a", "b"] {
            backend
                .write_entry(key, Bytes::from_static(b"v"), ts(1), None, false)
                .await
                .unwrap();
        }

        backend.clear().await.unwrap();

        assert!(backend.list_keys().await.unwrap().is_empty());
        let mut dir_entries = fs::read_dir(backend.directory()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir_entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![INDEX_FILE.to_string()]);
    }
}
