//! Public front of the image engine.
//!
//! Resolves a uid into a payload for a target: local resource, memory cache,
//! then network or caller-supplied bytes. The latest request for a target
//! always wins; older ones are cancelled while queued, or have their binding
//! step turned into a no-op once they finish.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::entities::TargetKey;
use crate::domain::errors::{ResourceError, ResourceResult};
use crate::domain::ports::{Instructions, UiDispatcher};

use super::command::{Command, EndPhase, Engine, Resolution};
use super::memory_cache::{
    CacheStats, DEFAULT_CEILING_BYTES, DEFAULT_WATER_MARK_BYTES, MemoryCache,
};
use super::registry::PriorityRegistry;
use super::worker_pool::{
    DEFAULT_DOWNLOAD_WORKERS, DEFAULT_MAX_QUEUED, DEFAULT_PRE_WORKERS, Scheduler,
};

/// Configuration for the image engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Concurrent pre-resolution jobs.
    pub pre_workers: usize,
    /// Concurrent downloads.
    pub download_workers: usize,
    /// Queue bound of each pool.
    pub max_queued: usize,
    /// Memory cache ceiling in bytes.
    pub cache_ceiling_bytes: u64,
    /// Size the cache is brought back to when the ceiling is exceeded.
    pub cache_water_mark_bytes: u64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// User agent sent with every download.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            pre_workers: DEFAULT_PRE_WORKERS,
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            max_queued: DEFAULT_MAX_QUEUED,
            cache_ceiling_bytes: DEFAULT_CEILING_BYTES,
            cache_water_mark_bytes: DEFAULT_WATER_MARK_BYTES,
            timeout_secs: 30,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloaderConfig {
    /// Starts a scheduler sized after this configuration.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.pre_workers, self.download_workers, self.max_queued)
    }
}

/// Resolves resources for presentation targets.
///
/// Cheap to clone: clones share the same cache and bookkeeping.
pub struct ImageDownloader<I: Instructions> {
    engine: Arc<Engine<I>>,
}

impl<I: Instructions> Clone for ImageDownloader<I> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<I: Instructions> std::fmt::Debug for ImageDownloader<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDownloader")
            .field("cache", &self.engine.cache)
            .field("targets", &self.engine.registry.len())
            .field("queued", &self.engine.in_queue.len())
            .finish_non_exhaustive()
    }
}

impl<I: Instructions> ImageDownloader<I> {
    /// Creates an engine running on `scheduler` and binding through `dispatcher`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        config: &DownloaderConfig,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<dyn UiDispatcher>,
    ) -> ResourceResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ResourceError::Client {
                message: e.to_string(),
            })?;

        let engine = Engine {
            cache: MemoryCache::new(config.cache_ceiling_bytes, config.cache_water_mark_bytes),
            registry: PriorityRegistry::new(),
            scheduler,
            dispatcher,
            http_client,
            in_queue: DashSet::new(),
        };
        debug!(
            ceiling = config.cache_ceiling_bytes,
            water_mark = config.cache_water_mark_bytes,
            "Image downloader created"
        );

        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Creates an engine with default configuration and its own scheduler.
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_defaults(dispatcher: Arc<dyn UiDispatcher>) -> ResourceResult<Self> {
        let config = DownloaderConfig::default();
        Self::new(&config, Arc::new(config.scheduler()), dispatcher)
    }

    /// Resolves `uid` for `target` in the background. The binding step runs
    /// on the UI dispatcher. A `None` target only warms the cache.
    pub fn get(
        &self,
        target: Option<Arc<I::Target>>,
        uid: Option<String>,
        spec: I::Spec,
        instructions: Arc<I>,
    ) {
        let command = self.prepare(target, uid, spec, instructions);
        let engine = &self.engine;
        let id = command.id();

        if let Some(target) = command.target_key()
            && !engine.registry.track_pre(target, id)
        {
            return;
        }
        engine.in_queue.insert(id);

        let job = command.clone().run_pre(engine.clone());
        let submission = engine.scheduler.pre().submit(id, job);
        command.settle_submission(engine, submission);
    }

    /// Resolves `uid` for `target` on the calling task, binding inline.
    ///
    /// Meant for callers that already are off the UI thread and want the
    /// result before moving on, such as widgets rendered into a snapshot.
    pub async fn get_blocking(
        &self,
        target: Option<Arc<I::Target>>,
        uid: Option<String>,
        spec: I::Spec,
        instructions: Arc<I>,
    ) {
        let command = self.prepare(target, uid, spec, instructions);
        let engine = &*self.engine;

        match command.resolve(engine) {
            Resolution::NotInCache { key, placeholder } => {
                if placeholder {
                    command.end(engine, EndPhase::Placeholder { last: false });
                }
                let end = command.download_and_notify(engine, key).await;
                command.end(engine, end);
            }
            resolution => command.end(engine, resolution.into()),
        }
    }

    /// Allocates the command and makes it authoritative for its target,
    /// cancelling whatever it displaces.
    fn prepare(
        &self,
        target: Option<Arc<I::Target>>,
        uid: Option<String>,
        spec: I::Spec,
        instructions: Arc<I>,
    ) -> Arc<Command<I>> {
        let engine = &self.engine;
        let command = Command::new(engine.scheduler.next_id(), target, uid, spec, instructions);

        if let Some(target) = command.target_key() {
            let displaced = engine.registry.supersede(target, command.id());
            for id in [displaced.pre, displaced.download].into_iter().flatten() {
                engine.scheduler.cancel(id);
                engine.in_queue.remove(&id);
            }
        }

        Arc::new(command)
    }

    /// Tells the engine `target` no longer displays its cached entry, making
    /// the entry evictable again. Any command in flight for it becomes void.
    pub fn unbind(&self, target: &Arc<I::Target>) {
        let key = TargetKey::of(target);
        self.engine.cache.unbind(key);
        let displaced = self.engine.registry.forget(key);
        for id in [displaced.pre, displaced.download].into_iter().flatten() {
            self.engine.scheduler.cancel(id);
            self.engine.in_queue.remove(&id);
        }
    }

    /// Cancels every queued command, voids those in flight and empties the
    /// memory cache.
    pub fn empty(&self) {
        let queued: Vec<_> = self.engine.in_queue.iter().map(|id| *id).collect();
        for id in &queued {
            self.engine.scheduler.cancel(*id);
        }
        self.engine.in_queue.clear();
        self.engine.registry.clear();
        self.engine.cache.clear();
        debug!(cancelled = queued.len(), "Image downloader emptied");
    }

    /// The memory cache.
    #[must_use]
    pub fn cache(&self) -> &MemoryCache<I::Payload> {
        &self.engine.cache
    }

    /// Memory cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.engine.cache.stats()
    }

    /// Commands still queued on either pool.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.engine.in_queue.len()
    }
}
