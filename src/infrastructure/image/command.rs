//! A single resolution request and its phases.
//!
//! A command first runs on the pre-resolution pool (null uid, local resource,
//! memory cache), then if needed on the download pool, and always ends with a
//! binding step posted to the UI dispatcher. The binding step only touches the
//! target while the command is still authoritative for it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use futures_util::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::domain::entities::{CacheKey, CommandId, Outcome, TargetKey, target_ref};
use crate::domain::errors::{ResourceError, ResourceResult};
use crate::domain::ports::{BindTarget, Instructions, StreamSupply, UiDispatcher};

use super::memory_cache::MemoryCache;
use super::registry::PriorityRegistry;
use super::worker_pool::{Scheduler, Submission};

/// Everything a command needs from the engine that issued it.
pub(crate) struct Engine<I: Instructions> {
    pub(crate) cache: MemoryCache<I::Payload>,
    pub(crate) registry: PriorityRegistry,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) dispatcher: Arc<dyn UiDispatcher>,
    pub(crate) http_client: reqwest::Client,
    /// Commands this engine still has queued on either pool.
    pub(crate) in_queue: DashSet<CommandId>,
}

/// Result of the pre-resolution phase.
pub(crate) enum Resolution<P> {
    Local,
    InCache { key: CacheKey, payload: Arc<P> },
    NullNoPlaceholder,
    NullPlaceholder,
    NotInCache { key: Option<CacheKey>, placeholder: bool },
}

/// Work handed to the UI thread.
pub(crate) enum EndPhase<P> {
    Local,
    Placeholder { last: bool },
    Clear,
    Bind {
        downloaded: bool,
        key: Option<CacheKey>,
        payload: Arc<P>,
    },
    Failed,
}

impl<P> EndPhase<P> {
    const fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Local => Some(Outcome::Local),
            Self::Placeholder { last: true } => Some(Outcome::NullPlaceholder),
            Self::Placeholder { last: false } => Some(Outcome::NotInCache),
            Self::Clear => Some(Outcome::NullNoPlaceholder),
            Self::Bind {
                downloaded: true, ..
            } => Some(Outcome::Downloaded),
            Self::Bind { .. } => Some(Outcome::InCache),
            Self::Failed => None,
        }
    }

    /// Whether this step closes the command's lifecycle. A failure always
    /// does.
    fn is_last(&self) -> bool {
        self.outcome().is_none_or(Outcome::is_final)
    }
}

impl<P> From<Resolution<P>> for EndPhase<P> {
    fn from(resolution: Resolution<P>) -> Self {
        match resolution {
            Resolution::Local => Self::Local,
            Resolution::InCache { key, payload } => Self::Bind {
                downloaded: false,
                key: Some(key),
                payload,
            },
            Resolution::NullNoPlaceholder => Self::Clear,
            Resolution::NullPlaceholder => Self::Placeholder { last: true },
            Resolution::NotInCache { .. } => Self::Placeholder { last: false },
        }
    }
}

/// A request to resolve `uid` for `target`. A command without a target is a
/// prefetch: it warms the cache and binds nothing.
pub(crate) struct Command<I: Instructions> {
    id: CommandId,
    target: Option<Arc<I::Target>>,
    target_key: Option<TargetKey>,
    uid: Option<String>,
    spec: Arc<I::Spec>,
    instructions: Arc<I>,
}

impl<I: Instructions> Command<I> {
    pub(crate) fn new(
        id: CommandId,
        target: Option<Arc<I::Target>>,
        uid: Option<String>,
        spec: I::Spec,
        instructions: Arc<I>,
    ) -> Self {
        let target_key = target.as_ref().map(TargetKey::of);
        Self {
            id,
            target,
            target_key,
            uid,
            spec: Arc::new(spec),
            instructions,
        }
    }

    pub(crate) const fn id(&self) -> CommandId {
        self.id
    }

    pub(crate) const fn target_key(&self) -> Option<TargetKey> {
        self.target_key
    }

    fn is_stale(&self, engine: &Engine<I>) -> bool {
        self.target_key
            .is_some_and(|target| !engine.registry.is_authoritative(target, self.id))
    }

    /// Pre-resolution pool entry point.
    pub(crate) async fn run_pre(self: Arc<Self>, engine: Arc<Engine<I>>) {
        if let Some(target) = self.target_key {
            engine.registry.release_pre(target, self.id);
        }
        engine.in_queue.remove(&self.id);

        if self.is_stale(&engine) {
            trace!(id = %self.id, "Superseded before pre-resolution, skipping");
            return;
        }

        let phase = std::panic::catch_unwind(AssertUnwindSafe(|| self.pre_phase(&engine)));
        if phase.is_err() {
            error!(id = %self.id, "Instructions panicked during pre-resolution");
            self.post(&engine, EndPhase::Failed);
        }
    }

    fn pre_phase(self: &Arc<Self>, engine: &Arc<Engine<I>>) {
        match self.resolve(engine) {
            Resolution::NotInCache { key, placeholder } => {
                if placeholder {
                    self.post(engine, EndPhase::Placeholder { last: false });
                }
                self.queue_download(engine, key);
            }
            resolution => self.post(engine, resolution.into()),
        }
    }

    fn queue_download(self: &Arc<Self>, engine: &Arc<Engine<I>>, key: Option<CacheKey>) {
        if let Some(target) = self.target_key
            && !engine.registry.track_download(target, self.id)
        {
            trace!(id = %self.id, "Superseded before download, skipping");
            return;
        }
        engine.in_queue.insert(self.id);

        let command = self.clone();
        let job_engine = engine.clone();
        let submission = engine
            .scheduler
            .download()
            .submit(self.id, command.run_download(job_engine, key));
        self.settle_submission(engine, submission);
    }

    /// Releases the bookkeeping of a command its pool did not queue, and
    /// reports the target as not bound.
    pub(crate) fn settle_submission(
        self: &Arc<Self>,
        engine: &Arc<Engine<I>>,
        submission: Submission,
    ) {
        if submission.is_queued() {
            return;
        }
        warn!(id = %self.id, submission = ?submission, "Command not queued, dropping it");
        engine.in_queue.remove(&self.id);
        if let Some(target) = self.target_key {
            engine.registry.release_pre(target, self.id);
            engine.registry.release_download(target, self.id);
            self.post(engine, EndPhase::Failed);
        }
    }

    /// Download pool entry point.
    pub(crate) async fn run_download(self: Arc<Self>, engine: Arc<Engine<I>>, key: Option<CacheKey>) {
        if let Some(target) = self.target_key {
            engine.registry.release_download(target, self.id);
        }
        engine.in_queue.remove(&self.id);

        if self.is_stale(&engine) {
            trace!(id = %self.id, "Superseded before download, skipping");
            return;
        }

        let phase = AssertUnwindSafe(self.download_and_notify(&engine, key)).catch_unwind();
        let end = phase.await.unwrap_or_else(|_| {
            error!(id = %self.id, "Instructions panicked during download");
            EndPhase::Failed
        });
        self.post(&engine, end);
    }

    pub(crate) async fn download_and_notify(
        &self,
        engine: &Engine<I>,
        key: Option<CacheKey>,
    ) -> EndPhase<I::Payload> {
        let result = self.download(engine, key.as_ref()).await;
        let spec = &*self.spec;
        let uid = self.uid.as_deref();
        let target = self.target.as_deref();

        match result {
            Ok((payload, downloaded)) => {
                self.instructions
                    .on_resource_ready(true, target, Some(&*payload), uid, spec);
                EndPhase::Bind {
                    downloaded,
                    key,
                    payload,
                }
            }
            Err(e) => {
                warn!(id = %self.id, uid = ?uid, error = %e, "Resource unavailable");
                self.instructions
                    .on_resource_ready(false, target, None, uid, spec);
                EndPhase::Failed
            }
        }
    }

    /// Runs the pre-resolution steps in order. Worker thread.
    pub(crate) fn resolve(&self, engine: &Engine<I>) -> Resolution<I::Payload> {
        let spec = &*self.spec;
        let Some(uid) = self.uid.as_deref() else {
            return if self.instructions.has_placeholder(None, spec) {
                Resolution::NullPlaceholder
            } else {
                Resolution::NullNoPlaceholder
            };
        };

        if self.instructions.has_local_resource(Some(uid), spec) {
            return Resolution::Local;
        }

        let key = self.instructions.compute_key(uid, spec);
        if let Some(key) = key.as_ref()
            && let Some(entry) = engine.cache.get(key)
        {
            trace!(id = %self.id, key = %key, "Memory cache hit");
            return Resolution::InCache {
                key: key.clone(),
                payload: entry.payload().clone(),
            };
        }

        Resolution::NotInCache {
            key,
            placeholder: self.instructions.has_placeholder(Some(uid), spec),
        }
    }

    /// Obtains, decodes and caches the payload. Returns it with a flag telling
    /// whether it was actually fetched rather than found in the cache.
    pub(crate) async fn download(
        &self,
        engine: &Engine<I>,
        key: Option<&CacheKey>,
    ) -> ResourceResult<(Arc<I::Payload>, bool)> {
        let Some(uid) = self.uid.as_deref() else {
            return Err(ResourceError::unavailable("no uid to download"));
        };

        // Another command may have fetched it while this one was queued.
        if let Some(key) = key
            && let Some(entry) = engine.cache.get(key)
        {
            return Ok((entry.payload().clone(), false));
        }

        let bytes = self.fetch_bytes(engine, uid).await?;
        debug!(id = %self.id, uid, size = bytes.len(), "Resource bytes obtained");

        let instructions = self.instructions.clone();
        let spec = self.spec.clone();
        let owned_uid = uid.to_string();
        let decoded =
            tokio::task::spawn_blocking(move || instructions.decode(&bytes, &owned_uid, &spec))
                .await
                .map_err(|e| ResourceError::decode(format!("Decode task panicked: {e}")))?;

        let payload = match decoded {
            Ok(payload) => Arc::new(payload),
            Err(e) if e.is_out_of_memory() => {
                let evicted = engine.cache.emergency_cleanup();
                warn!(id = %self.id, evicted, "Out of memory while decoding, memory cache emptied");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match key {
            Some(key) => Ok((engine.cache.put(key.clone(), payload).payload().clone(), true)),
            None => Ok((payload, true)),
        }
    }

    async fn fetch_bytes(&self, engine: &Engine<I>, uid: &str) -> ResourceResult<Bytes> {
        let spec = &*self.spec;
        let url = self.instructions.compute_url(uid, spec);

        match self.instructions.supply_stream(uid, spec, &url) {
            StreamSupply::Ready(bytes) => Ok(bytes),
            StreamSupply::Deferred(rx) => match rx.await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Err(ResourceError::unavailable("supplier reported no stream")),
                Err(_) => Err(ResourceError::unavailable("supplier dropped the stream")),
            },
            StreamSupply::Network => {
                trace!(id = %self.id, url = %url, "Downloading resource");
                let request = self
                    .instructions
                    .before_download(uid, spec, engine.http_client.get(&url));
                let response = request.send().await?;

                if !response.status().is_success() {
                    return Err(ResourceError::network(format!(
                        "HTTP {}: {}",
                        response.status(),
                        response.status().canonical_reason().unwrap_or("Unknown")
                    )));
                }

                Ok(response.bytes().await?)
            }
        }
    }

    /// Posts an end phase to the UI thread. Prefetches have nothing to bind.
    pub(crate) fn post(self: &Arc<Self>, engine: &Arc<Engine<I>>, end: EndPhase<I::Payload>) {
        if self.target.is_none() {
            return;
        }
        let dispatcher = engine.dispatcher.clone();
        let command = self.clone();
        let engine = engine.clone();
        dispatcher.post(Box::new(move || command.end(&engine, end)));
    }

    /// Runs an end phase. UI thread only.
    pub(crate) fn end(&self, engine: &Engine<I>, end: EndPhase<I::Payload>) {
        let (Some(target), Some(target_key)) = (self.target.as_ref(), self.target_key) else {
            return;
        };
        if !engine.registry.is_authoritative(target_key, self.id) {
            trace!(id = %self.id, "Superseded, end phase skipped");
            return;
        }

        let last = end.is_last();
        let bound = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.bind(engine, target, target_key, end);
        }));
        if bound.is_err() {
            error!(id = %self.id, "Instructions panicked while binding");
        }

        if last {
            engine.registry.complete(target_key, self.id);
        }
    }

    fn bind(
        &self,
        engine: &Engine<I>,
        target: &Arc<I::Target>,
        target_key: TargetKey,
        end: EndPhase<I::Payload>,
    ) {
        let instructions = &*self.instructions;
        let spec = &*self.spec;
        let uid = self.uid.as_deref();
        if let Some(outcome) = end.outcome() {
            trace!(id = %self.id, outcome = %outcome, "Binding");
        }

        match end {
            EndPhase::Local => {
                engine.cache.unbind(target_key);
                instructions.bind_local(target, uid, spec);
                instructions.on_resource_bound(true, target, uid, spec);
            }
            EndPhase::Placeholder { last } => {
                engine.cache.unbind(target_key);
                instructions.bind_placeholder(target, uid, spec);
                if last {
                    instructions.on_resource_bound(false, target, uid, spec);
                }
            }
            EndPhase::Clear => {
                engine.cache.unbind(target_key);
                target.set_resource(None);
                instructions.on_resource_bound(false, target, uid, spec);
            }
            EndPhase::Bind {
                downloaded,
                key,
                payload,
            } => {
                if !instructions.bind_resource(downloaded, target, &payload, uid, spec) {
                    target.set_resource(Some(payload));
                }
                match key {
                    Some(key) => engine.cache.bind(target_key, target_ref(target), &key),
                    None => engine.cache.unbind(target_key),
                }
                instructions.on_resource_bound(true, target, uid, spec);
            }
            EndPhase::Failed => {
                instructions.on_resource_bound(false, target, uid, spec);
            }
        }
    }
}
