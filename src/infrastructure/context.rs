//! Application-scoped owner of the shared engine resources.
//!
//! One context holds the pool scheduler, the UI dispatcher and the opened
//! persistence slots. Everything is handed out by reference; nothing lives in
//! a static.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::services::Cacher;
use crate::domain::errors::{PersistenceError, ResourceError};
use crate::domain::ports::{BusinessSource, Instructions, Persistence, UiDispatcher};

use super::config::AppConfig;
use super::image::{ImageDownloader, Scheduler};
use super::persistence::open_backend;

/// Errors of the context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no persistence slot configured at index {index}")]
    UnknownSlot { index: usize },

    #[error("context was shut down")]
    ShutDown,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Shared engine resources with an explicit lifetime.
pub struct CacheContext {
    config: AppConfig,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<dyn UiDispatcher>,
    backends: Mutex<HashMap<usize, Arc<dyn Persistence>>>,
    shut_down: AtomicBool,
}

impl CacheContext {
    /// Starts the pools. Must be called within a Tokio runtime.
    #[must_use]
    pub fn init(config: AppConfig, dispatcher: Arc<dyn UiDispatcher>) -> Self {
        let scheduler = Arc::new(config.downloader.scheduler());
        info!(
            pre_workers = config.downloader.pre_workers,
            download_workers = config.downloader.download_workers,
            slots = config.persistence.len(),
            "Cache context initialized"
        );
        Self {
            config,
            scheduler,
            dispatcher,
            backends: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The configuration the context was started with.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The shared pool scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Creates an image engine on the shared pools.
    ///
    /// # Errors
    /// Returns error if the context is shut down or the HTTP client cannot
    /// be created.
    pub fn image_downloader<I: Instructions>(&self) -> Result<ImageDownloader<I>, ContextError> {
        self.ensure_running()?;
        Ok(ImageDownloader::new(
            &self.config.downloader,
            self.scheduler.clone(),
            self.dispatcher.clone(),
        )?)
    }

    /// Backend of slot `index`, opened on first use.
    ///
    /// # Errors
    /// Returns error if the slot does not exist or cannot be opened.
    pub async fn persistence(&self, index: usize) -> Result<Arc<dyn Persistence>, ContextError> {
        self.ensure_running()?;
        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(&index) {
            return Ok(backend.clone());
        }

        let slot = self
            .config
            .slot(index)
            .ok_or(ContextError::UnknownSlot { index })?;
        debug!(index, kind = slot.kind(), "Opening persistence slot");
        let backend = open_backend(&slot).await?;
        backends.insert(index, backend.clone());
        Ok(backend)
    }

    /// Creates a cacher for `source` over slot `index`.
    ///
    /// # Errors
    /// Returns error if the slot does not exist or cannot be opened.
    pub async fn cacher<S: BusinessSource>(
        &self,
        source: Arc<S>,
        index: usize,
    ) -> Result<Cacher<S>, ContextError> {
        Ok(Cacher::new(source, self.persistence(index).await?))
    }

    /// Stops the pools and closes every opened backend. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();

        let backends: Vec<_> = self.backends.lock().await.drain().collect();
        for (index, backend) in backends {
            if let Err(e) = backend.close().await {
                warn!(index, error = %e, "Failed to close persistence slot");
            }
        }
        info!("Cache context shut down");
    }

    fn ensure_running(&self) -> Result<(), ContextError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(ContextError::ShutDown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::dispatcher::ChannelDispatcher;
    use crate::infrastructure::image::BitmapInstructions;
    use crate::domain::entities::ResourceSlot;
    use bytes::Bytes;
    use chrono::Utc;
    use image::DynamicImage;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> CacheContext {
        let config = AppConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..AppConfig::default()
        };
        let (dispatcher, _ui) = ChannelDispatcher::new();
        CacheContext::init(config, Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_slots_open_once() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let first = ctx.persistence(0).await.unwrap();
        let second = ctx.persistence(0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "file");
        assert_eq!(ctx.persistence(1).await.unwrap().name(), "database");
        assert!(dir.path().join("objects").exists());
    }

    #[tokio::test]
    async fn test_unknown_slot() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert!(matches!(
            ctx.persistence(7).await,
            Err(ContextError::UnknownSlot { index: 7 })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_backends() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let backend = ctx.persistence(0).await.unwrap();
        backend
            .write_entry("k", Bytes::from_static(b"v"), Utc::now(), None, false)
            .await
            .unwrap();

        ctx.shutdown().await;
        ctx.shutdown().await;

        assert!(matches!(
            backend.read_entry("k").await,
            Err(PersistenceError::Closed { .. })
        ));
        assert!(matches!(ctx.persistence(0).await, Err(ContextError::ShutDown)));
        assert!(matches!(
            ctx.image_downloader::<BitmapInstructions<ResourceSlot<DynamicImage>>>(),
            Err(ContextError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_engines_share_the_scheduler() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let downloader = ctx
            .image_downloader::<BitmapInstructions<ResourceSlot<DynamicImage>>>()
            .unwrap();
        assert_eq!(downloader.pending(), 0);
        assert!(ctx.scheduler().next_id() < ctx.scheduler().next_id());
    }
}
