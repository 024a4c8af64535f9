//! Infrastructure layer with the engine, backends and external adapters.

/// Application configuration.
pub mod config;
/// Application-scoped resource owner.
pub mod context;
/// UI dispatch over a channel.
pub mod dispatcher;
/// Image download-and-cache engine.
pub mod image;
/// Persistence backends.
pub mod persistence;
/// Remote business-object sources.
pub mod remote;

pub use config::{
    AppConfig, CliArgs, Command, ConfigError, ConfigFile, LogLevel, check_slots,
};
pub use context::{CacheContext, ContextError};
pub use dispatcher::{ChannelDispatcher, UiLoop};
pub use image::{BitmapInstructions, BitmapSpec, CacheStats, DownloaderConfig, ImageDownloader};
pub use persistence::{
    CleanupPolicy, DbPersistence, FilePersistence, PersistenceSlot, build_backend, open_backend,
};
pub use remote::{HttpJsonSource, RemoteError};
