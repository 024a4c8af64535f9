//! Image engine.
//!
//! This module provides:
//! - Byte-budgeted memory caching that never evicts a displayed entry
//! - Two bounded worker pools running the newest request first
//! - Per-target supersession so only the latest request binds
//! - Ready-made bitmap decoding instructions

mod bitmap;
mod command;
mod downloader;
pub mod memory_cache;
pub mod registry;
pub mod worker_pool;

pub use bitmap::{BitmapInstructions, BitmapSpec};
pub use downloader::{DownloaderConfig, ImageDownloader};
pub use memory_cache::{CacheStats, CachedEntry, MemoryCache};
pub use registry::{Displaced, PriorityRegistry};
pub use worker_pool::{Scheduler, Submission, WorkerPool};
