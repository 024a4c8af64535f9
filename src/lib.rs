//! Viewcache - image download-and-cache engine and persisted business-object cache.
//!
//! The image engine resolves resources for presentation targets through two
//! bounded worker pools, a byte-bounded memory cache and a UI dispatcher; the
//! cacher layers a remote source over a file or `SQLite` persistence backend.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the business-object cacher.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the engine and its adapters.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "viewcache";
