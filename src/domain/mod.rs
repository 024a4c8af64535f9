//! Domain layer with core entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CommandId, Outcome, PersistenceEntry, TargetKey};
pub use errors::{CacherError, PersistenceError, ResourceError};
pub use ports::{BindTarget, BusinessSource, CacheInstructions, Instructions, Persistence};
