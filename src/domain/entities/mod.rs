//! Domain entity definitions.

mod cache_key;
mod persistence_entry;
mod resolution;
mod slot;

pub use cache_key::{CacheKey, TargetKey, TargetRef, target_ref};
pub use persistence_entry::{PersistenceEntry, UriUsage, timestamp_from_millis};
pub use resolution::{CommandId, Outcome};
pub use slot::ResourceSlot;
