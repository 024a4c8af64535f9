//! Domain error types.

mod cacher_error;
mod persistence_error;
mod resource_error;

pub use cacher_error::CacherError;
pub use persistence_error::{PersistenceError, PersistenceResult, check_key};
pub use resource_error::{ResourceError, ResourceResult};
