//! Application layer with the business-object cacher.

/// Application services.
pub mod services;

pub use services::{Cacher, MaxAgeInstructions};
