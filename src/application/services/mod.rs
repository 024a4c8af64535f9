pub mod cacher;
pub mod freshness;

pub use cacher::{Cacher, CacherResult};
pub use freshness::MaxAgeInstructions;
