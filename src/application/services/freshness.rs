//! Age-based cache instructions.

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::domain::ports::{CacheInstructions, FetchOrigin, FetchStatus};

/// Accepts a persisted copy younger than a maximum age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAgeInstructions {
    max_age: Duration,
}

impl MaxAgeInstructions {
    /// Creates instructions accepting copies at most `max_age` old.
    #[must_use]
    pub const fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    /// Same as [`MaxAgeInstructions::new`] with a whole number of seconds.
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self::new(Duration::try_seconds(secs).unwrap_or(Duration::MAX))
    }

    /// The accepted age.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl CacheInstructions for MaxAgeInstructions {
    fn query_timestamp(&self) -> bool {
        true
    }

    fn take_from_cache(&self, last_update: Option<DateTime<Utc>>) -> bool {
        last_update.is_some_and(|at| Utc::now() - at <= self.max_age)
    }

    fn on_fetching(&self, origin: FetchOrigin, status: FetchStatus) {
        trace!(?origin, ?status, "Fetching");
    }
}
