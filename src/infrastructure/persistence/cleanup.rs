//! Clean-up policies of the blob-table backend.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Row ids deleted per statement.
pub const DELETE_BATCH: usize = 50;

/// Which rows a clean-up pass removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Keep everything.
    #[default]
    None,
    /// Remove rows last updated more than `retention_secs` ago.
    OlderThan {
        /// Retention window in seconds.
        retention_secs: u64,
    },
}

impl CleanupPolicy {
    /// Rows updated before the returned instant are due for removal.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::None => None,
            Self::OlderThan { retention_secs } => {
                let retention = i64::try_from(*retention_secs).unwrap_or(i64::MAX);
                Some(
                    Duration::try_seconds(retention)
                        .and_then(|window| now.checked_sub_signed(window))
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_expires() {
        assert_eq!(CleanupPolicy::None.cutoff(Utc::now()), None);
    }

    #[test]
    fn test_older_than_cutoff() {
        let now = Utc::now();
        let policy = CleanupPolicy::OlderThan { retention_secs: 60 };
        assert_eq!(policy.cutoff(now), Some(now - Duration::seconds(60)));
    }

    #[test]
    fn test_huge_retention_saturates() {
        let policy = CleanupPolicy::OlderThan {
            retention_secs: u64::MAX,
        };
        assert_eq!(policy.cutoff(Utc::now()), Some(DateTime::<Utc>::MIN_UTC));
    }

    #[test]
    fn test_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            cleanup: CleanupPolicy,
        }
        let parsed: Wrapper =
            toml::from_str("[cleanup]\npolicy = \"older_than\"\nretention_secs = 86400\n").unwrap();
        assert_eq!(
            parsed.cleanup,
            CleanupPolicy::OlderThan {
                retention_secs: 86_400
            }
        );
    }
}
