//! Records owned by the persistence backends.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

/// A persisted business-object payload.
///
/// Backends replace or insert a key atomically, so a reader never sees a
/// partially written entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceEntry {
    /// Key the entry is stored under.
    pub key: String,
    /// Raw payload bytes, as fetched from the remote source.
    pub payload: Bytes,
    /// When the payload was fetched.
    pub timestamp: DateTime<Utc>,
    /// Opaque caller context stored alongside the payload.
    pub context: Option<Bytes>,
}

impl PersistenceEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        payload: Bytes,
        timestamp: DateTime<Utc>,
        context: Option<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp,
            context,
        }
    }

    /// Returns the age of the entry relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Usage record of a key in the file backend, used for count-bounded eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriUsage {
    /// File name of the payload, relative to the storage directory.
    pub storage_file: String,
    /// The cache key.
    pub uri: String,
    /// Number of reads and writes since the last eviction pass.
    pub access_count: u64,
    /// Last time the key was read or written.
    pub last_used: DateTime<Utc>,
}

impl UriUsage {
    /// Creates a usage record for a freshly stored key.
    #[must_use]
    pub fn new(storage_file: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            storage_file: storage_file.into(),
            uri: uri.into(),
            access_count: 0,
            last_used: Utc::now(),
        }
    }

    /// Records an access.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_used = Utc::now();
    }
}

/// Converts a millisecond Unix timestamp, clamping out-of-range values to the epoch.
#[must_use]
pub fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_millis_round_trip() {
        let now = timestamp_from_millis(Utc::now().timestamp_millis());
        assert_eq!(timestamp_from_millis(now.timestamp_millis()), now);
    }

    #[test]
    fn test_usage_touch_counts() {
        let mut usage = UriUsage::new("3", "https://example.com/a");
        usage.touch();
        usage.touch();
        assert_eq!(usage.access_count, 2);
    }

    #[test]
    fn test_entry_age() {
        let written = timestamp_from_millis(1_000_000);
        let entry = PersistenceEntry::new("k", Bytes::from_static(b"v"), written, None);
        let later = timestamp_from_millis(1_030_000);
        assert_eq!(entry.age(later).num_seconds(), 30);
    }
}
