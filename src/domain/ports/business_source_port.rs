//! Ports for the business-object cacher: the remote source and the
//! per-request cache instructions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Remote origin of business objects.
///
/// The error types travel untouched to the caller through
/// [`CacherError`](crate::domain::errors::CacherError).
#[async_trait]
pub trait BusinessSource: Send + Sync {
    /// What identifies a business object (an id, a query...).
    type Parameter: Send + Sync;
    /// The parsed business object.
    type Value: Send;
    /// Error raised by the remote fetch.
    type FetchError: std::error::Error + Send + Sync + 'static;
    /// Error raised while parsing or serializing.
    type ParseError: std::error::Error + Send + Sync + 'static;

    /// Persistence key of the object.
    fn compute_uri(&self, parameter: &Self::Parameter) -> String;

    /// Fetches the raw bytes of the object.
    async fn fetch(&self, parameter: &Self::Parameter) -> Result<Bytes, Self::FetchError>;

    /// Parses raw bytes, either fresh from `fetch` or read back from persistence.
    fn parse(&self, parameter: &Self::Parameter, bytes: &[u8])
    -> Result<Self::Value, Self::ParseError>;

    /// Serializes a value for `set_value`.
    fn serialize(&self, value: &Self::Value) -> Result<Bytes, Self::ParseError>;

    /// Opaque context persisted alongside the payload.
    fn persistence_context(&self, _parameter: &Self::Parameter) -> Option<Bytes> {
        None
    }
}

/// Which layer the cacher is about to hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// The persistence backend.
    Persistence,
    /// The remote source.
    Remote,
}

/// Progress of a layer access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// About to hit the layer.
    Attempt,
    /// The layer delivered.
    Success,
}

/// Per-request policy of the cacher.
pub trait CacheInstructions: Send + Sync {
    /// Whether the persisted timestamp should be looked up at all.
    fn query_timestamp(&self) -> bool;

    /// Whether the persisted copy is acceptable, given its timestamp (or its
    /// absence when not queried or not found).
    fn take_from_cache(&self, last_update: Option<DateTime<Utc>>) -> bool;

    /// Notified on every transition between the persistence and remote layers.
    fn on_fetching(&self, _origin: FetchOrigin, _status: FetchStatus) {}
}
