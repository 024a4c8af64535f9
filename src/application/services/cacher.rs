//! Business-object cacher.
//!
//! Combines a remote [`BusinessSource`] with a [`Persistence`] backend. Each
//! request walks a small state machine whose decisions are delegated to the
//! caller's [`CacheInstructions`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::domain::errors::{CacherError, PersistenceError};
use crate::domain::ports::{BusinessSource, CacheInstructions, FetchOrigin, FetchStatus, Persistence};

/// Result of a cacher request for source `S`.
pub type CacherResult<T, S> =
    Result<T, CacherError<<S as BusinessSource>::FetchError, <S as BusinessSource>::ParseError>>;

#[derive(Debug)]
enum Step {
    CheckCache,
    QueryTimestamp,
    ValidateFreshness(Option<DateTime<Utc>>),
    ReturnCached,
    FetchRemote,
    ParseAndPersist(Bytes, DateTime<Utc>),
}

/// Caches the business objects of one source in one backend.
pub struct Cacher<S: BusinessSource> {
    source: Arc<S>,
    persistence: Arc<dyn Persistence>,
}

impl<S: BusinessSource> Cacher<S> {
    /// Creates a cacher over an initialized backend.
    #[must_use]
    pub fn new(source: Arc<S>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            source,
            persistence,
        }
    }

    /// The backend.
    #[must_use]
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Returns the value of `parameter`, from persistence when the
    /// instructions accept the persisted copy, from the remote source
    /// otherwise.
    ///
    /// Unreadable persisted data counts as a miss. A freshly fetched payload
    /// is persisted only once it parsed, and a failed write still returns
    /// the value.
    ///
    /// # Errors
    /// Returns the source's fetch or parse error, or a persistence error
    /// other than corruption.
    pub async fn get_value_with(
        &self,
        instructions: &dyn CacheInstructions,
        parameter: &S::Parameter,
    ) -> CacherResult<S::Value, S> {
        let uri = self.source.compute_uri(parameter);
        let mut step = Step::CheckCache;

        loop {
            trace!(uri = %uri, step = ?step, "Cacher step");
            step = match step {
                Step::CheckCache => {
                    if instructions.query_timestamp() {
                        Step::QueryTimestamp
                    } else {
                        Step::ValidateFreshness(None)
                    }
                }
                Step::QueryTimestamp => match self.persistence.last_update(&uri).await {
                    Ok(last_update) => Step::ValidateFreshness(last_update),
                    Err(e) if e.is_corruption() => {
                        warn!(uri = %uri, error = %e, "Persisted timestamp unreadable");
                        Step::ValidateFreshness(None)
                    }
                    Err(e) => return Err(e.into()),
                },
                Step::ValidateFreshness(last_update) => {
                    if instructions.take_from_cache(last_update) {
                        Step::ReturnCached
                    } else {
                        Step::FetchRemote
                    }
                }
                Step::ReturnCached => {
                    instructions.on_fetching(FetchOrigin::Persistence, FetchStatus::Attempt);
                    if let Some(value) = self.read_persisted(parameter, &uri).await? {
                        instructions.on_fetching(FetchOrigin::Persistence, FetchStatus::Success);
                        debug!(uri = %uri, "Served from persistence");
                        return Ok(value);
                    }
                    Step::FetchRemote
                }
                Step::FetchRemote => {
                    instructions.on_fetching(FetchOrigin::Remote, FetchStatus::Attempt);
                    let bytes = self
                        .source
                        .fetch(parameter)
                        .await
                        .map_err(CacherError::Fetch)?;
                    instructions.on_fetching(FetchOrigin::Remote, FetchStatus::Success);
                    Step::ParseAndPersist(bytes, Utc::now())
                }
                Step::ParseAndPersist(bytes, fetched_at) => {
                    let value = self
                        .source
                        .parse(parameter, &bytes)
                        .map_err(CacherError::Parse)?;
                    self.persist(parameter, &uri, bytes, fetched_at).await;
                    return Ok(value);
                }
            };
        }
    }

    /// Returns the value of `parameter`, trying the remote source first and
    /// falling back to whatever is persisted. Never fails.
    pub async fn get_value(&self, parameter: &S::Parameter) -> Option<S::Value> {
        let uri = self.source.compute_uri(parameter);

        match self.fetch_and_persist(parameter, &uri).await {
            Ok(value) => return Some(value),
            Err(e) => warn!(uri = %uri, error = %e, "Remote fetch failed, falling back to persistence"),
        }

        match self.read_persisted(parameter, &uri).await {
            Ok(value) => value,
            Err(e) => {
                warn!(uri = %uri, error = %e, "Persistence fallback failed");
                None
            }
        }
    }

    /// Persists `value` as the current copy of `parameter`.
    ///
    /// # Errors
    /// Returns the serialization error or the persistence error.
    pub async fn set_value(&self, parameter: &S::Parameter, value: &S::Value) -> CacherResult<(), S> {
        let uri = self.source.compute_uri(parameter);
        let bytes = self.source.serialize(value).map_err(CacherError::Parse)?;
        self.persistence
            .write_entry(
                &uri,
                bytes,
                Utc::now(),
                self.source.persistence_context(parameter),
                false,
            )
            .await?;
        Ok(())
    }

    /// Forgets the persisted copy of `parameter`.
    ///
    /// # Errors
    /// Returns the persistence error.
    pub async fn remove(&self, parameter: &S::Parameter) -> CacherResult<(), S> {
        let uri = self.source.compute_uri(parameter);
        self.persistence.remove_entry(&uri).await?;
        Ok(())
    }

    async fn fetch_and_persist(&self, parameter: &S::Parameter, uri: &str) -> CacherResult<S::Value, S> {
        let bytes = self
            .source
            .fetch(parameter)
            .await
            .map_err(CacherError::Fetch)?;
        let value = self
            .source
            .parse(parameter, &bytes)
            .map_err(CacherError::Parse)?;
        self.persist(parameter, uri, bytes, Utc::now()).await;
        Ok(value)
    }

    /// Stores a freshly fetched payload. Failures are logged, not returned.
    async fn persist(
        &self,
        parameter: &S::Parameter,
        uri: &str,
        bytes: Bytes,
        fetched_at: DateTime<Utc>,
    ) {
        let context = self.source.persistence_context(parameter);
        match self
            .persistence
            .write_entry(uri, bytes, fetched_at, context, false)
            .await
        {
            Ok(_) => debug!(uri = %uri, "Fetched and persisted"),
            Err(e) => warn!(uri = %uri, error = %e, "Failed to persist fetched value"),
        }
    }

    /// Reads and parses the persisted copy. Corrupted or unparsable data is
    /// a miss.
    async fn read_persisted(
        &self,
        parameter: &S::Parameter,
        uri: &str,
    ) -> Result<Option<S::Value>, PersistenceError> {
        let entry = match self.persistence.read_entry(uri).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(e) if e.is_corruption() => {
                warn!(uri = %uri, error = %e, "Persisted entry unreadable, treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.source.parse(parameter, &entry.payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(uri = %uri, error = %e, "Persisted payload does not parse, treating as miss");
                Ok(None)
            }
        }
    }
}
