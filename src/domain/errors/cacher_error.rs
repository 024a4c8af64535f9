//! Errors surfaced by the business-object cacher.

use thiserror::Error;

use super::PersistenceError;

/// Cacher error, generic over the source's own fetch and parse error types so
/// callers can match on them without downcasting.
#[derive(Debug, Error)]
pub enum CacherError<F, P>
where
    F: std::error::Error + 'static,
    P: std::error::Error + 'static,
{
    /// The remote source failed.
    #[error("remote fetch failed: {0}")]
    Fetch(#[source] F),

    /// The remote payload could not be parsed (nothing was persisted).
    #[error("parsing failed: {0}")]
    Parse(#[source] P),

    /// The persistence layer failed.
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

impl<F, P> CacherError<F, P>
where
    F: std::error::Error + 'static,
    P: std::error::Error + 'static,
{
    /// Returns the fetch error, if that is what failed.
    #[must_use]
    pub const fn as_fetch(&self) -> Option<&F> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the parse error, if that is what failed.
    #[must_use]
    pub const fn as_parse(&self) -> Option<&P> {
        match self {
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}
