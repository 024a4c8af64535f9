//! Persistence backend error types.

use std::io;

use thiserror::Error;

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Persistence error variants.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum PersistenceError {
    #[error("invalid persistence key: keys must not be empty")]
    InvalidKey,

    #[error("persistence backend {backend} is not initialized")]
    NotInitialized { backend: String },

    #[error("persistence backend {backend} is closed")]
    Closed { backend: String },

    #[error("persisted data is corrupted: {message}")]
    Corrupted { message: String },

    #[error("invalid table name: {name}")]
    InvalidTable { name: String },

    #[error("persistence task failed: {message}")]
    Task { message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PersistenceError {
    /// Creates corrupted-data error.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates not-initialized error.
    #[must_use]
    pub fn not_initialized(backend: impl Into<String>) -> Self {
        Self::NotInitialized {
            backend: backend.into(),
        }
    }

    /// Creates closed error.
    #[must_use]
    pub fn closed(backend: impl Into<String>) -> Self {
        Self::Closed {
            backend: backend.into(),
        }
    }

    /// Returns true if the owning layer may purge the storage and retry.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl From<tokio::task::JoinError> for PersistenceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task {
            message: err.to_string(),
        }
    }
}

/// Rejects keys that cannot identify an entry.
///
/// # Errors
/// Returns [`PersistenceError::InvalidKey`] for an empty or blank key.
pub fn check_key(key: &str) -> PersistenceResult<()> {
    if key.trim().is_empty() {
        Err(PersistenceError::InvalidKey)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("\n" ; "newline")]
    fn test_rejects_unusable_keys(key: &str) {
        assert!(matches!(check_key(key), Err(PersistenceError::InvalidKey)));
    }

    #[test]
    fn test_accepts_uri() {
        assert!(check_key("https://example.com/feed?page=2").is_ok());
    }
}
