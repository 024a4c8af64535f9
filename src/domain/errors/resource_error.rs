//! Errors raised while resolving a resource for a target.

use thiserror::Error;

/// Result type for resource resolution.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Resource resolution error variants.
///
/// None of these escape a command: they are logged and turned into a
/// "not bound" signal for the caller's instructions.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ResourceError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("out of memory while decoding {what}")]
    OutOfMemory { what: String },

    #[error("io error: {message}")]
    Io { message: String },

    #[error("resource unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("failed to create http client: {message}")]
    Client { message: String },
}

impl ResourceError {
    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates out-of-memory error.
    #[must_use]
    pub fn out_of_memory(what: impl Into<String>) -> Self {
        Self::OutOfMemory { what: what.into() }
    }

    /// Creates unavailable error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Returns true if the memory cache should be emptied before anything else.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ResourceError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}
