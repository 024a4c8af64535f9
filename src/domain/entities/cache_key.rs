//! Identity types shared by the image engine and the persistence layer.

use std::any::Any;
use std::sync::Arc;

/// Key of a cacheable resource: a URL, a URI or any computed identifier.
///
/// Two different targets may resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a new `CacheKey` from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Creates a short, file-system safe key from a URL by hashing it.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identity of a presentation target.
///
/// Derived from the address of the shared allocation, so two clones of the
/// same `Arc` map to the same key. The core never looks inside a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey(usize);

impl TargetKey {
    /// Returns the identity of the given target.
    #[must_use]
    pub fn of<T: ?Sized>(target: &Arc<T>) -> Self {
        Self(Arc::as_ptr(target).cast::<()>() as usize)
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target@{:x}", self.0)
    }
}

/// Weak back-reference to a bound target, used only to test liveness.
pub type TargetRef = std::sync::Weak<dyn Any + Send + Sync>;

/// Returns a liveness handle for the given target.
#[must_use]
pub fn target_ref<T: Send + Sync + 'static>(target: &Arc<T>) -> TargetRef {
    let weak: std::sync::Weak<T> = Arc::downgrade(target);
    weak
}
