//! Command identity and the outcome of a resolution attempt.

/// Sequence id of a command. Used both as identity and as priority:
/// a higher id was requested later and runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the start phase of a command decided.
///
/// Each variant drives a distinct end-phase action on the UI thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The resource is served locally, no network involved.
    Local,
    /// The resource was already in the memory cache.
    InCache,
    /// No identifier and no placeholder: the target is cleared.
    NullNoPlaceholder,
    /// No identifier, the placeholder is bound.
    NullPlaceholder,
    /// Not cached: the placeholder is bound while the download runs.
    NotInCache,
    /// The resource was fetched and decoded by the download pool.
    Downloaded,
}

impl Outcome {
    /// Returns true if this outcome ends the command's lifecycle.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::NotInCache)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::InCache => write!(f, "in-cache"),
            Self::NullNoPlaceholder => write!(f, "null"),
            Self::NullPlaceholder => write!(f, "null-placeholder"),
            Self::NotInCache => write!(f, "not-in-cache"),
            Self::Downloaded => write!(f, "downloaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_orders_by_sequence() {
        assert!(CommandId::new(2) > CommandId::new(1));
        assert_eq!(CommandId::new(7).get(), 7);
    }

    #[test]
    fn test_only_not_in_cache_continues() {
        assert!(!Outcome::NotInCache.is_final());
        assert!(Outcome::Downloaded.is_final());
        assert!(Outcome::NullPlaceholder.is_final());
    }
}
