//! Per-target command bookkeeping: which command is authoritative for a
//! target, and which commands are still queued on each pool.

use dashmap::DashMap;
use tracing::trace;

use crate::domain::entities::{CommandId, TargetKey};

/// Queued commands displaced by a newer request for the same target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Displaced {
    /// Command still waiting on the pre-resolution pool.
    pub pre: Option<CommandId>,
    /// Command still waiting on the download pool.
    pub download: Option<CommandId>,
}

/// Registry implementing "the latest command for a target wins".
#[derive(Debug, Default)]
pub struct PriorityRegistry {
    authoritative: DashMap<TargetKey, CommandId>,
    pending_pre: DashMap<TargetKey, CommandId>,
    pending_download: DashMap<TargetKey, CommandId>,
}

impl PriorityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `id` authoritative for `target` and hands back the queued
    /// commands it displaces, for cancellation.
    pub fn supersede(&self, target: TargetKey, id: CommandId) -> Displaced {
        if let Some(previous) = self.authoritative.insert(target, id) {
            trace!(target = %target, previous = %previous, id = %id, "Command superseded");
        }
        Displaced {
            pre: self.pending_pre.remove(&target).map(|(_, id)| id),
            download: self.pending_download.remove(&target).map(|(_, id)| id),
        }
    }

    /// Returns true if `id` may still mutate `target`.
    #[must_use]
    pub fn is_authoritative(&self, target: TargetKey, id: CommandId) -> bool {
        self.authoritative
            .get(&target)
            .is_some_and(|current| *current == id)
    }

    /// Records `id` as queued on the pre-resolution pool, unless a newer
    /// command already took over the target.
    pub fn track_pre(&self, target: TargetKey, id: CommandId) -> bool {
        if !self.is_authoritative(target, id) {
            return false;
        }
        self.pending_pre.insert(target, id);
        true
    }

    /// Forgets the queued pre-resolution command, if it is still `id`.
    pub fn release_pre(&self, target: TargetKey, id: CommandId) {
        self.pending_pre.remove_if(&target, |_, queued| *queued == id);
    }

    /// Records `id` as queued on the download pool, unless a newer command
    /// already took over the target.
    pub fn track_download(&self, target: TargetKey, id: CommandId) -> bool {
        if !self.is_authoritative(target, id) {
            return false;
        }
        self.pending_download.insert(target, id);
        true
    }

    /// Forgets the queued download command, if it is still `id`.
    pub fn release_download(&self, target: TargetKey, id: CommandId) {
        self.pending_download.remove_if(&target, |_, queued| *queued == id);
    }

    /// Ends the lifecycle of `id` for `target`.
    pub fn complete(&self, target: TargetKey, id: CommandId) {
        self.authoritative.remove_if(&target, |_, current| *current == id);
        self.release_pre(target, id);
        self.release_download(target, id);
    }

    /// Drops every record for `target`. Commands in flight for it become
    /// void; the queued ones are handed back for cancellation.
    pub fn forget(&self, target: TargetKey) -> Displaced {
        self.authoritative.remove(&target);
        Displaced {
            pre: self.pending_pre.remove(&target).map(|(_, id)| id),
            download: self.pending_download.remove(&target).map(|(_, id)| id),
        }
    }

    /// Every command still queued, on either pool.
    #[must_use]
    pub fn queued(&self) -> Vec<CommandId> {
        self.pending_pre
            .iter()
            .chain(self.pending_download.iter())
            .map(|e| *e.value())
            .collect()
    }

    /// Number of targets with an authoritative command.
    #[must_use]
    pub fn len(&self) -> usize {
        self.authoritative.len()
    }

    /// Returns true if no target has an authoritative command.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authoritative.is_empty()
    }

    /// Forgets everything: every in-flight end phase becomes a no-op.
    pub fn clear(&self) {
        self.authoritative.clear();
        self.pending_pre.clear();
        self.pending_download.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn target() -> (Arc<()>, TargetKey) {
        let view = Arc::new(());
        let key = TargetKey::of(&view);
        (view, key)
    }

    #[test]
    fn test_latest_command_is_authoritative() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();

        registry.supersede(t, CommandId::new(1));
        assert!(registry.is_authoritative(t, CommandId::new(1)));

        registry.supersede(t, CommandId::new(2));
        assert!(!registry.is_authoritative(t, CommandId::new(1)));
        assert!(registry.is_authoritative(t, CommandId::new(2)));
    }

    #[test]
    fn test_supersede_hands_back_queued_commands() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();

        registry.supersede(t, CommandId::new(1));
        assert!(registry.track_pre(t, CommandId::new(1)));
        let displaced = registry.supersede(t, CommandId::new(2));

        assert_eq!(displaced.pre, Some(CommandId::new(1)));
        assert_eq!(displaced.download, None);
        assert!(registry.queued().is_empty());
    }

    #[test]
    fn test_stale_command_cannot_track_download() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();

        registry.supersede(t, CommandId::new(1));
        registry.supersede(t, CommandId::new(2));

        assert!(!registry.track_download(t, CommandId::new(1)));
        assert!(registry.track_download(t, CommandId::new(2)));
        assert_eq!(registry.queued(), vec![CommandId::new(2)]);
    }

    #[test]
    fn test_complete_only_removes_own_entry() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();

        registry.supersede(t, CommandId::new(1));
        registry.supersede(t, CommandId::new(2));
        registry.complete(t, CommandId::new(1));
        assert!(registry.is_authoritative(t, CommandId::new(2)));

        registry.complete(t, CommandId::new(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_forget_voids_target() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();
        registry.supersede(t, CommandId::new(1));
        registry.track_download(t, CommandId::new(1));

        let displaced = registry.forget(t);
        assert_eq!(displaced.download, Some(CommandId::new(1)));
        assert!(!registry.is_authoritative(t, CommandId::new(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_voids_everything() {
        let (_view, t) = target();
        let registry = PriorityRegistry::new();
        registry.supersede(t, CommandId::new(1));
        registry.clear();
        assert!(!registry.is_authoritative(t, CommandId::new(1)));
    }
}
