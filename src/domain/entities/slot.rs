//! A minimal presentation target holding whatever resource was last bound.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::ports::BindTarget;

/// Target that stores the bound resource. Useful for headless callers and tests.
pub struct ResourceSlot<P> {
    resource: Mutex<Option<Arc<P>>>,
    binds: Mutex<u64>,
}

impl<P> ResourceSlot<P> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resource: Mutex::new(None),
            binds: Mutex::new(0),
        }
    }

    /// Returns the currently bound resource.
    #[must_use]
    pub fn resource(&self) -> Option<Arc<P>> {
        self.resource.lock().clone()
    }

    /// Returns how many times the slot was (re)bound.
    #[must_use]
    pub fn bind_count(&self) -> u64 {
        *self.binds.lock()
    }
}

impl<P> Default for ResourceSlot<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for ResourceSlot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("bound", &self.resource.lock().is_some())
            .field("binds", &self.bind_count())
            .finish()
    }
}

impl<P: Send + Sync + 'static> BindTarget<P> for ResourceSlot<P> {
    fn set_resource(&self, resource: Option<Arc<P>>) {
        *self.resource.lock() = resource;
        *self.binds.lock() += 1;
    }
}
