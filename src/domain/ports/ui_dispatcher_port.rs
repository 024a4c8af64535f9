//! Port for posting work to the UI thread.

/// A unit of work that must run on the UI thread.
pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// "Post a task to run on the UI thread".
///
/// Implementations must never run the task inline on the posting thread.
pub trait UiDispatcher: Send + Sync {
    /// Queues `task` for the UI thread.
    fn post(&self, task: UiTask);
}
