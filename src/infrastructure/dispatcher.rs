//! Channel-backed UI dispatcher.
//!
//! Worker tasks post closures; whichever thread owns the [`UiLoop`] acts as
//! the UI thread and runs them in posting order.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::domain::ports::{UiDispatcher, UiTask};

/// Posting half, shared with the engine.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<UiTask>,
}

/// Receiving half, owned by the UI thread.
#[derive(Debug)]
pub struct UiLoop {
    rx: mpsc::UnboundedReceiver<UiTask>,
}

impl ChannelDispatcher {
    /// Creates a dispatcher and the loop that drains it.
    #[must_use]
    pub fn new() -> (Self, UiLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UiLoop { rx })
    }
}

impl UiDispatcher for ChannelDispatcher {
    fn post(&self, task: UiTask) {
        if self.tx.send(task).is_err() {
            warn!("UI loop is gone, dropping posted task");
        }
    }
}

impl UiLoop {
    /// Runs every task already queued, without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Waits for the next task and runs it. Returns false once every
    /// dispatcher was dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until none arrives for `quiet`. Returns how many ran.
    pub async fn run_until_idle(&mut self, quiet: Duration) -> usize {
        let mut ran = 0;
        while let Ok(Some(task)) = tokio::time::timeout(quiet, self.rx.recv()).await {
            task();
            ran += 1;
        }
        trace!(ran, "UI loop idle");
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_posted_tasks_run_on_loop_only() {
        let (dispatcher, mut ui) = ChannelDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            dispatcher.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(ui.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_next_ends_when_dispatchers_drop() {
        let (dispatcher, mut ui) = ChannelDispatcher::new();
        dispatcher.post(Box::new(|| {}));
        drop(dispatcher);

        assert!(ui.run_next().await);
        assert!(!ui.run_next().await);
    }
}
