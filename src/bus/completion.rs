//! In-flight work accounting for pooled dispatchers.
//!
//! The [`CompletionTracker`] counts items that have been enqueued but not yet
//! marked done. `join()` on a pooled dispatcher waits for that count to reach
//! zero. Because the count is raised on every enqueue (including those made
//! by workers while a join is waiting) and lowered on every completion, the
//! wait covers recursively generated work too.
//!
//! Marking an item done may be rejected: when the counter is already at zero
//! the completion is treated as over-called, and tests can inject spurious
//! rejections to reproduce the race seen with completion-tracked queues under
//! load. Callers retry a bounded number of times and then use
//! [`CompletionTracker::force_task_done`].

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

/// Errors from [`CompletionTracker::try_task_done`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// More completions were signalled than items were added.
    #[error("task_done() called more times than there were items")]
    OverCalled,
}

/// Counter of in-flight work items.
#[derive(Debug)]
pub struct CompletionTracker {
    unfinished: watch::Sender<usize>,
    spurious_rejections: AtomicUsize,
}

impl CompletionTracker {
    pub fn new() -> Self {
        let (unfinished, _) = watch::channel(0);
        Self {
            unfinished,
            spurious_rejections: AtomicUsize::new(0),
        }
    }

    /// Records one more in-flight item.
    pub fn task_added(&self) {
        self.unfinished.send_modify(|n| *n += 1);
    }

    /// Marks one item done.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::OverCalled`] if the counter is already zero
    /// or a spurious rejection was injected. The counter is unchanged in both
    /// cases.
    pub fn try_task_done(&self) -> Result<(), CompletionError> {
        let injected = self
            .spurious_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CompletionError::OverCalled);
        }

        let mut over_called = false;
        self.unfinished.send_if_modified(|n| {
            if *n == 0 {
                over_called = true;
                false
            } else {
                *n -= 1;
                true
            }
        });

        if over_called {
            Err(CompletionError::OverCalled)
        } else {
            Ok(())
        }
    }

    /// Moves the counter forward unconditionally, saturating at zero.
    pub fn force_task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of items added but not yet done.
    pub fn in_flight(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Waits until no item is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.unfinished.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Makes the next `count` calls to [`try_task_done`](Self::try_task_done)
    /// fail without touching the counter.
    pub fn inject_spurious_rejections(&self, count: usize) {
        self.spurious_rejections.fetch_add(count, Ordering::SeqCst);
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}
