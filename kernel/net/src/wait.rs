//! Event posting toward blocked socket callers.
//!
//! The stack never blocks. Whenever receive data arrives, send space frees
//! up, or a connection changes state, the engine posts on the socket's
//! `WaitQueue`. Actual sleeping is delegated to `SocketWaitHooks`, which the
//! kernel supplies when it builds the `NetStack`; without hooks every wait is
//! a non-blocking poll.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Wait operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An event was posted
    Woken,
    /// Operation timed out (or non-blocking poll found nothing)
    TimedOut,
    /// Queue closed while waiting
    Closed,
    /// No process context available (called from kernel context)
    NoProcess,
}

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// Scheduler integration for blocking socket waits.
///
/// # Safety
///
/// Implementations must:
/// - Not hold locks across reschedule calls
/// - Never call back into the stack from `wake_one`/`wake_all`; those run
///   from the receive path and the timer tick
pub trait SocketWaitHooks: Send + Sync {
    /// Block the current task until woken, timed out, or the queue is closed.
    ///
    /// # Arguments
    /// * `queue` - The wait queue to block on
    /// * `timeout_ns` - `None` blocks indefinitely, `Some(n)` for up to n ns
    fn wait(&self, queue: &WaitQueue, timeout_ns: Option<u64>) -> WaitOutcome;

    /// Wake the oldest waiter on `queue`.
    fn wake_one(&self, queue: &WaitQueue);

    /// Wake all waiters on `queue`.
    fn wake_all(&self, queue: &WaitQueue);
}

// ============================================================================
// WaitQueue
// ============================================================================

/// Per-socket event queue.
///
/// A wakeup counter records posts that arrive while nobody waits, so the
/// next wait returns immediately instead of sleeping through the event.
pub struct WaitQueue {
    closed: AtomicBool,
    wakeup_count: AtomicU64,
    hooks: Option<Arc<dyn SocketWaitHooks>>,
}

impl WaitQueue {
    pub fn new(hooks: Option<Arc<dyn SocketWaitHooks>>) -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
            hooks,
        }
    }

    /// Wait for the next posted event.
    ///
    /// # Arguments
    /// * `timeout_ns` - `Some(0)` polls, `Some(n)` blocks up to n ns,
    ///   `None` blocks indefinitely
    pub fn wait_with_timeout(&self, timeout_ns: Option<u64>) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        if self
            .wakeup_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
        {
            return WaitOutcome::Woken;
        }

        if timeout_ns == Some(0) {
            return WaitOutcome::TimedOut;
        }

        match &self.hooks {
            Some(hooks) => hooks.wait(self, timeout_ns),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Signal one waiter.
    pub fn wake_one(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = &self.hooks {
            hooks.wake_one(self);
        }
    }

    /// Post an event to every waiter.
    pub fn post(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = &self.hooks {
            hooks.wake_all(self);
        }
    }

    /// Number of posts not yet consumed by a wait.
    pub fn pending_events(&self) -> u64 {
        self.wakeup_count.load(Ordering::Acquire)
    }

    /// Close the queue and release every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(hooks) = &self.hooks {
            hooks.wake_all(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct CountingHooks {
        wakes: AtomicUsize,
    }

    impl SocketWaitHooks for CountingHooks {
        fn wait(&self, _queue: &WaitQueue, _timeout_ns: Option<u64>) -> WaitOutcome {
            WaitOutcome::TimedOut
        }

        fn wake_one(&self, _queue: &WaitQueue) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }

        fn wake_all(&self, _queue: &WaitQueue) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_post_before_wait_is_not_lost() {
        let queue = WaitQueue::default();
        assert_eq!(queue.wait_with_timeout(Some(0)), WaitOutcome::TimedOut);
        queue.post();
        assert_eq!(queue.wait_with_timeout(None), WaitOutcome::Woken);
        assert_eq!(queue.wait_with_timeout(None), WaitOutcome::TimedOut);
        queue.close();
        assert_eq!(queue.wait_with_timeout(None), WaitOutcome::Closed);
    }

    #[test]
    fn test_hooks_see_posts() {
        let hooks = Arc::new(CountingHooks {
            wakes: AtomicUsize::new(0),
        });
        let queue = WaitQueue::new(Some(hooks.clone()));
        queue.post();
        queue.wake_one();
        assert_eq!(hooks.wakes.load(Ordering::Relaxed), 2);
        assert_eq!(queue.pending_events(), 2);
    }
}
