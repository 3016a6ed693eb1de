use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of [`CancelToken::sleep_cancellable`]; bounds how late a
/// sleeping thread notices cancellation.
pub const CANCEL_POLL_TICK: Duration = Duration::from_millis(50);

/// Shared cancellation state. A state may have a parent, so that cancelling
/// the parent is observed by all of its descendants.
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    #[inline]
    fn root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: None,
        })
    }

    #[inline]
    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent),
        })
    }

    /// Returns true if this call flipped the flag.
    #[inline]
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        let mut cur = self;
        loop {
            if cur.cancelled.load(Ordering::Acquire) {
                return true;
            }
            match cur.parent {
                Some(ref p) => cur = p,
                None => return false,
            }
        }
    }
}

/// Hierarchical cancellation token.
///
/// Cloning is cheap and clones share the same signal. [`new_child`](Self::new_child)
/// derives a token that can be cancelled on its own but also observes every
/// cancellation of its ancestors. The pool hands each role worker a child of
/// the pool-wide token, so a role switch stops one worker while shutdown stops
/// all of them.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("is_root", &self.is_root())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root cancellation token.
    #[inline]
    pub fn new_root() -> Self {
        Self {
            state: CancelState::root(),
        }
    }

    /// Cancel this token and, transitively, all tokens derived from it.
    /// Returns `true` only for the call that actually tripped it.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// Check if this token or any ancestor has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.state.parent.is_none()
    }

    /// Create a new child token linked to this one.
    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            state: CancelState::child_of(self.state.clone()),
        }
    }

    /// Sleep until the token is cancelled or `total` has elapsed.
    /// Returns `false` if woken by cancellation, `true` otherwise.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL_TICK.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_observes_parent_cancel() {
        let root = CancelToken::new_root();
        let child = root.new_child();
        let grandchild = child.new_child();

        assert!(!grandchild.is_cancelled());
        assert!(root.cancel());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancelToken::new_root();
        let child = root.new_child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!root.new_child().is_cancelled());
    }

    #[test]
    fn cancel_reports_first_trip_only() {
        let t = CancelToken::new_root();
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!t.clone().cancel());
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let t = CancelToken::new_root();
        let c = t.clone();
        let h = std::thread::spawn(move || c.sleep_cancellable(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        t.cancel();
        let started = Instant::now();
        assert!(!h.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
