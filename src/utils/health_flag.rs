use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply clonable liveness flag shared between a connection and the
/// threads serving it (readers, queue flushers, buffer guards).
///
/// Wraps an `AtomicBool` in `Arc<CachePadded<...>>` to avoid false sharing,
/// since every reader loop polls it.
#[derive(Clone)]
#[repr(transparent)]
pub struct HealthFlag(Arc<CachePadded<AtomicBool>>);

impl HealthFlag {
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    #[inline(always)]
    fn atomic(&self) -> &AtomicBool {
        &self.0
    }

    /// Current value (acquire load).
    #[inline(always)]
    pub fn get(&self) -> bool {
        self.atomic().load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn up(&self) {
        self.atomic().store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn down(&self) {
        self.atomic().store(false, Ordering::Release);
    }

    /// Lower the flag and report whether this call was the one that lowered
    /// it. Teardown paths use this to run exactly once.
    #[inline]
    pub fn take_down(&self) -> bool {
        self.atomic().swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for HealthFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthFlag")
            .field("value", &self.get())
            .finish()
    }
}
