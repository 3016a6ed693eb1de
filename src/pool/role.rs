use crate::utils::{ActivityMeter, CancelToken};
use downcast_rs::{DowncastSync, impl_downcast};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// What a role needs to know about the thread it manufactures a worker for.
#[derive(Debug, Clone)]
pub struct WorkerCtx {
    /// Stable slot index of the pool thread.
    pub index: usize,
    /// Native thread name, for log correlation.
    pub thread_name: String,
    pub sample_window: usize,
    pub sample_period: Duration,
}

impl WorkerCtx {
    /// A fresh activity meter sized by the pool's sampling settings.
    pub fn meter(&self) -> ActivityMeter {
        ActivityMeter::new(self.sample_window, self.sample_period)
    }
}

/// A behaviour a pool thread can be assigned.
///
/// Roles are factories: every time a thread (re)enters a role it asks for a
/// fresh [`RoleWorker`] and drops it once `run` returns. Roles are registered
/// with the pool and looked up by concrete type, see
/// [`ThreadPool::find_role`](crate::pool::ThreadPool::find_role).
pub trait ThreadRole: DowncastSync + Debug {
    /// Human-readable role name (for logs/metrics).
    fn name(&self) -> &str;

    /// Build the worker for one activation of this role on `ctx.index`.
    fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>>;
}

impl_downcast!(sync ThreadRole);

/// One activation of a role on one thread.
///
/// `run` blocks until the work is done or `cancel` fires; it must poll the
/// token often enough to return promptly, there is no preemption. An error
/// or a panic escaping `run` kills the thread and makes the pool respawn the
/// slot with the same role.
pub trait RoleWorker: Send + Sync {
    fn run(&self, cancel: &CancelToken) -> anyhow::Result<()>;

    /// Fraction of recent wall-clock time spent on useful work, in `0.0..=1.0`.
    /// Called from other threads while `run` is in progress.
    fn activity_rate(&self) -> f32;
}
