use crate::pool::role::{RoleWorker, ThreadRole, WorkerCtx};
use crate::utils::{ActivityMeter, CancelToken};
use std::sync::Arc;
use std::time::Duration;

const IDLE_NAP: Duration = Duration::from_secs(1);

/// Default role of every pool thread: sleeps until reassigned.
#[derive(Debug, Default)]
pub struct IdleRole;

impl ThreadRole for IdleRole {
    fn name(&self) -> &str {
        "idle"
    }

    fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
        Ok(Arc::new(IdleWorker { meter: ctx.meter() }))
    }
}

pub struct IdleWorker {
    meter: ActivityMeter,
}

impl RoleWorker for IdleWorker {
    fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        // never enters an active zone, so the rate stays at zero
        while cancel.sleep_cancellable(IDLE_NAP) {}
        Ok(())
    }

    fn activity_rate(&self) -> f32 {
        self.meter.rate()
    }
}
