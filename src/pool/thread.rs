use crate::error::{PoolError, PoolResult};
use crate::pool::role::{RoleWorker, ThreadRole, WorkerCtx};
use crate::pool::thread_pool::PoolShared;
use crate::utils::{CancelToken, HealthFlag, RuntimeWatch, try_pin_core};
use crossbeam::channel::{self as cbchan, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One role activation: the worker, its private token and its stopwatch.
struct Activation {
    role: Arc<dyn ThreadRole>,
    worker: Arc<dyn RoleWorker>,
    cancel: CancelToken,
    watch: RuntimeWatch,
}

/// A pool slot's native thread.
///
/// The thread loops: build a worker for the current role, run it until it
/// returns or is cancelled, repeat. [`set_role`](Self::set_role) swaps the
/// role live by cancelling the running worker.
///
/// Role switches go through a single-slot handshake token: the loop puts a
/// token in after it created a worker, a switch takes it out before
/// installing the new role. A switch therefore never lands before the worker
/// for the previous role existed, and only one switch per thread is in flight.
pub struct PoolThread {
    index: usize,
    name: String,
    role: RwLock<Arc<dyn ThreadRole>>,
    switch_tx: Mutex<Option<Sender<()>>>,
    switch_rx: Receiver<()>,
    active: RwLock<Option<Arc<Activation>>>,
    last_rate: AtomicU32,
    last_runtime: Mutex<Duration>,
    alive: HealthFlag,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolThread {
    /// Start the native thread for slot `index`, initially running `role`.
    pub(crate) fn spawn(
        pool: &Arc<PoolShared>,
        index: usize,
        role: Arc<dyn ThreadRole>,
    ) -> PoolResult<Arc<PoolThread>> {
        let (switch_tx, switch_rx) = cbchan::bounded::<()>(1);
        let name = format!("{}-{}", pool.config().thread_name_prefix, index);

        let this = Arc::new(PoolThread {
            index,
            name: name.clone(),
            role: RwLock::new(role),
            switch_tx: Mutex::new(Some(switch_tx)),
            switch_rx,
            active: RwLock::new(None),
            last_rate: AtomicU32::new(0f32.to_bits()),
            last_runtime: Mutex::new(Duration::ZERO),
            alive: HealthFlag::new(true),
            handle: Mutex::new(None),
        });

        let ctx = WorkerCtx {
            index,
            thread_name: name.clone(),
            sample_window: pool.config().sample_window,
            sample_period: pool.config().sample_period(),
        };
        let core = pool.config().core_policy.core_for(index, pool.cores());

        let handle = thread::Builder::new()
            .name(name)
            .spawn({
                let this = this.clone();
                let token = pool.token().clone();
                let pool = Arc::downgrade(pool);
                move || this.thread_main(pool, token, ctx, core)
            })
            .map_err(PoolError::Spawn)?;

        *this.handle.lock() = Some(handle);
        Ok(this)
    }

    fn thread_main(
        self: Arc<Self>,
        pool: Weak<PoolShared>,
        token: CancelToken,
        ctx: WorkerCtx,
        core: Option<usize>,
    ) {
        if let Some(core_id) = core {
            match try_pin_core(core_id) {
                Ok(core_id) => tracing::debug!("[PoolThread {}] pinned to core {}", self.index, core_id),
                Err(e) => tracing::warn!("[PoolThread {}] cannot pin core: {}", self.index, e),
            }
        }

        let result = self.drive(&token, &ctx);

        // a dead thread must not leave a switcher blocked on the token
        self.alive.down();
        self.switch_tx.lock().take();

        if let Err(err) = result {
            match pool.upgrade() {
                Some(pool) => pool.report_thread_error(&self, err),
                None => tracing::error!("[PoolThread {}] died after pool drop: {}", self.index, err),
            }
        }
    }

    fn drive(&self, token: &CancelToken, ctx: &WorkerCtx) -> PoolResult<()> {
        while !token.is_cancelled() {
            let role = self.role.read().clone();
            tracing::debug!(
                "[PoolThread {}] starting role worker for role {}",
                self.index,
                role.name()
            );

            let worker = role.create_worker(ctx).map_err(PoolError::Worker)?;
            let activation = Arc::new(Activation {
                role,
                worker,
                cancel: token.new_child(),
                watch: RuntimeWatch::default(),
            });
            *self.active.write() = Some(activation.clone());

            self.release_switch();

            activation.watch.start();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                activation.worker.run(&activation.cancel)
            }));
            activation.watch.stop();

            self.cache_rate(activation.worker.activity_rate());
            *self.last_runtime.lock() = activation.watch.elapsed();
            *self.active.write() = None;

            match outcome {
                Ok(Ok(())) => {}
                // errors raised while the pool shuts down are expected
                Ok(Err(_)) | Err(_) if token.is_cancelled() => {}
                Ok(Err(err)) => return Err(PoolError::Worker(err)),
                Err(payload) => return Err(PoolError::WorkerPanic(panic_message(payload))),
            }
        }
        Ok(())
    }

    /// Put the handshake token back. Full means nobody consumed the previous
    /// release, which is fine.
    fn release_switch(&self) {
        if let Some(tx) = self.switch_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    #[inline]
    fn cache_rate(&self, rate: f32) {
        self.last_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    /// Stable slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The role the thread runs, or will run after the current worker exits.
    pub fn role(&self) -> Arc<dyn ThreadRole> {
        self.role.read().clone()
    }

    /// False once the run loop has exited (shutdown or crash).
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// True while a worker exists for the current activation.
    pub fn has_worker(&self) -> bool {
        self.active.read().is_some()
    }

    /// Switch this thread to `role`.
    ///
    /// Blocks until a worker for the current role has been created, installs
    /// `role` and cancels the running worker so the loop picks the new role
    /// up. Setting the role the thread already has is a no-op.
    pub fn set_role(&self, role: Arc<dyn ThreadRole>) -> PoolResult<()> {
        if Arc::ptr_eq(&*self.role.read(), &role) {
            return Ok(());
        }
        if self.switch_rx.recv().is_err() || !self.alive.get() {
            return Err(PoolError::ThreadDead(self.index));
        }

        {
            let mut current = self.role.write();
            if Arc::ptr_eq(&*current, &role) {
                // a concurrent switch installed it first; no worker will be
                // rebuilt, so the token goes back
                drop(current);
                self.release_switch();
                return Ok(());
            }
            tracing::debug!(
                "[PoolThread {}] switching role {} -> {}",
                self.index,
                current.name(),
                role.name()
            );
            *current = role.clone();
        }

        if let Some(activation) = self.active.read().as_ref()
            && !Arc::ptr_eq(&activation.role, &role)
        {
            activation.cancel.cancel();
        }
        Ok(())
    }

    /// Live activity rate of the current worker, or the last one seen when
    /// the thread is between workers.
    pub fn activity_rate(&self) -> f32 {
        match self.active.read().as_ref() {
            Some(activation) => {
                let rate = activation.worker.activity_rate();
                self.cache_rate(rate);
                rate
            }
            None => self.cached_activity_rate(),
        }
    }

    #[inline]
    pub fn cached_activity_rate(&self) -> f32 {
        f32::from_bits(self.last_rate.load(Ordering::Relaxed))
    }

    /// Running time of the current worker, or of the last finished one.
    pub fn worker_runtime(&self) -> Duration {
        match self.active.read().as_ref() {
            Some(activation) => activation.watch.elapsed(),
            None => *self.last_runtime.lock(),
        }
    }

    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}

impl fmt::Debug for PoolThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolThread")
            .field("index", &self.index)
            .field("role", &self.role.read().name())
            .field("alive", &self.is_alive())
            .field("activity_rate", &self.cached_activity_rate())
            .finish()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}
