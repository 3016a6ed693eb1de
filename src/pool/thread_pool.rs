use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::pool::idle::IdleRole;
use crate::pool::role::ThreadRole;
use crate::pool::thread::PoolThread;
use crate::utils::{CancelToken, available_cores};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// State shared between the pool handle and its threads. Threads only keep
/// a `Weak` to it, so dropping the [`ThreadPool`] tears everything down.
pub(crate) struct PoolShared {
    threads: RwLock<Vec<Arc<PoolThread>>>,
    roles: RwLock<Vec<Arc<dyn ThreadRole>>>,
    idle_role: Arc<IdleRole>,
    token: CancelToken,
    disposed: AtomicBool,
    config: PoolConfig,
    cores: usize,
    /// Handles of crashed threads whose slot was already refilled.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    #[inline]
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn cores(&self) -> usize {
        self.cores
    }

    #[inline]
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Called by a pool thread whose run loop died. Respawns the slot with
    /// the role the dead thread last had, unless the pool is going away.
    pub(crate) fn report_thread_error(self: &Arc<Self>, thread: &Arc<PoolThread>, err: PoolError) {
        tracing::error!("[ThreadPool] error in pool thread {}: {}", thread.index(), err);

        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let mut threads = self.threads.write();
        // re-checked under the lock: dispose flips the flag before taking it
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let idx = thread.index();
        match threads.get(idx) {
            Some(current) if Arc::ptr_eq(current, thread) => {}
            _ => return,
        }

        tracing::debug!("[ThreadPool] restarting pool thread {}", idx);
        match PoolThread::spawn(self, idx, thread.role()) {
            Ok(fresh) => {
                let dead = std::mem::replace(&mut threads[idx], fresh);
                if let Some(handle) = dead.take_handle() {
                    self.retired.lock().push(handle);
                }
            }
            Err(err) => {
                tracing::error!("[ThreadPool] cannot restart pool thread {}: {}", idx, err);
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("[ThreadPool] disposing");

        // cancels every worker through its child token
        self.token.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let threads = self.threads.write();
            let mut roles = self.roles.write();
            roles.clear();
            threads
                .iter()
                .filter_map(|t| t.take_handle())
                .chain(self.retired.lock().drain(..))
                .collect()
        };

        // joined outside the locks: a crashing thread may still be waiting
        // for the write lock in report_thread_error
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("[ThreadPool] pool thread panicked while shutting down");
            }
        }
    }
}

/// Fixed-size pool of role-switchable threads.
///
/// Every slot starts on the [`IdleRole`]. Roles are registered with
/// [`add_role`](Self::add_role) and assigned with [`PoolThread::set_role`].
/// A thread whose worker fails or panics is replaced in place (same index,
/// same role), so the pool never shrinks below its configured size.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Spawn the pool. Both structural locks are held while the threads start,
    /// so nothing can observe a half-built pool.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        let count = config.thread_count();
        let idle_role = Arc::new(IdleRole);
        let shared = Arc::new(PoolShared {
            threads: RwLock::new(Vec::with_capacity(count)),
            roles: RwLock::new(Vec::new()),
            idle_role: idle_role.clone(),
            token: CancelToken::new_root(),
            disposed: AtomicBool::new(false),
            cores: available_cores(),
            config,
            retired: Mutex::new(Vec::new()),
        });

        let spawned = {
            let mut threads = shared.threads.write();
            let mut roles = shared.roles.write();
            roles.push(idle_role.clone());

            tracing::info!("[ThreadPool] creating thread pool with {} threads", count);
            (0..count).try_for_each(|idx| {
                let t = PoolThread::spawn(&shared, idx, idle_role.clone())?;
                threads.push(t);
                Ok::<(), PoolError>(())
            })
        };

        if let Err(err) = spawned {
            shared.dispose();
            return Err(err);
        }
        Ok(Self { shared })
    }

    /// Register a role. Duplicates are allowed; check with
    /// [`find_role`](Self::find_role) first when a singleton is needed.
    pub fn add_role(&self, role: Arc<dyn ThreadRole>) -> PoolResult<()> {
        if self.is_disposed() {
            return Err(PoolError::Disposed);
        }
        tracing::debug!("[ThreadPool] adding role {}", role.name());
        self.shared.roles.write().push(role);
        Ok(())
    }

    /// Lazily walk the thread slots. Each step takes its own read lock, so
    /// slots replaced during the walk show up as they are when reached.
    pub fn threads(&self) -> impl Iterator<Item = Arc<PoolThread>> + '_ {
        let shared = &self.shared;
        (0..).map_while(move |idx| shared.threads.read().get(idx).cloned())
    }

    /// Lazily walk the registered roles, same locking as [`threads`](Self::threads).
    pub fn roles(&self) -> impl Iterator<Item = Arc<dyn ThreadRole>> + '_ {
        let shared = &self.shared;
        (0..).map_while(move |idx| shared.roles.read().get(idx).cloned())
    }

    pub fn find_thread(&self, filter: impl Fn(&PoolThread) -> bool) -> Option<Arc<PoolThread>> {
        self.threads().find(|t| filter(t))
    }

    /// First registered role of concrete type `T`.
    pub fn find_role<T: ThreadRole>(&self) -> Option<Arc<T>> {
        self.find_role_by::<T>(|_| true)
    }

    /// First registered role of concrete type `T` accepted by `filter`.
    pub fn find_role_by<T: ThreadRole>(&self, filter: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.roles()
            .filter_map(|role| role.downcast_arc::<T>().ok())
            .find(|role| filter(role))
    }

    /// Current occupant of slot `index`. Hold the index, not the thread:
    /// a crashed thread is replaced by a new object at the same index.
    pub fn thread(&self, index: usize) -> Option<Arc<PoolThread>> {
        self.shared.threads.read().get(index).cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.threads.read().len()
    }

    pub fn idle_role(&self) -> Arc<IdleRole> {
        self.shared.idle_role.clone()
    }

    /// Pool-wide cancellation token; cancelled on dispose.
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    pub fn sample_window(&self) -> usize {
        self.shared.config.sample_window
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Mean of every thread's cached activity rate.
    pub fn activity_rate(&self) -> f32 {
        let threads: Vec<Arc<PoolThread>> = self.shared.threads.read().clone();
        if threads.is_empty() {
            return 0.0;
        }
        threads.iter().map(|t| t.activity_rate()).sum::<f32>() / threads.len() as f32
    }

    pub fn stats(&self) -> PoolStats {
        let threads: Vec<ThreadStats> = self
            .threads()
            .map(|t| ThreadStats {
                index: t.index(),
                role: t.role().name().to_string(),
                alive: t.is_alive(),
                activity_rate: t.activity_rate(),
                worker_runtime_ms: t.worker_runtime().as_millis() as u64,
            })
            .collect();
        let activity_rate = if threads.is_empty() {
            0.0
        } else {
            threads.iter().map(|t| t.activity_rate).sum::<f32>() / threads.len() as f32
        };
        PoolStats {
            thread_count: threads.len(),
            activity_rate,
            roles: self.roles().map(|r| r.name().to_string()).collect(),
            threads,
        }
    }

    /// Stop every worker and join every pool thread. Idempotent, callable
    /// from any thread, including a pool thread (which is then not joined).
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.thread_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

/// Serializable telemetry snapshot for ops tooling.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub thread_count: usize,
    pub activity_rate: f32,
    pub roles: Vec<String>,
    pub threads: Vec<ThreadStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadStats {
    pub index: usize,
    pub role: String,
    pub alive: bool,
    pub activity_rate: f32,
    pub worker_runtime_ms: u64,
}
