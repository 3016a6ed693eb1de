pub use idle::{IdleRole, IdleWorker};
pub use role::{RoleWorker, ThreadRole, WorkerCtx};
pub use thread::PoolThread;
pub use thread_pool::{PoolStats, ThreadPool, ThreadStats};

mod idle;
mod role;
mod thread;
mod thread_pool;
