pub use crate::config::{PoolConfig, RelayConfig, SendQueueConfig, TransportConfig};
pub use crate::connection::{
    Codec, Connection, DataFlags, Frame, FrameCodec, HybridConnection, NetMessage, SendQueue,
    UdpErrorSubscription,
};
pub use crate::error::{PoolError, PoolResult, TransportError, TransportResult};
pub use crate::pool::{
    IdleRole, PoolStats, PoolThread, RoleWorker, ThreadPool, ThreadRole, WorkerCtx,
};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{ActivityMeter, CancelToken, CorePickPolicy, HealthFlag, RuntimeWatch};
