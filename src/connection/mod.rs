pub use base::{Connection, ConnectionCore, DisconnectFn, ReceiveFn};
pub use buffers::{BufferPool, PooledBuffer};
pub use codec::{Codec, DataFlags, Frame, FrameCodec, NetMessage};
pub use hybrid::{HybridConnection, RELIABLE_QUEUE, UNRELIABLE_QUEUE};
pub use queue::SendQueue;
pub use udp_errors::{UdpErrorHandler, UdpErrorSubscription};

mod base;
mod buffers;
mod codec;
pub mod disguise;
mod hybrid;
mod queue;
mod udp_errors;
