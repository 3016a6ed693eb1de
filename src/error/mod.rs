use std::{error::Error, fmt, io};

const ERR_MSG_POOL_DISPOSED: &str = "thread pool is disposed";
const ERR_MSG_CONN_DISPOSED: &str = "connection is disposed";
const ERR_MSG_NO_UDP: &str = "connection has no udp socket";
const ERR_MSG_NO_UDP_ENDPOINT: &str = "udp socket has no peer and no remote endpoint";

pub type PoolResult<T> = Result<T, PoolError>;
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures of the thread pool and its threads.
#[derive(Debug)]
pub enum PoolError {
    /// The pool was disposed; no further structural change is possible.
    Disposed,
    /// The thread at this index has exited and can no longer switch roles.
    /// The pool respawns the slot; fetch the replacement by index.
    ThreadDead(usize),
    /// The OS refused to spawn a thread.
    Spawn(io::Error),
    /// A role worker panicked.
    WorkerPanic(String),
    /// A role failed to create its worker, or the worker's `run` failed.
    Worker(anyhow::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => write!(f, "{ERR_MSG_POOL_DISPOSED}"),
            Self::ThreadDead(idx) => write!(f, "pool thread {idx} is dead"),
            Self::Spawn(err) => write!(f, "failed to spawn pool thread: {err}"),
            Self::WorkerPanic(msg) => write!(f, "role worker panicked: {msg}"),
            Self::Worker(err) => write!(f, "role worker failed: {err:#}"),
        }
    }
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            Self::Worker(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        PoolError::Worker(err)
    }
}

/// Failures of a hybrid transport connection.
#[derive(Debug)]
pub enum TransportError {
    /// Socket or codec I/O failure.
    Io(io::Error),
    Disposed,
    NoUdp,
    NoUdpEndpoint,
    /// The plain-text disguise exchange was malformed.
    Handshake(String),
    /// The reader for this transport already took ownership of the stream.
    ReaderStarted,
    /// A bounded send queue is full; the message was not queued.
    QueueFull(String),
}

impl TransportError {
    /// Errors that are an expected consequence of the peer going away.
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            Self::Disposed => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Disposed => write!(f, "{ERR_MSG_CONN_DISPOSED}"),
            Self::NoUdp => write!(f, "{ERR_MSG_NO_UDP}"),
            Self::NoUdpEndpoint => write!(f, "{ERR_MSG_NO_UDP_ENDPOINT}"),
            Self::Handshake(s) => write!(f, "malformed handshake: {s}"),
            Self::ReaderStarted => write!(f, "reader already started"),
            Self::QueueFull(name) => write!(f, "send queue {name} is full"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        let eof = TransportError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_disconnect());
        let timeout = TransportError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(!timeout.is_disconnect());
        assert!(TransportError::Disposed.is_disconnect());
        assert!(!TransportError::NoUdp.is_disconnect());
    }

    #[test]
    fn pool_error_display() {
        assert_eq!(PoolError::ThreadDead(3).to_string(), "pool thread 3 is dead");
        let e: PoolError = anyhow::anyhow!("boom").into();
        assert!(e.to_string().contains("boom"));
    }
}
