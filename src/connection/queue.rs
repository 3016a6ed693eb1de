use crate::config::SendQueueConfig;
use crate::connection::base::Connection;
use crate::connection::codec::NetMessage;
use crate::error::{TransportError, TransportResult};
use crate::utils::HealthFlag;
use crossbeam::channel::{self as cbchan, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on how long a stopped queue's flusher keeps running.
const QUEUE_POLL_TICK: Duration = Duration::from_millis(100);

/// Ordered outbound queue drained by exactly one flusher thread.
///
/// The flusher pushes each message through [`Connection::send_raw`]. A
/// keep-alive queue additionally emits the connection's keep-alive message
/// whenever it stayed silent for the configured interval.
pub struct SendQueue<M: NetMessage> {
    name: String,
    keep_alive: bool,
    keep_alive_interval: Duration,
    tx: Sender<M>,
    rx: Mutex<Option<Receiver<M>>>,
    running: HealthFlag,
    sent: Arc<AtomicU64>,
}

impl<M: NetMessage> SendQueue<M> {
    pub fn new(name: impl Into<String>, keep_alive: bool, cfg: &SendQueueConfig) -> Self {
        let (tx, rx) = match cfg.capacity {
            Some(cap) => cbchan::bounded(cap.max(1)),
            None => cbchan::unbounded(),
        };
        Self {
            name: name.into(),
            keep_alive,
            keep_alive_interval: cfg.keep_alive_interval(),
            tx,
            rx: Mutex::new(Some(rx)),
            running: HealthFlag::new(true),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Messages waiting for the flusher.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Messages (keep-alives included) handed to the socket so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Enqueue without blocking.
    pub fn push(&self, msg: M) -> TransportResult<()> {
        if !self.running.get() {
            return Err(TransportError::Disposed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull(self.name.clone())),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disposed),
        }
    }

    /// Start the flusher. Only the first call spawns a thread.
    pub(crate) fn start(
        &self,
        conn: Weak<dyn Connection<Message = M>>,
        thread_name: String,
    ) -> TransportResult<()> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let flusher = Flusher {
            name: self.name.clone(),
            keep_alive: self.keep_alive.then_some(self.keep_alive_interval),
            rx,
            running: self.running.clone(),
            sent: self.sent.clone(),
            conn,
        };

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || flusher.run())
            .map(|_| ())
            .map_err(TransportError::Io)
    }

    /// Stop accepting messages; the flusher exits within one poll tick.
    /// Whatever is still queued is dropped.
    pub(crate) fn stop(&self) {
        self.running.down();
    }
}

struct Flusher<M: NetMessage> {
    name: String,
    keep_alive: Option<Duration>,
    rx: Receiver<M>,
    running: HealthFlag,
    sent: Arc<AtomicU64>,
    conn: Weak<dyn Connection<Message = M>>,
}

impl<M: NetMessage> Flusher<M> {
    fn run(self) {
        let mut last_sent = Instant::now();

        while self.running.get() {
            let wait = match self.keep_alive {
                Some(interval) => interval.saturating_sub(last_sent.elapsed()).min(QUEUE_POLL_TICK),
                None => QUEUE_POLL_TICK,
            };

            let msg = match self.rx.recv_timeout(wait) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => {
                    let due = self.keep_alive.is_some_and(|i| last_sent.elapsed() >= i);
                    if !due {
                        continue;
                    }
                    last_sent = Instant::now();
                    match self.conn.upgrade().and_then(|c| c.keep_alive_message()) {
                        Some(msg) => msg,
                        None => continue,
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if !self.running.get() {
                break;
            }
            let Some(conn) = self.conn.upgrade() else {
                break;
            };

            match conn.send_raw(&msg) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    last_sent = Instant::now();
                }
                Err(_) if !conn.is_alive() => break,
                Err(err) => {
                    if err.is_disconnect() {
                        tracing::info!("[SendQueue {}] peer of {} went away: {}", self.name, conn.id(), err);
                    } else {
                        tracing::error!(
                            "[SendQueue {}] send failed on {}: {}",
                            self.name,
                            conn.id(),
                            err
                        );
                    }
                    conn.dispose();
                    break;
                }
            }
        }
        tracing::debug!("[SendQueue {}] flusher stopped", self.name);
    }
}
