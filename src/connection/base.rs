use crate::connection::codec::NetMessage;
use crate::connection::queue::SendQueue;
use crate::error::{TransportError, TransportResult};
use crate::utils::HealthFlag;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use uuid::Uuid;

pub type ReceiveFn<M> = Box<dyn Fn(M) + Send + Sync>;
pub type DisconnectFn = Box<dyn Fn(&str) + Send + Sync>;

/// Lifecycle and plumbing shared by every connection kind.
///
/// `Connection` implementations own one `ConnectionCore` and hand it out via
/// [`Connection::core`]; the provided trait methods are written against it.
pub trait Connection: Send + Sync {
    type Message: NetMessage;

    fn core(&self) -> &ConnectionCore<Self::Message>;

    /// Human readable identity, for logs.
    fn id(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Tear the connection down. Idempotent, callable from any thread.
    fn dispose(&self);

    /// Encode and write `msg` right now, bypassing the queues.
    fn send_raw(&self, msg: &Self::Message) -> TransportResult<()>;

    /// Queue `msg` should travel through.
    fn queue_for(&self, _msg: &Self::Message) -> Arc<SendQueue<Self::Message>> {
        self.core().default_queue()
    }

    /// Message keep-alive queues emit after a silence.
    fn keep_alive_message(&self) -> Option<Self::Message> {
        None
    }

    fn is_alive(&self) -> bool {
        self.core().is_alive()
    }

    fn queue(&self, name: &str) -> Option<Arc<SendQueue<Self::Message>>> {
        self.core().queue(name)
    }

    fn queues(&self) -> Vec<Arc<SendQueue<Self::Message>>> {
        self.core().queues()
    }

    /// Enqueue `msg` on the queue picked by [`queue_for`](Self::queue_for).
    fn send(&self, msg: Self::Message) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }
        self.queue_for(&msg).push(msg)
    }

    /// Install the receive callback. It runs on the reader thread that decoded
    /// the message, so it must not block for long.
    fn on_receive(&self, handler: impl Fn(Self::Message) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.core().set_receive(Box::new(handler));
    }

    /// Called once, after the connection was disposed, with its id.
    fn on_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.core().add_disconnect(Box::new(handler));
    }
}

pub struct ConnectionCore<M: NetMessage> {
    session: Uuid,
    alive: HealthFlag,
    dispose_lock: Mutex<()>,
    queues: RwLock<Vec<Arc<SendQueue<M>>>>,
    receive: ArcSwapOption<ReceiveFn<M>>,
    on_disconnect: Mutex<Vec<DisconnectFn>>,
}

impl<M: NetMessage> ConnectionCore<M> {
    /// `default_queue` becomes the first entry of the queue registry.
    pub fn new(default_queue: SendQueue<M>) -> Self {
        Self {
            session: Uuid::new_v4(),
            alive: HealthFlag::new(true),
            dispose_lock: Mutex::new(()),
            queues: RwLock::new(vec![Arc::new(default_queue)]),
            receive: ArcSwapOption::empty(),
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    /// Random per-connection id, stable for the connection's lifetime.
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// First eight hex digits of the session, for thread names.
    pub fn short_session(&self) -> String {
        self.session.simple().to_string()[..8].to_string()
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub(crate) fn alive_flag(&self) -> &HealthFlag {
        &self.alive
    }

    pub(crate) fn dispose_lock(&self) -> &Mutex<()> {
        &self.dispose_lock
    }

    pub fn add_queue(&self, queue: SendQueue<M>) -> Arc<SendQueue<M>> {
        let queue = Arc::new(queue);
        self.queues.write().push(queue.clone());
        queue
    }

    pub fn default_queue(&self) -> Arc<SendQueue<M>> {
        // registry is never empty, see `new`
        self.queues.read()[0].clone()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<SendQueue<M>>> {
        self.queues.read().iter().find(|q| q.name() == name).cloned()
    }

    pub fn queues(&self) -> Vec<Arc<SendQueue<M>>> {
        self.queues.read().clone()
    }

    /// Spawn the flusher of every registered queue.
    pub(crate) fn start_queues(
        &self,
        conn: Weak<dyn Connection<Message = M>>,
    ) -> TransportResult<()> {
        let tag = self.short_session();
        for queue in self.queues() {
            queue.start(conn.clone(), format!("relay-{}-{}", queue.name(), tag))?;
        }
        Ok(())
    }

    pub fn set_receive(&self, handler: ReceiveFn<M>) {
        self.receive.store(Some(Arc::new(handler)));
    }

    pub fn add_disconnect(&self, handler: DisconnectFn) {
        self.on_disconnect.lock().push(handler);
    }

    /// Deliver a decoded message to the receive callback, if any.
    pub fn receive(&self, msg: M) {
        if let Some(handler) = self.receive.load_full() {
            handler(msg);
        }
    }

    /// First half of a dispose: marks the connection dead and stops the
    /// queues. Returns false for every call but the first.
    pub(crate) fn begin_dispose(&self) -> bool {
        {
            let _gate = self.dispose_lock.lock();
            if !self.alive.take_down() {
                return false;
            }
        }
        for queue in self.queues.read().iter() {
            queue.stop();
        }
        true
    }

    /// Second half of a dispose: notifies disconnect listeners.
    pub(crate) fn finish_dispose(&self, id: &str) {
        let handlers = std::mem::take(&mut *self.on_disconnect.lock());
        for handler in &handlers {
            handler(id);
        }
        self.receive.store(None);
    }
}
