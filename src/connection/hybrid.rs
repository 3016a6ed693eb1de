use crate::config::TransportConfig;
use crate::connection::base::{Connection, ConnectionCore};
use crate::connection::buffers::BufferPool;
use crate::connection::codec::{Codec, DataFlags, NetMessage};
use crate::connection::disguise;
use crate::connection::queue::SendQueue;
use crate::connection::udp_errors::{UdpErrorHandler, UdpErrorHub, UdpErrorSubscription};
use crate::error::{TransportError, TransportResult};
use crate::{error_throttled, warn_throttled};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

pub const RELIABLE_QUEUE: &str = "reliable";
pub const UNRELIABLE_QUEUE: &str = "unreliable";

const LOG_THROTTLE: Duration = Duration::from_secs(5);

#[inline]
fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// One logical peer connection over a TCP stream and an optional UDP socket.
///
/// Messages flagged [`DataFlags::UPDATE`] travel over UDP when a socket is
/// present and UDP sending is enabled, everything else over TCP. Each
/// transport has its own [`SendQueue`] and, once started, its own reader
/// thread. UDP failures are never fatal on the send side; they are recorded
/// and handed to [`on_udp_error`](Self::on_udp_error) subscribers.
///
/// Control handshakes ([`read_disguise`](Self::read_disguise) and friends)
/// operate on the raw stream and must happen before
/// [`start_read_tcp`](Self::start_read_tcp).
pub struct HybridConnection<C: Codec> {
    core: ConnectionCore<C::Message>,
    codec: Arc<C>,
    config: TransportConfig,

    tcp: TcpStream,
    tcp_writer: Mutex<Option<TcpStream>>,
    tcp_reader: Mutex<Option<BufReader<TcpStream>>>,
    tcp_endpoints: OnceLock<(SocketAddr, SocketAddr)>,

    udp: Option<Arc<UdpSocket>>,
    udp_local: OnceLock<SocketAddr>,
    udp_remote: RwLock<Option<SocketAddr>>,
    udp_reading: AtomicBool,
    send_udp: AtomicBool,
    udp_errors: UdpErrorHub,

    reliable: Arc<SendQueue<C::Message>>,
    unreliable: Arc<SendQueue<C::Message>>,
    buffers: BufferPool,
}

impl<C: Codec> HybridConnection<C> {
    /// Client side: connect TCP to `host:port` and, with `want_udp`, open a
    /// UDP socket associated with the very address TCP resolved to.
    pub fn connect(
        host: &str,
        port: u16,
        want_udp: bool,
        codec: C,
        config: TransportConfig,
    ) -> TransportResult<Arc<Self>> {
        let tcp = TcpStream::connect((host, port))?;
        let udp = if want_udp {
            // no second lookup: it could resolve to another address family
            let peer = tcp.peer_addr()?;
            Some(Arc::new(open_udp(peer, &config)?))
        } else {
            None
        };

        let conn = Self::build(tcp, udp, codec, config)?;
        if conn.udp.is_some() {
            let peer = conn.tcp.peer_addr()?;
            conn.set_udp_remote(peer);
        }
        tracing::debug!("[HybridConnection] connected {}", conn);
        Ok(conn)
    }

    /// Server side: wrap an accepted stream and an optional, possibly shared,
    /// UDP socket. Use [`set_udp_remote`](Self::set_udp_remote) once the
    /// peer's datagram address is known.
    pub fn from_sockets(
        tcp: TcpStream,
        udp: Option<Arc<UdpSocket>>,
        codec: C,
        config: TransportConfig,
    ) -> TransportResult<Arc<Self>> {
        Self::build(tcp, udp, codec, config)
    }

    fn build(
        tcp: TcpStream,
        udp: Option<Arc<UdpSocket>>,
        codec: C,
        config: TransportConfig,
    ) -> TransportResult<Arc<Self>> {
        tcp.set_nodelay(config.nodelay)?;
        tcp.set_read_timeout(config.recv_timeout())?;
        tcp.set_write_timeout(config.send_timeout())?;

        let writer = tcp.try_clone()?;
        let reader = BufReader::new(tcp.try_clone()?);

        let reliable = SendQueue::new(RELIABLE_QUEUE, false, &config.queue);
        let core = ConnectionCore::new(reliable);
        let reliable = core.default_queue();
        let unreliable = core.add_queue(SendQueue::new(UNRELIABLE_QUEUE, true, &config.queue));

        let conn = Arc::new(Self {
            core,
            codec: Arc::new(codec),
            buffers: BufferPool::new(config.buffer_capacity),
            config,
            tcp,
            tcp_writer: Mutex::new(Some(writer)),
            tcp_reader: Mutex::new(Some(reader)),
            tcp_endpoints: OnceLock::new(),
            udp,
            udp_local: OnceLock::new(),
            udp_remote: RwLock::new(None),
            udp_reading: AtomicBool::new(false),
            send_udp: AtomicBool::new(true),
            udp_errors: UdpErrorHub::default(),
            reliable,
            unreliable,
        });

        let weak: Weak<Self> = Arc::downgrade(&conn);
        let weak: Weak<dyn Connection<Message = C::Message>> = weak;
        if let Err(err) = conn.core.start_queues(weak) {
            conn.dispose();
            return Err(err);
        }
        Ok(conn)
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn has_udp(&self) -> bool {
        self.udp.is_some()
    }

    pub fn udp_socket(&self) -> Option<&Arc<UdpSocket>> {
        self.udp.as_ref()
    }

    /// Whether UDP may be used for sending at all.
    pub fn send_udp_enabled(&self) -> bool {
        self.send_udp.load(Ordering::Acquire)
    }

    pub fn set_send_udp(&self, enabled: bool) {
        self.send_udp.store(enabled, Ordering::Release);
    }

    /// True iff `msg` would go out over UDP right now.
    pub fn send_via_udp(&self, msg: &C::Message) -> bool {
        msg.flags().contains(DataFlags::UPDATE) && self.udp.is_some() && self.send_udp_enabled()
    }

    pub fn reliable_queue(&self) -> &Arc<SendQueue<C::Message>> {
        &self.reliable
    }

    pub fn unreliable_queue(&self) -> &Arc<SendQueue<C::Message>> {
        &self.unreliable
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Local and remote TCP endpoints, known once the TCP reader started.
    pub fn tcp_endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.tcp_endpoints.get().copied()
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp_local
            .get()
            .copied()
            .or_else(|| self.udp.as_ref().and_then(|u| u.local_addr().ok()))
    }

    /// Address datagrams are sent to and accepted from.
    pub fn udp_remote(&self) -> Option<SocketAddr> {
        *self.udp_remote.read()
    }

    /// Pin the peer's datagram address, typically after its association token
    /// arrived on a shared server socket.
    pub fn set_udp_remote(&self, addr: SocketAddr) {
        *self.udp_remote.write() = Some(addr);
    }

    // ---- control handshakes ----

    /// Server side: consume the peer's disguise request and return its token
    /// (0 when it sent none).
    pub fn read_disguise(&self) -> TransportResult<u32> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }
        let mut reader = self.tcp_reader.lock();
        let reader = reader.as_mut().ok_or(TransportError::ReaderStarted)?;
        disguise::read_request(reader)
    }

    /// Server side: answer with the teapot response carrying `token`.
    pub fn write_disguise(&self, token: u32) -> TransportResult<()> {
        let mut writer = self.tcp_writer.lock();
        let writer = writer.as_mut().ok_or(TransportError::Disposed)?;
        disguise::write_response(writer, token)?;
        Ok(())
    }

    /// Client side: open the exchange with a disguise request.
    pub fn write_disguise_request(&self, token: u32) -> TransportResult<()> {
        let mut writer = self.tcp_writer.lock();
        let writer = writer.as_mut().ok_or(TransportError::Disposed)?;
        disguise::write_request(writer, token)?;
        Ok(())
    }

    /// Client side: read the teapot response and return the assigned token.
    pub fn read_disguise_response(&self) -> TransportResult<u32> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }
        let mut reader = self.tcp_reader.lock();
        let reader = reader.as_mut().ok_or(TransportError::ReaderStarted)?;
        disguise::read_response(reader)
    }

    /// Send the 4-byte little-endian association token as one datagram.
    pub fn write_token(&self, token: u32) -> TransportResult<()> {
        self.send_datagram(&token.to_le_bytes())
    }

    // ---- readers ----

    /// Start the TCP reader. Later calls are no-ops; a reader never restarts.
    pub fn start_read_tcp(self: &Arc<Self>) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }
        let Some(reader) = self.tcp_reader.lock().take() else {
            return Ok(());
        };
        if let (Ok(local), Ok(remote)) = (self.tcp.local_addr(), self.tcp.peer_addr()) {
            let _ = self.tcp_endpoints.set((local, remote));
        }

        let this = self.clone();
        thread::Builder::new()
            .name(format!("relay-tcp-{}", self.core.short_session()))
            .spawn(move || this.read_tcp_loop(reader))?;
        Ok(())
    }

    /// Start the UDP reader. Later calls are no-ops.
    pub fn start_read_udp(self: &Arc<Self>) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }
        let udp = self.udp.clone().ok_or(TransportError::NoUdp)?;
        if self.udp_reading.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Ok(local) = udp.local_addr() {
            let _ = self.udp_local.set(local);
        }
        {
            let mut remote = self.udp_remote.write();
            if remote.is_none() {
                *remote = udp.peer_addr().ok().or_else(|| self.tcp.peer_addr().ok());
            }
        }

        let this = self.clone();
        thread::Builder::new()
            .name(format!("relay-udp-{}", self.core.short_session()))
            .spawn(move || this.read_udp_loop(udp))?;
        Ok(())
    }

    fn read_tcp_loop(self: Arc<Self>, mut reader: BufReader<TcpStream>) {
        let Err(err) = self.pump_tcp(&mut reader) else {
            return;
        };
        if !self.is_alive() {
            return;
        }
        if err.is_disconnect() {
            tracing::info!("[HybridConnection] peer closed {}: {}", self, err);
        } else {
            tracing::error!("[HybridConnection] tcp loop error: {}: {}", self, err);
        }
        self.dispose();
    }

    fn pump_tcp(&self, reader: &mut BufReader<TcpStream>) -> TransportResult<()> {
        while self.is_alive() {
            // an idle timeout is only harmless between messages
            match reader.fill_buf() {
                Ok([]) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            }
            let msg = self.codec.read(reader)?;
            if !self.codec.is_keep_alive(&msg) {
                self.core.receive(msg);
            }
        }
        Ok(())
    }

    fn read_udp_loop(self: Arc<Self>, udp: Arc<UdpSocket>) {
        let Err(err) = self.pump_udp(&udp) else {
            return;
        };
        if !self.is_alive() {
            return;
        }
        let reason = err.to_string();
        if !self.udp_errors.report(err, true) {
            tracing::error!("[HybridConnection] udp loop error: {}: {}", self, reason);
            self.dispose();
        }
    }

    fn pump_udp(&self, udp: &UdpSocket) -> TransportResult<()> {
        let mut buf = vec![0u8; self.config.max_datagram.max(1)];
        while self.is_alive() {
            let (len, src) = match udp.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            if !self.is_alive() {
                break;
            }
            if let Some(remote) = self.udp_remote()
                && remote != src
            {
                warn_throttled!(LOG_THROTTLE, "[HybridConnection] dropping datagram from {} on {}", src, self);
                continue;
            }
            let msg = self.codec.read(&mut &buf[..len])?;
            if !self.codec.is_keep_alive(&msg) {
                self.core.receive(msg);
            }
        }
        Ok(())
    }

    // ---- send path ----

    fn send_datagram(&self, raw: &[u8]) -> TransportResult<()> {
        let udp = self.udp.as_ref().ok_or(TransportError::NoUdp)?;
        // a socket shared with other connections has no fixed peer
        if self.udp_reading.load(Ordering::Acquire) && udp.peer_addr().is_ok() {
            udp.send(raw)?;
        } else if let Some(remote) = self.udp_remote() {
            udp.send_to(raw, remote)?;
        } else {
            return Err(TransportError::NoUdpEndpoint);
        }
        Ok(())
    }

    fn report_udp_send_error(&self, err: TransportError) {
        let reason = err.to_string();
        if !self.udp_errors.report(err, false) {
            error_throttled!(LOG_THROTTLE, "[HybridConnection] udp send failure: {}: {}", self, reason);
        }
    }

    // ---- udp error hub ----

    /// Subscribe to UDP failures. The last recorded failure, if any, is
    /// delivered immediately.
    pub fn on_udp_error(
        &self,
        handler: impl Fn(&TransportError, bool) + Send + Sync + 'static,
    ) -> UdpErrorSubscription {
        let handler: UdpErrorHandler = Arc::new(handler);
        self.udp_errors.subscribe(handler)
    }

    pub fn remove_udp_error(&self, sub: UdpErrorSubscription) -> bool {
        self.udp_errors.unsubscribe(sub)
    }

    pub fn last_udp_error(&self) -> Option<Arc<TransportError>> {
        self.udp_errors.last()
    }
}

impl<C: Codec> Connection for HybridConnection<C> {
    type Message = C::Message;

    fn core(&self) -> &ConnectionCore<C::Message> {
        &self.core
    }

    fn id(&self) -> String {
        let kind = if self.udp.is_some() { "TCP/UDP" } else { "TCPonly" };
        match self.tcp.peer_addr() {
            Ok(remote) => format!("{kind} {remote}"),
            Err(_) => format!("{kind} ?{}", self.core.short_session()),
        }
    }

    fn is_connected(&self) -> bool {
        self.is_alive() && self.tcp.peer_addr().is_ok()
    }

    fn queue_for(&self, msg: &C::Message) -> Arc<SendQueue<C::Message>> {
        if self.send_via_udp(msg) {
            self.unreliable.clone()
        } else {
            self.reliable.clone()
        }
    }

    fn keep_alive_message(&self) -> Option<C::Message> {
        self.codec.keep_alive()
    }

    fn send_raw(&self, msg: &C::Message) -> TransportResult<()> {
        if !self.is_alive() {
            return Err(TransportError::Disposed);
        }

        let mut buf = self.buffers.checkout(self.core.alive_flag(), self.core.dispose_lock());
        let len = self.codec.write(&mut *buf, msg)?;
        let raw = &buf[..len.min(buf.len())];

        if self.send_via_udp(msg) {
            // lost updates are tolerable, a broken UDP path is not fatal
            if let Err(err) = self.send_datagram(raw) {
                self.report_udp_send_error(err);
            }
            return Ok(());
        }

        let mut writer = self.tcp_writer.lock();
        let writer = writer.as_mut().ok_or(TransportError::Disposed)?;
        writer.write_all(raw)?;
        Ok(())
    }

    fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        let id = self.id();
        tracing::debug!("[HybridConnection] disposing {}", self);

        let _ = self.tcp.set_read_timeout(None);
        let _ = self.tcp.shutdown(Shutdown::Both);
        drop(self.tcp_writer.lock().take());
        drop(self.tcp_reader.lock().take());

        // a UDP socket without our reader may be shared with other connections
        if self.udp_reading.load(Ordering::Acquire)
            && let Some(udp) = self.udp.as_ref()
        {
            let _ = SockRef::from(udp.as_ref()).shutdown(Shutdown::Both);
        }

        self.buffers.drain();
        self.core.finish_dispose(&id);
    }
}

impl<C: Codec> Drop for HybridConnection<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: Codec> fmt::Display for HybridConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ep = |a: Option<SocketAddr>| a.map_or_else(|| "???".to_string(), |a| a.to_string());
        let tcp = self.tcp_endpoints();
        write!(
            f,
            "HybridConnection {} <-> {}",
            ep(tcp.map(|t| t.0)),
            ep(tcp.map(|t| t.1))
        )?;
        if let Some(remote) = self.udp_remote() {
            write!(f, " / {} <-> {}", ep(self.udp_local.get().copied()), remote)?;
        }
        Ok(())
    }
}

fn open_udp(peer: SocketAddr, config: &TransportConfig) -> io::Result<UdpSocket> {
    let any: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&any.into())?;
    socket.connect(&peer.into())?;
    socket.set_write_timeout(config.send_timeout())?;
    socket.set_read_timeout(config.recv_timeout())?;
    Ok(socket.into())
}
