use crate::sessions::{RelayConn, Sessions};
use anyhow::Context;
use relaycore::prelude::*;
use relaycore::warn_throttled;
use std::io;
use std::net::{TcpListener, UdpSocket};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const ACCEPT_NAP: Duration = Duration::from_millis(10);

/// Accepts TCP peers, runs the disguise handshake and echoes whatever they send.
#[derive(Debug)]
pub struct AcceptorRole {
    pub listener: TcpListener,
    pub udp: Arc<UdpSocket>,
    pub transport: TransportConfig,
    pub sessions: Arc<Sessions>,
}

impl ThreadRole for AcceptorRole {
    fn name(&self) -> &str {
        "acceptor"
    }

    fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
        let listener = self.listener.try_clone().context("clone listener")?;
        listener.set_nonblocking(true)?;
        Ok(Arc::new(AcceptorWorker {
            listener,
            udp: self.udp.clone(),
            transport: self.transport.clone(),
            sessions: self.sessions.clone(),
            meter: ctx.meter(),
        }))
    }
}

pub struct AcceptorWorker {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    transport: TransportConfig,
    sessions: Arc<Sessions>,
    meter: ActivityMeter,
}

impl AcceptorWorker {
    fn admit(&self, tcp: std::net::TcpStream) -> TransportResult<()> {
        tcp.set_nonblocking(false)?;
        let conn = RelayConn::from_sockets(
            tcp,
            Some(self.udp.clone()),
            FrameCodec::default(),
            self.transport.clone(),
        )?;

        conn.read_disguise()?;
        let token = self.sessions.register(conn.clone());
        conn.write_disguise(token)?;

        let echo: Weak<RelayConn> = Arc::downgrade(&conn);
        conn.on_receive(move |frame: Frame| {
            if let Some(conn) = echo.upgrade()
                && let Err(err) = conn.send(frame)
            {
                tracing::warn!("[Acceptor] echo to {} failed: {}", conn.id(), err);
            }
        });
        conn.start_read_tcp()?;
        tracing::info!("[Acceptor] {} joined with token {}", conn.id(), token);
        Ok(())
    }
}

impl RoleWorker for AcceptorWorker {
    fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        while !cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((tcp, peer)) => {
                    let _zone = self.meter.active();
                    if let Err(err) = self.admit(tcp) {
                        tracing::warn!("[Acceptor] rejected {}: {}", peer, err);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_NAP),
                Err(e) => return Err(e).context("accept failed"),
            }
        }
        Ok(())
    }

    fn activity_rate(&self) -> f32 {
        self.meter.rate()
    }
}

/// Drains the shared server UDP socket: association tokens bind a peer
/// address to its connection, everything else is a frame for that connection.
#[derive(Debug)]
pub struct DatagramRole {
    pub udp: Arc<UdpSocket>,
    pub max_datagram: usize,
    pub sessions: Arc<Sessions>,
}

impl ThreadRole for DatagramRole {
    fn name(&self) -> &str {
        "datagram"
    }

    fn create_worker(&self, ctx: &WorkerCtx) -> anyhow::Result<Arc<dyn RoleWorker>> {
        Ok(Arc::new(DatagramWorker {
            udp: self.udp.clone(),
            max_datagram: self.max_datagram,
            sessions: self.sessions.clone(),
            meter: ctx.meter(),
        }))
    }
}

pub struct DatagramWorker {
    udp: Arc<UdpSocket>,
    max_datagram: usize,
    sessions: Arc<Sessions>,
    meter: ActivityMeter,
}

impl RoleWorker for DatagramWorker {
    fn run(&self, cancel: &CancelToken) -> anyhow::Result<()> {
        let codec = FrameCodec::default();
        let mut buf = vec![0u8; self.max_datagram.max(4)];

        while !cancel.is_cancelled() {
            let (len, src) = match self.udp.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e).context("udp receive failed"),
            };
            let _zone = self.meter.active();

            if len == 4 {
                let token = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                if self.sessions.associate(token, src) {
                    tracing::info!("[Datagram] token {} associated with {}", token, src);
                }
                continue;
            }

            let Some(conn) = self.sessions.by_udp(&src) else {
                warn_throttled!(Duration::from_secs(5), "[Datagram] unknown peer {}", src);
                continue;
            };
            match codec.read(&mut &buf[..len]) {
                Ok(frame) if codec.is_keep_alive(&frame) => {}
                Ok(frame) => conn.core().receive(frame),
                Err(err) => tracing::warn!("[Datagram] bad frame from {}: {}", src, err),
            }
        }
        Ok(())
    }

    fn activity_rate(&self) -> f32 {
        self.meter.rate()
    }
}
