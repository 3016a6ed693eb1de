use parking_lot::RwLock;
use relaycore::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub type RelayConn = HybridConnection<FrameCodec>;

/// Live connections, by handshake token and, once associated, by the peer's
/// datagram address.
pub struct Sessions {
    next_token: AtomicU32,
    by_token: RwLock<HashMap<u32, Arc<RelayConn>>>,
    by_udp: RwLock<HashMap<SocketAddr, Arc<RelayConn>>>,
}

impl Sessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_token: AtomicU32::new(1),
            by_token: RwLock::new(HashMap::new()),
            by_udp: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>, conn: Arc<RelayConn>) -> u32 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.by_token.write().insert(token, conn.clone());

        let sessions = Arc::downgrade(self);
        conn.on_disconnect(move |id| {
            if let Some(sessions) = sessions.upgrade() {
                sessions.forget(token);
                tracing::info!("[Sessions] {} left", id);
            }
        });
        token
    }

    /// Bind `addr` to the connection that handed out `token`.
    pub fn associate(&self, token: u32, addr: SocketAddr) -> bool {
        let Some(conn) = self.by_token.read().get(&token).cloned() else {
            return false;
        };
        conn.set_udp_remote(addr);
        self.by_udp.write().insert(addr, conn);
        true
    }

    pub fn by_udp(&self, addr: &SocketAddr) -> Option<Arc<RelayConn>> {
        self.by_udp.read().get(addr).cloned()
    }

    fn forget(&self, token: u32) {
        if let Some(conn) = self.by_token.write().remove(&token)
            && let Some(addr) = conn.udp_remote()
        {
            self.by_udp.write().remove(&addr);
        }
    }

    pub fn len(&self) -> usize {
        self.by_token.read().len()
    }

    pub fn dispose_all(&self) {
        let conns: Vec<_> = self.by_token.read().values().cloned().collect();
        for conn in conns {
            conn.dispose();
        }
    }
}

impl fmt::Debug for Sessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sessions").field("live", &self.len()).finish()
    }
}
