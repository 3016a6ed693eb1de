mod roles;
mod sessions;

use crate::roles::{AcceptorRole, DatagramRole};
use crate::sessions::Sessions;
use anyhow::Context;
use relaycore::prelude::*;
use relaycore::utils::params_io::take_from_args;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BIND: &str = "127.0.0.1:7777";
const STATS_EVERY: Duration = Duration::from_secs(10);

pub fn main() -> anyhow::Result<()> {
    // relay-demo [config file], overridable with RELAY__... variables
    let files: Vec<String> = take_from_args(1).into_iter().collect();
    let cfg = RelayConfig::load(files, Some("RELAY"))?;
    let _log_guard = cfg.logger.init()?;

    let bind = cfg.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string());
    let listener = TcpListener::bind(&bind).with_context(|| format!("bind tcp {bind}"))?;
    let addr = listener.local_addr()?;
    let udp = UdpSocket::bind(addr).with_context(|| format!("bind udp {addr}"))?;
    udp.set_read_timeout(Some(Duration::from_millis(250)))?;
    let udp = Arc::new(udp);

    let pool = ThreadPool::new(cfg.pool.clone())?;
    if pool.thread_count() < 2 {
        anyhow::bail!("the relay needs at least two pool threads");
    }

    let sessions = Sessions::new();
    let acceptor: Arc<dyn ThreadRole> = Arc::new(AcceptorRole {
        listener,
        udp: udp.clone(),
        transport: cfg.transport.clone(),
        sessions: sessions.clone(),
    });
    let datagrams: Arc<dyn ThreadRole> = Arc::new(DatagramRole {
        udp,
        max_datagram: cfg.transport.max_datagram,
        sessions: sessions.clone(),
    });
    pool.add_role(acceptor.clone())?;
    pool.add_role(datagrams.clone())?;

    pool.thread(0).context("thread 0")?.set_role(acceptor)?;
    pool.thread(1).context("thread 1")?.set_role(datagrams)?;
    tracing::info!("relay listening on {} (tcp + udp)", addr);

    let stop = CancelToken::new_root();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.cancel();
        })
        .context("failed to register termination handler")?;
    }

    while stop.sleep_cancellable(STATS_EVERY) {
        let stats = pool.stats();
        tracing::info!(
            "sessions: {}, pool: {}",
            sessions.len(),
            serde_json::to_string(&stats).unwrap_or_default()
        );
    }

    tracing::info!("shutting down");
    sessions.dispose_all();
    pool.dispose();
    Ok(())
}
