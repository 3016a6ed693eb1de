use crate::utils::CorePickPolicy;
use crate::utils::logger::LoggerConfig;
use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[inline]
fn millis_opt(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Thread pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of pool threads; `None` or `0` means one per hardware thread.
    pub threads: Option<usize>,
    /// Number of sampling periods averaged into an activity rate.
    pub sample_window: usize,
    pub sample_period_ms: u64,
    pub core_policy: CorePickPolicy,
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: None,
            sample_window: 10,
            sample_period_ms: 100,
            core_policy: CorePickPolicy::None,
            thread_name_prefix: "relay-pool".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_threads(threads: usize, sample_window: usize) -> Self {
        Self {
            threads: Some(threads),
            sample_window,
            ..Self::default()
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.filter(|n| *n > 0).unwrap_or_else(num_cpus::get)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms.max(1))
    }
}

/// Per send queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SendQueueConfig {
    /// Bound of pending messages per queue; `None` is unbounded.
    pub capacity: Option<usize>,
    /// Silence after which a keep-alive queue emits a keep-alive message.
    pub keep_alive_interval_ms: u64,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            capacity: Some(1024),
            keep_alive_interval_ms: 1000,
        }
    }
}

impl SendQueueConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }
}

/// Socket settings of a hybrid connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `0` disables the timeout.
    pub send_timeout_ms: u64,
    /// `0` disables the timeout.
    pub recv_timeout_ms: u64,
    pub nodelay: bool,
    /// Largest datagram the unreliable reader accepts.
    pub max_datagram: usize,
    /// Initial capacity of pooled write buffers.
    pub buffer_capacity: usize,
    pub queue: SendQueueConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 3000,
            recv_timeout_ms: 3000,
            nodelay: true,
            max_datagram: 64 * 1024,
            buffer_capacity: 1024,
            queue: SendQueueConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn send_timeout(&self) -> Option<Duration> {
        millis_opt(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        millis_opt(self.recv_timeout_ms)
    }
}

/// Everything a relay process needs, as loaded from files and environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub logger: LoggerConfig,
    pub pool: PoolConfig,
    pub transport: TransportConfig,
    /// Address the acceptor binds TCP and UDP on.
    pub bind: Option<String>,
}

impl RelayConfig {
    /// Layer the given files, then `<prefix>__...` environment overrides.
    pub fn load<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        env_prefix: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        for path in paths {
            let path = path.as_ref();
            if path.exists() {
                builder = builder.add_source(File::from(path));
            } else {
                tracing::warn!("[RelayConfig] skipping missing config file {}", path.display());
            }
        }

        let env = match env_prefix {
            Some(prefix) => Environment::with_prefix(prefix),
            None => Environment::default(),
        };
        builder
            .add_source(env.separator("__"))
            .build()
            .context("failed to build relay configuration")?
            .try_deserialize()
            .context("failed to deserialize relay configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_disable() {
        let cfg = TransportConfig {
            send_timeout_ms: 0,
            ..TransportConfig::default()
        };
        assert_eq!(cfg.send_timeout(), None);
        assert_eq!(cfg.recv_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn pool_threads_fall_back_to_cpus() {
        let cfg = PoolConfig {
            threads: Some(0),
            ..PoolConfig::default()
        };
        assert_eq!(cfg.thread_count(), num_cpus::get());
        assert_eq!(PoolConfig::with_threads(4, 10).thread_count(), 4);
    }

    #[test]
    fn relay_config_partial_json() {
        let cfg: RelayConfig = serde_json::from_str(
            r#"{"pool":{"threads":2,"core_policy":"round_robin"},"transport":{"recv_timeout_ms":500}}"#,
        )
        .unwrap();
        assert_eq!(cfg.pool.thread_count(), 2);
        assert_eq!(cfg.pool.sample_window, 10);
        assert_eq!(cfg.pool.core_policy, CorePickPolicy::RoundRobin);
        assert_eq!(cfg.transport.recv_timeout(), Some(Duration::from_millis(500)));
        assert!(cfg.transport.nodelay);
        assert_eq!(cfg.logger.level, "info");
    }

    #[test]
    fn relay_config_loads_from_file() {
        let dir = std::env::temp_dir().join(format!("relaycore-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.json");
        std::fs::write(&path, r#"{"bind":"127.0.0.1:0","pool":{"threads":3}}"#).unwrap();

        let cfg = RelayConfig::load([&path], Some("RELAYCORE_TEST_UNUSED")).unwrap();
        assert_eq!(cfg.bind.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(cfg.pool.thread_count(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
