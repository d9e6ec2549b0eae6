//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for a [`SyncServer`](crate::server::SyncServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Plaintext port (default 8080).
    pub http_port: u16,
    /// TLS port (default 8443), selected when key and cert are both set.
    pub https_port: u16,
    /// TLS key path. Termination itself happens at the fronting listener;
    /// the paths and port selection are carried here for deployment wiring.
    pub https_key: Option<PathBuf>,
    /// TLS certificate path.
    pub https_cert: Option<PathBuf>,
    /// Heartbeat tick. A connection that misses two consecutive ticks is
    /// terminated.
    pub heartbeat_interval: Duration,
    /// Token-bucket capacity per connection.
    pub rate_capacity: u32,
    /// Token-bucket refill, tokens per second.
    pub rate_refill_per_sec: f64,
    /// Outbound frames buffered per connection before the subscriber is
    /// dropped as a slow consumer.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            https_port: 8443,
            https_key: None,
            https_cert: None,
            heartbeat_interval: Duration::from_secs(30),
            rate_capacity: 100,
            rate_refill_per_sec: 25.0,
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    /// Config for tests: loopback, ephemeral port, fast heartbeat, small
    /// queues.
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 0,
            heartbeat_interval: Duration::from_millis(150),
            outbound_queue: 64,
            ..Self::default()
        }
    }

    /// Whether TLS material is configured.
    pub fn tls_enabled(&self) -> bool {
        self.https_key.is_some() && self.https_cert.is_some()
    }

    /// The port actually served, per TLS configuration.
    pub fn port(&self) -> u16 {
        if self.tls_enabled() {
            self.https_port
        } else {
            self.http_port
        }
    }

    /// `host:port` string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    pub fn with_tls(mut self, key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        self.https_key = Some(key.into());
        self.https_cert = Some(cert.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rate_bucket(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.rate_capacity = capacity;
        self.rate_refill_per_sec = refill_per_sec;
        self
    }
}
