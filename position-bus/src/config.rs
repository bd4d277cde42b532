//! Settings consumed by the server and the client session.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    error::{BusError, Result},
    message::IDENTITY_LEN,
};

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Attempts the reconnect machine makes before the session stops for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// Port to listen on. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Log every broadcast at debug level.
    pub debug_logs: bool,
    /// Broadcast workers draining the queue. One worker gives a strict global order.
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long a fresh connection may take to send its registration record.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            debug_logs: false,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Loopback server on an ephemeral port.
    pub fn local() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(BusError::configuration("worker pool needs at least one worker"));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::configuration("queue capacity must be positive"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BusError::configuration("handshake timeout must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Identity announced in the handshake and stamped on every update.
    pub identity: String,
    /// Fixed local source port; `None` lets the OS choose.
    pub local_port: Option<u16>,
    /// Log every foreign update at debug level.
    pub debug_logs: bool,
    /// Wait before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Wait between failed reconnect attempts.
    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, identity: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            identity: identity.into(),
            local_port: None,
            debug_logs: false,
            reconnect_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(BusError::configuration("identity cannot be empty"));
        }
        if self.identity.len() > IDENTITY_LEN {
            return Err(BusError::configuration(format!(
                "identity '{}' exceeds {IDENTITY_LEN} bytes",
                self.identity
            )));
        }
        if self.host.is_empty() {
            return Err(BusError::configuration("remote host cannot be empty"));
        }
        if self.port == 0 {
            return Err(BusError::configuration("remote port cannot be 0"));
        }
        Ok(())
    }
}
