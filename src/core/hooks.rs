//! Hook traits for extensibility
//!
//! Defines the extension points the connection handler calls into: traffic
//! accounting and upstream dialing.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};

use super::address::Destination;

/// User ID type used throughout the system.
/// Using i64 for consistency with the storage layer.
pub type UserId = i64;

/// Statistics collector trait for traffic tracking of one instance
pub trait StatsCollector: Send + Sync {
    /// Record an accepted connection
    fn record_request(&self);
    /// Record upload bytes (client -> remote)
    fn record_upload(&self, bytes: u64);
    /// Record download bytes (remote -> client)
    fn record_download(&self, bytes: u64);
}

/// Upstream connection establishment
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a TCP connection to `dest`
    async fn dial(&self, dest: &Destination) -> io::Result<TcpStream>;
}

/// Direct dialer - resolves and connects from this host
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
    nodelay: bool,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration, nodelay: bool) -> Self {
        Self {
            connect_timeout,
            nodelay,
        }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), true)
    }
}

/// Try every resolved address in order
async fn connect_any(dest: &Destination) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host((dest.address.as_str(), dest.port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, dest: &Destination) -> io::Result<TcpStream> {
        if dest.address.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty destination host",
            ));
        }

        let stream = tokio::time::timeout(self.connect_timeout, connect_any(dest))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }
}
