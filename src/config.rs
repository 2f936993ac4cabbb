//! Configuration module for the proxy node
//!
//! CLI argument parsing with environment variable support, plus the runtime
//! connection tuning handed to every server instance.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default data directory for state persistence
pub const DEFAULT_DATA_DIR: &str = "/var/lib/multiproxy-node";

/// Default relay buffer size (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// CLI arguments for the proxy node
///
/// Supports environment variables with X_MULTIPROXY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-protocol proxy node")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Data directory holding state.json (proxies and users)
    #[arg(long, env = "X_MULTIPROXY_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "X_MULTIPROXY_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Address every instance listener binds to
    #[arg(long, env = "X_MULTIPROXY_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Interval for flushing traffic counters to storage (default: 60s)
    #[arg(long, env = "X_MULTIPROXY_COLLECT_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub collect_interval: Duration,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "X_MULTIPROXY_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to the upstream target (default: 10s)
    #[arg(long, env = "X_MULTIPROXY_TCP_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Timeout for reading a protocol header (default: 10s)
    #[arg(long, env = "X_MULTIPROXY_REQUEST_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "X_MULTIPROXY_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Relay buffer size in bytes (default: 32KB)
    #[arg(long, env = "X_MULTIPROXY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "X_MULTIPROXY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "X_MULTIPROXY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.parse::<std::net::IpAddr>().is_err() {
            return Err(anyhow!("listen_host must be an IP address"));
        }
        if self.collect_interval.is_zero() {
            return Err(anyhow!("collect_interval must be greater than 0"));
        }
        if self.conn_idle_timeout.is_zero() {
            return Err(anyhow!("conn_idle_timeout must be greater than 0"));
        }
        if self.tcp_connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }
        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Address listeners bind to
    pub listen_host: String,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Header read timeout
    pub request_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            listen_host: cli.listen_host.clone(),
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            request_timeout: cli.request_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}
