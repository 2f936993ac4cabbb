//! Server instance: one listener bound to one port and protocol
//!
//! `start()` binds and spawns the accept loop, `stop()` closes the listener.
//! Connections already handed to a handler task keep running after `stop()`
//! until they end on their own or are kicked.

use chrono::{DateTime, Utc};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionManager;
use super::handler::{ConnectionHandler, InboundProtocol};
use super::hooks::{DirectDialer, Dialer};
use super::stats::InstanceStats;
use super::tls::build_acceptor;
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::settings::{Protocol, ProxySettings, TlsSettings};

/// TCP keepalive interval, dead peers are detected in ~45s (3 probes x 15s)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Pause after a transient accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Running accept loop
struct AcceptTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One proxy listener
pub struct ServerInstance {
    port: u16,
    protocol: Protocol,
    tls: Option<TlsSettings>,
    conn_config: ConnConfig,
    stats: Arc<InstanceStats>,
    conn_manager: ConnectionManager,
    handler: ConnectionHandler,
    expire_at: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<AcceptTask>>,
}

impl ServerInstance {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn stats(&self) -> &Arc<InstanceStats> {
        &self.stats
    }

    pub fn expire_at(&self) -> Option<DateTime<Utc>> {
        self.expire_at
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.conn_manager.connection_count()
    }

    /// Cancel every in-flight relay of this instance
    pub fn kick_connections(&self) -> usize {
        self.conn_manager.kick_all()
    }

    /// Wait up to `timeout` for in-flight connections to finish, returns
    /// how many are still open
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open = self.conn_manager.connection_count();
            if open == 0 || tokio::time::Instant::now() >= deadline {
                return open;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() && self.is_running() {
            return Err(ProxyError::AlreadyRunning);
        }

        let acceptor = match &self.tls {
            Some(tls) => Some(build_acceptor(&tls.cert_file, &tls.key_file)?),
            None => None,
        };
        let listener = self.bind().map_err(|source| ProxyError::Listener {
            port: self.port,
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        self.running.store(true, Ordering::Release);

        let handle = tokio::spawn(accept_loop(AcceptLoop {
            listener,
            acceptor,
            handler: self.handler.clone(),
            conn_config: self.conn_config.clone(),
            stats: Arc::clone(&self.stats),
            expire_at: self.expire_at,
            cancel: cancel.clone(),
            running: Arc::clone(&self.running),
        }));
        *task = Some(AcceptTask { cancel, handle });

        log::info!(
            address = %local_addr,
            protocol = %self.protocol,
            tls = self.tls.is_some(),
            "Server started"
        );
        Ok(())
    }

    /// Close the listener; in-flight connections drain on their own
    pub async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let accept = task.take().ok_or(ProxyError::NotRunning)?;

        accept.cancel.cancel();
        // The listener is dropped when the loop returns
        if let Err(e) = accept.handle.await {
            log::warn!(port = self.port, error = %e, "Accept loop ended abnormally");
        }
        self.running.store(false, Ordering::Release);

        log::info!(
            port = self.port,
            protocol = %self.protocol,
            active = self.conn_manager.connection_count(),
            oldest = ?self.conn_manager.oldest_age(),
            "Server stopped"
        );
        Ok(())
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let ip: IpAddr = self.conn_config.listen_host.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen host: {}", self.conn_config.listen_host),
            )
        })?;
        let socket_addr = SocketAddr::new(ip, self.port);

        let socket = socket2::Socket::new(
            match socket_addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(self.conn_config.tcp_backlog)?;

        TcpListener::from_std(socket.into())
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(accept) = self.task.get_mut().take() {
            accept.cancel.cancel();
        }
    }
}

/// Builder for constructing a ServerInstance
#[derive(Default)]
pub struct ServerBuilder {
    port: Option<u16>,
    settings: Option<ProxySettings>,
    conn_config: Option<ConnConfig>,
    stats: Option<Arc<InstanceStats>>,
    dialer: Option<Arc<dyn Dialer>>,
    expire_at: Option<DateTime<Utc>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn settings(mut self, settings: ProxySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Share counters, e.g. carried over from a previous instance
    pub fn stats(mut self, stats: Arc<InstanceStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn expire_at(mut self, expire_at: Option<DateTime<Utc>>) -> Self {
        self.expire_at = expire_at;
        self
    }

    /// Build the instance, validating its settings
    pub fn build(self) -> Result<ServerInstance> {
        let port = match self.port {
            Some(port) if port != 0 => port,
            _ => return Err(ProxyError::InvalidSettings("port must be 1-65535".into())),
        };
        let settings = self
            .settings
            .ok_or_else(|| ProxyError::InvalidSettings("settings are required".into()))?;
        let protocol = InboundProtocol::from_settings(&settings)?;

        let conn_config = self.conn_config.unwrap_or_default();
        let stats = self.stats.unwrap_or_default();
        let dialer = self.dialer.unwrap_or_else(|| {
            Arc::new(DirectDialer::new(
                conn_config.connect_timeout,
                conn_config.tcp_nodelay,
            ))
        });
        let conn_manager = ConnectionManager::new();
        let handler = ConnectionHandler::new(
            Arc::new(protocol),
            conn_config.clone(),
            Arc::clone(&stats),
            conn_manager.clone(),
            dialer,
        );

        Ok(ServerInstance {
            port,
            protocol: settings.protocol(),
            tls: settings.tls().cloned(),
            conn_config,
            stats,
            conn_manager,
            handler,
            expire_at: self.expire_at,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }
}

struct AcceptLoop {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: ConnectionHandler,
    conn_config: ConnConfig,
    stats: Arc<InstanceStats>,
    expire_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    // EMFILE / ENFILE clear up once connections close
    if matches!(e.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    )
}

async fn accept_loop(ctx: AcceptLoop) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = ctx.listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if ctx.expire_at.is_some_and(|at| Utc::now() >= at) {
                    log::debug!(peer = %peer_addr, "Instance expired, refusing connection");
                    continue;
                }
                ctx.stats.touch();
                log::connection(&peer_addr.to_string(), "new");

                let handler = ctx.handler.clone();
                let acceptor = ctx.acceptor.clone();
                let conn_config = ctx.conn_config.clone();
                tokio::spawn(async move {
                    serve_connection(stream, peer_addr, acceptor, handler, &conn_config).await;
                    log::connection(&peer_addr.to_string(), "closed");
                });
            }
            Err(e) if is_transient_accept_error(&e) => {
                log::warn!(error = %e, "Failed to accept connection, retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                log::error!(error = %e, "Listener failed, accept loop exiting");
                break;
            }
        }
    }
    ctx.running.store(false, Ordering::Release);
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: ConnectionHandler,
    conn_config: &ConnConfig,
) {
    if conn_config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    // Detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    let Some(acceptor) = acceptor else {
        handler.handle(stream, peer_addr).await;
        return;
    };

    match tokio::time::timeout(conn_config.tls_handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => {
            log::debug!(peer = %peer_addr, "TLS handshake successful");
            handler.handle(tls_stream, peer_addr).await;
        }
        Ok(Err(e)) => {
            log::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
        }
        Err(_) => {
            log::debug!(peer = %peer_addr, "TLS handshake timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DokodemoSettings, TrojanSettings};
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_conn_config() -> ConnConfig {
        ConnConfig {
            listen_host: "127.0.0.1".to_string(),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            tcp_backlog: 128,
            tcp_nodelay: true,
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        port
    }

    fn dokodemo(target_port: u16) -> ProxySettings {
        ProxySettings::Dokodemo(DokodemoSettings {
            target_addr: "127.0.0.1".to_string(),
            target_port,
            network: "tcp".to_string(),
            timeout: 0,
        })
    }

    fn instance(port: u16, settings: ProxySettings) -> ServerInstance {
        ServerInstance::builder()
            .port(port)
            .settings(settings)
            .conn_config(test_conn_config())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let port = free_port().await;
        let server = instance(port, dokodemo(9));

        assert!(!server.is_running());
        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(matches!(
            server.start().await,
            Err(ProxyError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.stop().await, Err(ProxyError::NotRunning)));

        // The port is free again once stop returns
        let rebound = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listener_error() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let server = instance(port, dokodemo(9));
        match server.start().await {
            Err(ProxyError::Listener { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected listener error, got {:?}", other.err()),
        }
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_drains_inflight_connections() {
        let target = echo_server().await;
        let port = free_port().await;
        let server = instance(port, dokodemo(target));
        server.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert!(server.stats().last_active_at().is_some());

        server.stop().await.unwrap();

        // Still relaying after the listener is gone
        client.write_all(b"two").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        assert_eq!(server.kick_connections(), 1);
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.drain(Duration::from_secs(2)).await, 0);
        // both directions were billed once the relay ended
        let counted = server.stats().peek();
        assert_eq!((counted.upload, counted.download), (6, 6));
    }

    #[tokio::test]
    async fn test_expired_instance_refuses_connections() {
        let target = echo_server().await;
        let port = free_port().await;
        let server = ServerInstance::builder()
            .port(port)
            .settings(dokodemo(target))
            .conn_config(test_conn_config())
            .expire_at(Some(Utc::now() - chrono::Duration::seconds(1)))
            .build()
            .unwrap();
        server.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = client.write_all(b"hello").await;
        let mut buf = [0u8; 5];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(server.stats().last_active_at().is_none());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_start_with_bad_material_fails() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a cert").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();

        let settings = ProxySettings::Trojan(TrojanSettings {
            password: "pw".to_string(),
            network: "tcp".to_string(),
            host: String::new(),
            path: String::new(),
            tls: true,
            tls_settings: Some(TlsSettings {
                cert_file: cert.path().to_path_buf(),
                key_file: key.path().to_path_buf(),
                server_name: String::new(),
                allow_insecure: false,
            }),
        });
        let server = instance(free_port().await, settings);
        assert!(matches!(server.start().await, Err(ProxyError::Tls(_))));
        assert!(!server.is_running());
    }

    #[test]
    fn test_builder_rejects_port_zero() {
        let result = ServerInstance::builder().port(0).settings(dokodemo(9)).build();
        assert!(matches!(result, Err(ProxyError::InvalidSettings(_))));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }
}
