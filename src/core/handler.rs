//! Connection handling logic
//!
//! One accepted (and, when configured, TLS-terminated) client stream is
//! driven through header decode, authentication, upstream dial and relay.
//! Errors never leave this module: they are logged and the stream is closed.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use super::address::Destination;
use super::auth::{verify_uuid, TrojanCredential, UserPass};
use super::cipher::CipherMethod;
use super::connection::ConnectionManager;
use super::hooks::{Dialer, StatsCollector};
use super::protocol::http::{self, HttpProxyRequest};
use super::protocol::socks::{
    self, PasswordRequest, Socks4Cmd, Socks4Reply, Socks4Request, Socks5Cmd, Socks5Reply,
    Socks5Request,
};
use super::protocol::{
    shadowsocks, DokodemoTarget, TrojanCmd, TrojanRequest, VMessCmd, VMessRequest,
    VLESS_VERSION, VMESS_VERSION,
};
use super::relay::{relay, RelayOptions};
use super::stats::InstanceStats;
use crate::config::ConnConfig;
use crate::error::{CodecError, ProxyError, Result};
use crate::logger::log;
use crate::settings::{ProxySettings, SocksAuthMode};

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    HeaderRead,
    Authenticated,
    UpstreamDialing,
    Relaying,
    Closed,
    Error,
}

/// Protocol behaviour of an instance with credentials pre-computed
#[derive(Debug, Clone)]
pub enum InboundProtocol {
    VMess { id: Uuid },
    VLess { id: Uuid },
    Trojan { credential: TrojanCredential },
    Shadowsocks { method: CipherMethod, key: Vec<u8> },
    Socks { auth: Option<UserPass> },
    Http { auth: Option<UserPass> },
    Dokodemo {
        target: DokodemoTarget,
        idle_timeout: Option<Duration>,
    },
}

impl InboundProtocol {
    /// Build from validated settings
    pub fn from_settings(settings: &ProxySettings) -> Result<Self> {
        settings.validate()?;
        let protocol = match settings {
            ProxySettings::Vmess(s) => InboundProtocol::VMess { id: s.id },
            ProxySettings::Vless(s) => InboundProtocol::VLess { id: s.id },
            ProxySettings::Trojan(s) => InboundProtocol::Trojan {
                credential: TrojanCredential::new(&s.password),
            },
            ProxySettings::Shadowsocks(s) => {
                let method: CipherMethod =
                    s.method.parse().map_err(ProxyError::InvalidSettings)?;
                InboundProtocol::Shadowsocks {
                    method,
                    key: method.derive_key(&s.password),
                }
            }
            ProxySettings::Socks(s) => InboundProtocol::Socks {
                auth: match s.auth {
                    SocksAuthMode::None => None,
                    SocksAuthMode::Password => Some(UserPass::new(
                        s.username.clone().unwrap_or_default(),
                        s.password.clone().unwrap_or_default(),
                    )),
                },
            },
            ProxySettings::Http(s) => InboundProtocol::Http {
                auth: match (&s.username, &s.password) {
                    (Some(u), Some(p)) => Some(UserPass::new(u.clone(), p.clone())),
                    _ => None,
                },
            },
            ProxySettings::Dokodemo(s) => InboundProtocol::Dokodemo {
                target: DokodemoTarget::new(s.target_addr.clone(), s.target_port),
                idle_timeout: (s.timeout > 0).then(|| Duration::from_secs(s.timeout)),
            },
        };
        Ok(protocol)
    }
}

/// Reply a protocol owes its client once the dial outcome is known
#[derive(Debug, Clone, Copy)]
enum DialReply {
    None,
    Socks5,
    Socks4 { port: u16, ip: [u8; 4] },
    HttpConnect,
    HttpForward,
}

/// Everything a connection task needs from its server instance
#[derive(Clone)]
pub struct ConnectionHandler {
    protocol: Arc<InboundProtocol>,
    conn_config: ConnConfig,
    stats: Arc<InstanceStats>,
    conn_manager: ConnectionManager,
    dialer: Arc<dyn Dialer>,
}

/// Per-connection state tracking
struct Session {
    peer: String,
    state: ConnState,
}

impl Session {
    fn advance(&mut self, next: ConnState) {
        log::trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Bound a header read by the request timeout
async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, CodecError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ProxyError::from),
        Err(_) => Err(ProxyError::Codec(CodecError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "header read timeout",
        )))),
    }
}

impl ConnectionHandler {
    pub fn new(
        protocol: Arc<InboundProtocol>,
        conn_config: ConnConfig,
        stats: Arc<InstanceStats>,
        conn_manager: ConnectionManager,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            protocol,
            conn_config,
            stats,
            conn_manager,
            dialer,
        }
    }

    /// Serve one client stream to completion
    pub async fn handle<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session {
            peer: peer_addr.to_string(),
            state: ConnState::Accepted,
        };

        match self.process(stream, &mut session).await {
            Ok(()) => session.advance(ConnState::Closed),
            Err(ProxyError::Auth) => {
                log::authentication(&session.peer, false);
                session.advance(ConnState::Error);
            }
            Err(e) => {
                log::debug!(peer = %session.peer, state = ?session.state, error = %e, "Connection failed");
                session.advance(ConnState::Error);
            }
        }
    }

    async fn process<S>(&self, mut stream: S, session: &mut Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.conn_config.request_timeout;

        match self.protocol.as_ref() {
            InboundProtocol::VMess { id } => {
                let request =
                    with_deadline(limit, VMessRequest::read_from(&mut stream, VMESS_VERSION))
                        .await?;
                self.finish_uuid(stream, session, request, id).await
            }
            InboundProtocol::VLess { id } => {
                let request =
                    with_deadline(limit, VMessRequest::read_from(&mut stream, VLESS_VERSION))
                        .await?;
                self.finish_uuid(stream, session, request, id).await
            }
            InboundProtocol::Trojan { credential } => {
                let request = with_deadline(limit, TrojanRequest::read_from(&mut stream)).await?;
                session.advance(ConnState::HeaderRead);
                if !credential.verify(&request.password) {
                    return Err(ProxyError::Auth);
                }
                self.authenticated(session);
                if request.cmd != TrojanCmd::Connect {
                    return Err(CodecError::Malformed("trojan UDP is not supported".into()).into());
                }
                self.connect_and_relay(
                    stream,
                    session,
                    request.destination,
                    DialReply::None,
                    Vec::new(),
                    None,
                )
                .await
            }
            InboundProtocol::Shadowsocks { method, key } => {
                let (stream, destination) =
                    with_deadline(limit, shadowsocks::accept(stream, *method, key)).await?;
                session.advance(ConnState::HeaderRead);
                // A wrong key garbles the header, so decoding it is the check
                self.authenticated(session);
                self.connect_and_relay(
                    stream,
                    session,
                    destination,
                    DialReply::None,
                    Vec::new(),
                    None,
                )
                .await
            }
            InboundProtocol::Socks { auth } => {
                let version = with_deadline(limit, async {
                    stream.read_u8().await.map_err(CodecError::from)
                })
                .await?;
                match version {
                    socks::SOCKS5_VERSION => self.socks5(stream, session, auth.as_ref()).await,
                    socks::SOCKS4_VERSION => self.socks4(stream, session, auth.as_ref()).await,
                    other => Err(CodecError::UnsupportedVersion(other).into()),
                }
            }
            InboundProtocol::Http { auth } => {
                let request = with_deadline(limit, HttpProxyRequest::read_from(&mut stream)).await?;
                session.advance(ConnState::HeaderRead);
                if let Some(expected) = auth {
                    let ok = request
                        .basic_auth
                        .as_ref()
                        .is_some_and(|(u, p)| expected.verify(u.as_bytes(), p.as_bytes()));
                    if !ok {
                        let _ = stream.write_all(http::PROXY_AUTH_REQUIRED).await;
                        return Err(ProxyError::Auth);
                    }
                }
                self.authenticated(session);

                let HttpProxyRequest {
                    destination,
                    forward_head,
                    leftover,
                    ..
                } = request;
                let (reply, early) = match forward_head {
                    None => (DialReply::HttpConnect, leftover),
                    Some(mut head) => {
                        head.extend_from_slice(&leftover);
                        (DialReply::HttpForward, head)
                    }
                };
                self.connect_and_relay(stream, session, destination, reply, early, None)
                    .await
            }
            InboundProtocol::Dokodemo {
                target,
                idle_timeout,
            } => {
                session.advance(ConnState::HeaderRead);
                self.authenticated(session);
                self.connect_and_relay(
                    stream,
                    session,
                    target.decode(),
                    DialReply::None,
                    Vec::new(),
                    *idle_timeout,
                )
                .await
            }
        }
    }

    fn authenticated(&self, session: &mut Session) {
        log::authentication(&session.peer, true);
        session.advance(ConnState::Authenticated);
        self.stats.record_request();
    }

    async fn finish_uuid<S>(
        &self,
        stream: S,
        session: &mut Session,
        request: VMessRequest,
        id: &Uuid,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        session.advance(ConnState::HeaderRead);
        if !verify_uuid(&request.user_id, id) {
            return Err(ProxyError::Auth);
        }
        self.authenticated(session);
        if request.command != VMessCmd::Tcp {
            return Err(CodecError::Malformed("UDP command is not supported".into()).into());
        }
        self.connect_and_relay(
            stream,
            session,
            request.destination,
            DialReply::None,
            Vec::new(),
            None,
        )
        .await
    }

    async fn socks5<S>(
        &self,
        mut stream: S,
        session: &mut Session,
        auth: Option<&UserPass>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.conn_config.request_timeout;
        let methods = with_deadline(limit, socks::read_methods_after_version(&mut stream)).await?;
        let wanted = if auth.is_some() {
            socks::AUTH_PASSWORD
        } else {
            socks::AUTH_NONE
        };
        if !methods.contains(&wanted) {
            let _ = stream
                .write_all(&socks::encode_method_reply(socks::AUTH_NO_ACCEPTABLE))
                .await;
            return Err(ProxyError::Auth);
        }
        stream.write_all(&socks::encode_method_reply(wanted)).await?;

        if let Some(expected) = auth {
            let credentials = with_deadline(limit, PasswordRequest::read_from(&mut stream)).await?;
            let ok = expected.verify(&credentials.username, &credentials.password);
            stream.write_all(&socks::encode_password_reply(ok)).await?;
            if !ok {
                return Err(ProxyError::Auth);
            }
        }

        let request = match with_deadline(limit, Socks5Request::read_from(&mut stream)).await {
            Ok(request) => request,
            Err(e) => {
                if let ProxyError::Codec(codec) = &e {
                    if let Some(code) = socks::reply_code_for(codec) {
                        let _ = stream.write_all(&Socks5Reply::failure(code).encode()).await;
                    }
                }
                return Err(e);
            }
        };
        session.advance(ConnState::HeaderRead);
        self.authenticated(session);

        if request.cmd != Socks5Cmd::Connect {
            let reply = Socks5Reply::failure(socks::REPLY_COMMAND_NOT_SUPPORTED);
            let _ = stream.write_all(&reply.encode()).await;
            return Err(CodecError::Malformed(format!("unsupported SOCKS5 command {:?}", request.cmd)).into());
        }

        self.connect_and_relay(
            stream,
            session,
            request.destination,
            DialReply::Socks5,
            Vec::new(),
            None,
        )
        .await
    }

    async fn socks4<S>(
        &self,
        mut stream: S,
        session: &mut Session,
        auth: Option<&UserPass>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.conn_config.request_timeout;
        let request = with_deadline(limit, Socks4Request::read_after_version(&mut stream)).await?;
        session.advance(ConnState::HeaderRead);

        let port = request.destination.port;
        let ip = request
            .destination
            .address
            .parse::<Ipv4Addr>()
            .map(|ip| ip.octets())
            .unwrap_or([0; 4]);

        // SOCKS4 has no password exchange
        if auth.is_some() {
            let _ = stream.write_all(&Socks4Reply::rejected(port, ip).encode()).await;
            return Err(ProxyError::Auth);
        }
        self.authenticated(session);

        if request.cmd != Socks4Cmd::Connect {
            let _ = stream.write_all(&Socks4Reply::rejected(port, ip).encode()).await;
            return Err(CodecError::Malformed("SOCKS4 BIND is not supported".into()).into());
        }

        self.connect_and_relay(
            stream,
            session,
            request.destination,
            DialReply::Socks4 { port, ip },
            Vec::new(),
            None,
        )
        .await
    }

    async fn write_failure_reply<S>(stream: &mut S, reply: DialReply)
    where
        S: AsyncWrite + Unpin,
    {
        let bytes: Vec<u8> = match reply {
            DialReply::None => return,
            DialReply::Socks5 => Socks5Reply::failure(socks::REPLY_GENERAL_FAILURE).encode(),
            DialReply::Socks4 { port, ip } => Socks4Reply::rejected(port, ip).encode().to_vec(),
            DialReply::HttpConnect | DialReply::HttpForward => http::BAD_GATEWAY.to_vec(),
        };
        let _ = stream.write_all(&bytes).await;
        let _ = stream.flush().await;
    }

    async fn write_success_reply<S>(
        stream: &mut S,
        reply: DialReply,
        upstream: &TcpStream,
    ) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match reply {
            DialReply::None | DialReply::HttpForward => Ok(()),
            DialReply::Socks5 => {
                let bound = upstream
                    .local_addr()
                    .map(|a| Destination::new(a.ip().to_string(), a.port()))
                    .unwrap_or_else(|_| Destination::new("0.0.0.0", 0));
                stream.write_all(&Socks5Reply::success(bound).encode()).await
            }
            DialReply::Socks4 { port, ip } => {
                stream.write_all(&Socks4Reply::granted(port, ip).encode()).await
            }
            DialReply::HttpConnect => stream.write_all(http::CONNECT_ESTABLISHED).await,
        }
    }

    /// Dial `destination`, answer the client, then relay until either side ends
    async fn connect_and_relay<S>(
        &self,
        mut stream: S,
        session: &mut Session,
        destination: Destination,
        reply: DialReply,
        early_data: Vec<u8>,
        idle_override: Option<Duration>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Register connection for tracking and kick-off capability
        let (conn_id, cancel_token) = self.conn_manager.register(session.peer.clone());
        let _guard = scopeguard::guard((), |_| {
            self.conn_manager.unregister(conn_id);
        });

        session.advance(ConnState::UpstreamDialing);
        let mut upstream = match self.dialer.dial(&destination).await {
            Ok(upstream) => upstream,
            Err(e) => {
                Self::write_failure_reply(&mut stream, reply).await;
                return Err(ProxyError::Dial(format!("{}: {}", destination, e)));
            }
        };

        Self::write_success_reply(&mut stream, reply, &upstream).await?;

        if !early_data.is_empty() {
            upstream.write_all(&early_data).await?;
            self.stats.record_upload(early_data.len() as u64);
        }

        session.advance(ConnState::Relaying);
        log::debug!(peer = %session.peer, dest = %destination, conn_id = conn_id, "Relaying");

        let options = RelayOptions {
            buffer_size: self.conn_config.buffer_size,
            idle_timeout: idle_override.unwrap_or(self.conn_config.idle_timeout),
        };
        let result = relay(stream, upstream, options, &cancel_token).await;

        self.stats.record_upload(result.client_to_upstream);
        self.stats.record_download(result.upstream_to_client);

        log::debug!(
            peer = %session.peer,
            dest = %destination,
            upload = result.client_to_upstream,
            download = result.upstream_to_client,
            reason = ?result.reason,
            "Relay finished"
        );
        Ok(())
    }
}
