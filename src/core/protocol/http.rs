//! HTTP proxy request parsing
//!
//! Handles both `CONNECT host:port` tunnels and plain forward-proxy requests
//! in absolute form. The request head is parsed with `httparse`; anything
//! read past the head is handed back so the handler can forward it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use std::net::Ipv6Addr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::address::{format_ipv6, Destination};
use crate::error::CodecError;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const PROXY_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Headers that only concern the proxy hop
const HOP_HEADERS: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

/// Parsed proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxyRequest {
    pub method: String,
    pub destination: Destination,
    /// Decoded `Proxy-Authorization: Basic` credentials
    pub basic_auth: Option<(String, String)>,
    /// Head rewritten for the origin server, absent for CONNECT
    pub forward_head: Option<Vec<u8>>,
    /// Bytes received after the head
    pub leftover: Vec<u8>,
}

impl HttpProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Read and parse one request head
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(CodecError::Truncated);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(req) = Self::parse(&buf)? {
                return Ok(req);
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(CodecError::Malformed("request head too large".to_string()));
            }
        }
    }

    /// Parse a buffered head, `None` while it is incomplete
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, CodecError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(CodecError::Malformed(format!("bad request head: {}", e))),
        };

        let method = req
            .method
            .ok_or_else(|| CodecError::Malformed("missing method".to_string()))?
            .to_string();
        let path = req
            .path
            .ok_or_else(|| CodecError::Malformed("missing request target".to_string()))?;
        let minor = req.version.unwrap_or(1);

        let basic_auth = find_header(req.headers, "proxy-authorization").and_then(parse_basic_auth);
        let host_header = find_header(req.headers, "host").map(str::to_string);

        let leftover = buf[head_len..].to_vec();

        if method.eq_ignore_ascii_case("CONNECT") {
            let destination = split_host_port(path, 443)?;
            return Ok(Some(Self {
                method,
                destination,
                basic_auth,
                forward_head: None,
                leftover,
            }));
        }

        let (destination, origin_path) = match strip_scheme(path) {
            Some((rest, default_port)) => {
                let (authority, origin) = match rest.find('/') {
                    Some(i) => (&rest[..i], &rest[i..]),
                    None => (rest, "/"),
                };
                (split_host_port(authority, default_port)?, origin.to_string())
            }
            None => {
                let host = host_header
                    .as_deref()
                    .ok_or_else(|| CodecError::Malformed("missing Host header".to_string()))?;
                (split_host_port(host, 80)?, path.to_string())
            }
        };

        let mut head = format!("{} {} HTTP/1.{}\r\n", method, origin_path, minor).into_bytes();
        let mut has_host = false;
        for h in req.headers.iter() {
            let lower = h.name.to_ascii_lowercase();
            if HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            has_host |= lower == "host";
            head.extend_from_slice(h.name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(h.value);
            head.extend_from_slice(b"\r\n");
        }
        if !has_host {
            head.extend_from_slice(format!("Host: {}\r\n", destination).as_bytes());
        }
        head.extend_from_slice(b"Connection: close\r\n\r\n");

        Ok(Some(Self {
            method,
            destination,
            basic_auth,
            forward_head: Some(head),
            leftover,
        }))
    }
}

fn find_header<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

fn strip_scheme(target: &str) -> Option<(&str, u16)> {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") {
        Some((&target[7..], 80))
    } else if lower.starts_with("https://") {
        Some((&target[8..], 443))
    } else {
        None
    }
}

/// Split `host[:port]` or `[v6][:port]`
pub fn split_host_port(authority: &str, default_port: u16) -> Result<Destination, CodecError> {
    let bad = || CodecError::Malformed(format!("invalid authority: {}", authority));
    let parse_port = |s: &str| s.parse::<u16>().map_err(|_| bad());

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let ip: Ipv6Addr = rest[..end].parse().map_err(|_| bad())?;
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if rest[end + 1..].is_empty() => default_port,
            None => return Err(bad()),
        };
        return Ok(Destination::new(format_ipv6(&ip.octets()), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok(Destination::new(host, parse_port(port)?)),
        Some(_) => Err(bad()),
        None if !authority.is_empty() => Ok(Destination::new(authority, default_port)),
        None => Err(bad()),
    }
}

fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Status code of a response head, used by clients and tests
pub fn parse_status(head: &[u8]) -> Result<u16, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => resp
            .code
            .ok_or_else(|| CodecError::Malformed("missing status".to_string())),
        Ok(httparse::Status::Partial) => Err(CodecError::Truncated),
        Err(e) => Err(CodecError::Malformed(format!("bad response head: {}", e))),
    }
}
