//! SOCKS4/4a and SOCKS5 handshake codecs
//!
//! Both dialects share one listener; the handler reads the version byte and
//! dispatches to the matching `*_after_version` reader.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::address::{read_destination, AddressScheme, Destination};
use crate::error::CodecError;

// SOCKS5 constants (RFC 1928, RFC 1929)
pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const PASSWORD_AUTH_VERSION: u8 = 0x01;
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

// SOCKS4 constants
pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS4_GRANTED: u8 = 0x5A;
pub const SOCKS4_REJECTED: u8 = 0x5B;

/// Upper bound for NUL-terminated SOCKS4 fields
const MAX_SOCKS4_FIELD: usize = 255;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Cmd {
    Connect = 1,
    Bind = 2,
    UdpAssociate = 3,
}

impl TryFrom<u8> for Socks5Cmd {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Socks5Cmd::Connect),
            2 => Ok(Socks5Cmd::Bind),
            3 => Ok(Socks5Cmd::UdpAssociate),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Method list offered by the client
pub async fn read_methods_after_version<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    reader.read_exact(&mut methods).await?;
    Ok(methods)
}

pub fn encode_method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// RFC 1929 username/password sub-negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl PasswordRequest {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        if version != PASSWORD_AUTH_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let ulen = reader.read_u8().await? as usize;
        let mut username = vec![0u8; ulen];
        reader.read_exact(&mut username).await?;
        let plen = reader.read_u8().await? as usize;
        let mut password = vec![0u8; plen];
        reader.read_exact(&mut password).await?;
        Ok(Self { username, password })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.username.len() + self.password.len());
        buf.push(PASSWORD_AUTH_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(&self.username);
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(&self.password);
        buf
    }
}

pub fn encode_password_reply(success: bool) -> [u8; 2] {
    [PASSWORD_AUTH_VERSION, if success { 0x00 } else { 0x01 }]
}

/// SOCKS5 request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub cmd: Socks5Cmd,
    pub destination: Destination,
}

impl Socks5Request {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let cmd = Socks5Cmd::try_from(reader.read_u8().await?)?;
        let _rsv = reader.read_u8().await?;
        let destination = read_destination(reader, AddressScheme::Socks).await?;
        Ok(Self { cmd, destination })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS5_VERSION, self.cmd as u8, 0x00];
        self.destination.encode(AddressScheme::Socks, &mut buf);
        buf
    }
}

/// Reply code owed to a client whose request line failed to decode
pub fn reply_code_for(err: &CodecError) -> Option<u8> {
    match err {
        CodecError::UnknownCommand(_) => Some(REPLY_COMMAND_NOT_SUPPORTED),
        CodecError::UnknownAddressType(_) => Some(REPLY_ADDRESS_NOT_SUPPORTED),
        _ => None,
    }
}

/// SOCKS5 reply written before relaying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Reply {
    pub reply: u8,
    pub bound: Destination,
}

impl Socks5Reply {
    pub fn success(bound: Destination) -> Self {
        Self {
            reply: REPLY_SUCCESS,
            bound,
        }
    }

    /// Negative reply with an all-zero IPv4 bound address
    pub fn failure(reply: u8) -> Self {
        Self {
            reply,
            bound: Destination::new("0.0.0.0", 0),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS5_VERSION, self.reply, 0x00];
        self.bound.encode(AddressScheme::Socks, &mut buf);
        buf
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let reply = reader.read_u8().await?;
        let _rsv = reader.read_u8().await?;
        let bound = read_destination(reader, AddressScheme::Socks).await?;
        Ok(Self { reply, bound })
    }
}

/// SOCKS4 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Cmd {
    Connect = 1,
    Bind = 2,
}

impl TryFrom<u8> for Socks4Cmd {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Socks4Cmd::Connect),
            2 => Ok(Socks4Cmd::Bind),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// SOCKS4 or SOCKS4a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub cmd: Socks4Cmd,
    pub destination: Destination,
    pub user_id: Vec<u8>,
}

async fn read_nul_terminated<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        if b == 0 {
            return Ok(out);
        }
        if out.len() == MAX_SOCKS4_FIELD {
            return Err(CodecError::Malformed("SOCKS4 field too long".to_string()));
        }
        out.push(b);
    }
}

impl Socks4Request {
    /// Read the rest of the request once the version byte is consumed
    pub async fn read_after_version<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let cmd = Socks4Cmd::try_from(reader.read_u8().await?)?;
        let port = reader.read_u16().await?;
        let mut ip = [0u8; 4];
        reader.read_exact(&mut ip).await?;
        let user_id = read_nul_terminated(reader).await?;

        // SOCKS4a: 0.0.0.x with x != 0 means a domain follows the user ID
        let address = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
            let domain = read_nul_terminated(reader).await?;
            String::from_utf8(domain).map_err(|_| CodecError::InvalidDomain)?
        } else {
            std::net::Ipv4Addr::from(ip).to_string()
        };

        Ok(Self {
            cmd,
            destination: Destination::new(address, port),
            user_id,
        })
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        if version != SOCKS4_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Self::read_after_version(reader).await
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS4_VERSION, self.cmd as u8];
        buf.extend_from_slice(&self.destination.port.to_be_bytes());
        match self.destination.address.parse::<std::net::Ipv4Addr>() {
            Ok(ip) => {
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&self.user_id);
                buf.push(0);
            }
            Err(_) => {
                buf.extend_from_slice(&[0, 0, 0, 1]);
                buf.extend_from_slice(&self.user_id);
                buf.push(0);
                buf.extend_from_slice(self.destination.address.as_bytes());
                buf.push(0);
            }
        }
        buf
    }
}

/// 8-byte SOCKS4 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks4Reply {
    pub code: u8,
    pub port: u16,
    pub ip: [u8; 4],
}

impl Socks4Reply {
    pub fn granted(port: u16, ip: [u8; 4]) -> Self {
        Self {
            code: SOCKS4_GRANTED,
            port,
            ip,
        }
    }

    pub fn rejected(port: u16, ip: [u8; 4]) -> Self {
        Self {
            code: SOCKS4_REJECTED,
            port,
            ip,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let p = self.port.to_be_bytes();
        [
            0x00, self.code, p[0], p[1], self.ip[0], self.ip[1], self.ip[2], self.ip[3],
        ]
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await?;
        if buf[0] != 0x00 {
            return Err(CodecError::UnsupportedVersion(buf[0]));
        }
        Ok(Self {
            code: buf[1],
            port: u16::from_be_bytes([buf[2], buf[3]]),
            ip: [buf[4], buf[5], buf[6], buf[7]],
        })
    }
}
