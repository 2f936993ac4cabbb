//! Destination address decoding shared by the wire codecs
//!
//! Two on-wire layouts exist:
//! - SOCKS layout (Trojan, Shadowsocks, SOCKS5): ATYP(1) + ADDR + PORT(2),
//!   with ATYP 1=IPv4, 3=domain, 4=IPv6
//! - VMess layout (VMess, VLESS): PORT(2) + ATYP(1) + ADDR,
//!   with ATYP 1=IPv4, 2=domain, 3=IPv6

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CodecError;

/// Address family carried by a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    IPv4,
    Domain,
    IPv6,
}

/// Wire layout used to encode a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScheme {
    /// ATYP + ADDR + PORT, ATYP 1/3/4
    Socks,
    /// PORT + ATYP + ADDR, ATYP 1/2/3
    VMess,
}

impl AddressScheme {
    fn kind_of(self, atyp: u8) -> Result<AddressKind, CodecError> {
        match (self, atyp) {
            (_, 1) => Ok(AddressKind::IPv4),
            (AddressScheme::Socks, 3) | (AddressScheme::VMess, 2) => Ok(AddressKind::Domain),
            (AddressScheme::Socks, 4) | (AddressScheme::VMess, 3) => Ok(AddressKind::IPv6),
            _ => Err(CodecError::UnknownAddressType(atyp)),
        }
    }

    fn atyp_of(self, kind: AddressKind) -> u8 {
        match (self, kind) {
            (_, AddressKind::IPv4) => 1,
            (AddressScheme::Socks, AddressKind::Domain) => 3,
            (AddressScheme::Socks, AddressKind::IPv6) => 4,
            (AddressScheme::VMess, AddressKind::Domain) => 2,
            (AddressScheme::VMess, AddressKind::IPv6) => 3,
        }
    }
}

/// Where a proxied connection should be forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// IPv4 literal, IPv6 literal (8-group form) or domain name
    pub address: String,
    pub port: u16,
}

impl Destination {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Classify the address string
    pub fn kind(&self) -> AddressKind {
        if self.address.parse::<Ipv4Addr>().is_ok() {
            AddressKind::IPv4
        } else if self.address.parse::<Ipv6Addr>().is_ok() {
            AddressKind::IPv6
        } else {
            AddressKind::Domain
        }
    }

    /// Encode this destination in the given wire layout
    pub fn encode(&self, scheme: AddressScheme, buf: &mut Vec<u8>) {
        let kind = self.kind();
        if scheme == AddressScheme::VMess {
            buf.extend_from_slice(&self.port.to_be_bytes());
        }
        buf.push(scheme.atyp_of(kind));
        match kind {
            AddressKind::IPv4 => {
                let ip: Ipv4Addr = self.address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                buf.extend_from_slice(&ip.octets());
            }
            AddressKind::IPv6 => {
                let ip: Ipv6Addr = self.address.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);
                buf.extend_from_slice(&ip.octets());
            }
            AddressKind::Domain => {
                let bytes = self.address.as_bytes();
                let len = bytes.len().min(u8::MAX as usize);
                buf.push(len as u8);
                buf.extend_from_slice(&bytes[..len]);
            }
        }
        if scheme == AddressScheme::Socks {
            buf.extend_from_slice(&self.port.to_be_bytes());
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind() == AddressKind::IPv6 {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Render IPv6 octets as eight zero-padded hex groups
pub fn format_ipv6(octets: &[u8; 16]) -> String {
    octets
        .chunks(2)
        .map(|c| format!("{:02x}{:02x}", c[0], c[1]))
        .collect::<Vec<_>>()
        .join(":")
}

async fn read_host<R>(reader: &mut R, kind: AddressKind) -> Result<String, CodecError>
where
    R: AsyncRead + Unpin,
{
    match kind {
        AddressKind::IPv4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            Ok(Ipv4Addr::from(ip).to_string())
        }
        AddressKind::IPv6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            Ok(format_ipv6(&ip))
        }
        AddressKind::Domain => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| CodecError::InvalidDomain)
        }
    }
}

/// Read one destination from the stream, consuming exactly its bytes
pub async fn read_destination<R>(
    reader: &mut R,
    scheme: AddressScheme,
) -> Result<Destination, CodecError>
where
    R: AsyncRead + Unpin,
{
    match scheme {
        AddressScheme::Socks => {
            let kind = scheme.kind_of(reader.read_u8().await?)?;
            let address = read_host(reader, kind).await?;
            let port = reader.read_u16().await?;
            Ok(Destination { address, port })
        }
        AddressScheme::VMess => {
            let port = reader.read_u16().await?;
            let kind = scheme.kind_of(reader.read_u8().await?)?;
            let address = read_host(reader, kind).await?;
            Ok(Destination { address, port })
        }
    }
}
