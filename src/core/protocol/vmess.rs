//! VMess and VLESS cleartext request header
//!
//! Layout shared by both dialects:
//! - Version (1 byte: VMess=1, VLESS=0)
//! - User ID (16 bytes)
//! - Command (1 byte: TCP=1, UDP=2)
//! - Port (2 bytes, big endian)
//! - ATYP (1=IPv4, 2=domain, 3=IPv6) + address

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::address::{read_destination, AddressScheme, Destination};
use crate::error::CodecError;

pub const VMESS_VERSION: u8 = 1;
pub const VLESS_VERSION: u8 = 0;

/// VMess/VLESS command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMessCmd {
    Tcp = 1,
    Udp = 2,
}

impl TryFrom<u8> for VMessCmd {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VMessCmd::Tcp),
            2 => Ok(VMessCmd::Udp),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Decoded VMess/VLESS header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VMessRequest {
    pub version: u8,
    pub user_id: [u8; 16],
    pub command: VMessCmd,
    pub destination: Destination,
}

impl VMessRequest {
    /// Read one header, expecting `version`
    pub async fn read_from<R>(reader: &mut R, version: u8) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let got = reader.read_u8().await?;
        if got != version {
            return Err(CodecError::UnsupportedVersion(got));
        }

        let mut user_id = [0u8; 16];
        reader.read_exact(&mut user_id).await?;
        let command = VMessCmd::try_from(reader.read_u8().await?)?;
        let destination = read_destination(reader, AddressScheme::VMess).await?;

        Ok(Self {
            version,
            user_id,
            command,
            destination,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.destination.address.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.user_id);
        buf.push(self.command as u8);
        self.destination.encode(AddressScheme::VMess, &mut buf);
        buf
    }
}
