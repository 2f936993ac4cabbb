//! Trojan request header
//!
//! - 56-byte password hash
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - CRLF
//! - Address (ATYP + address + port)
//! - Payload

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::address::{read_destination, AddressScheme, Destination};
use crate::core::auth::TROJAN_HASH_LEN;
use crate::error::CodecError;

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrojanCmd {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for TrojanCmd {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TrojanCmd::Connect),
            3 => Ok(TrojanCmd::UdpAssociate),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Decoded Trojan header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub password: [u8; TROJAN_HASH_LEN],
    pub cmd: TrojanCmd,
    pub destination: Destination,
}

impl TrojanRequest {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut password = [0u8; TROJAN_HASH_LEN];
        reader.read_exact(&mut password).await?;

        let cmd = TrojanCmd::try_from(reader.read_u8().await?)?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(CodecError::MissingCrlf);
        }

        let destination = read_destination(reader, AddressScheme::Socks).await?;

        Ok(Self {
            password,
            cmd,
            destination,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TROJAN_HASH_LEN + 8 + self.destination.address.len());
        buf.extend_from_slice(&self.password);
        buf.push(self.cmd as u8);
        buf.extend_from_slice(b"\r\n");
        self.destination.encode(AddressScheme::Socks, &mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::{trojan_sha256, TrojanCredential};

    fn sha256_field(password: &str) -> [u8; TROJAN_HASH_LEN] {
        let mut field = [0u8; TROJAN_HASH_LEN];
        field[..32].copy_from_slice(&trojan_sha256(password));
        field
    }

    #[tokio::test]
    async fn test_decode_domain_request() {
        let mut bytes = sha256_field("p@ss").to_vec();
        bytes.push(0x01);
        bytes.extend_from_slice(b"\r\n");
        bytes.push(0x03);
        bytes.push(9);
        bytes.extend_from_slice(b"127.0.0.1");
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let req = TrojanRequest::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(req.cmd, TrojanCmd::Connect);
        assert_eq!(req.destination, Destination::new("127.0.0.1", 80));
        assert!(TrojanCredential::new("p@ss").verify(&req.password));
        assert!(!TrojanCredential::new("pass").verify(&req.password));
    }

    #[tokio::test]
    async fn test_encode_then_decode() {
        let req = TrojanRequest {
            password: sha256_field("x"),
            cmd: TrojanCmd::Connect,
            destination: Destination::new("2001:0db8:0000:0000:0000:0000:0000:0002", 443),
        };
        let decoded = TrojanRequest::read_from(&mut &req.encode()[..]).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_missing_crlf() {
        let mut bytes = sha256_field("p@ss").to_vec();
        bytes.push(0x01);
        bytes.extend_from_slice(b"\n\r");
        bytes.extend_from_slice(&[1, 127, 0, 0, 1, 0, 80]);
        let err = TrojanRequest::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, CodecError::MissingCrlf));
    }

    #[tokio::test]
    async fn test_invalid_command() {
        let mut bytes = sha256_field("p@ss").to_vec();
        bytes.push(0x02);
        bytes.extend_from_slice(b"\r\n");
        let err = TrojanRequest::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, CodecError::UnknownCommand(2)));
    }

    #[tokio::test]
    async fn test_truncated_every_offset() {
        let req = TrojanRequest {
            password: sha256_field("p@ss"),
            cmd: TrojanCmd::Connect,
            destination: Destination::new("example.com", 443),
        };
        let bytes = req.encode();
        for cut in 0..bytes.len() {
            let err = TrojanRequest::read_from(&mut &bytes[..cut]).await.unwrap_err();
            assert!(matches!(err, CodecError::Truncated), "offset {}", cut);
        }
    }
}
