//! Shadowsocks request header
//!
//! The header is a bare SOCKS-style address read through the decrypting
//! stream, so it must only be called on a [`CipherStream`].

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::address::{read_destination, AddressScheme, Destination};
use crate::core::cipher::{CipherMethod, CipherStream};
use crate::error::CodecError;

/// Wrap the raw client stream and decode the destination through it
pub async fn accept<S>(
    inner: S,
    method: CipherMethod,
    key: &[u8],
) -> Result<(CipherStream<S>, Destination), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = CipherStream::accept(inner, method, key).await?;
    let destination = read_destination(&mut stream, AddressScheme::Socks).await?;
    Ok((stream, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn encrypted_request(key: &[u8], dest: &Destination, payload: &[u8]) -> Vec<u8> {
        let iv = [7u8; 16];
        let mut plain = Vec::new();
        dest.encode(AddressScheme::Socks, &mut plain);
        plain.extend_from_slice(payload);
        CipherMethod::Aes256Cfb
            .encryptor(key, &iv)
            .unwrap()
            .apply(&mut plain);
        let mut out = iv.to_vec();
        out.extend_from_slice(&plain);
        out
    }

    #[tokio::test]
    async fn test_accept_decodes_destination() {
        let key = CipherMethod::Aes256Cfb.derive_key("ss-secret");
        let dest = Destination::new("example.net", 8388);
        let (server_side, mut client) = duplex(4096);
        client
            .write_all(&encrypted_request(&key, &dest, b"ping"))
            .await
            .unwrap();

        let (mut stream, got) = accept(server_side, CipherMethod::Aes256Cfb, &key)
            .await
            .unwrap();
        assert_eq!(got, dest);

        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage_or_error() {
        let key = CipherMethod::Aes256Cfb.derive_key("right");
        let wrong = CipherMethod::Aes256Cfb.derive_key("wrong");
        let dest = Destination::new("10.1.2.3", 80);
        let (server_side, mut client) = duplex(4096);
        client
            .write_all(&encrypted_request(&key, &dest, b""))
            .await
            .unwrap();
        drop(client);

        match accept(server_side, CipherMethod::Aes256Cfb, &wrong).await {
            Ok((_, got)) => assert_ne!(got, dest),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let key = CipherMethod::Aes256Cfb.derive_key("k");
        let full = encrypted_request(&key, &Destination::new("example.org", 443), b"");
        for cut in [0, 10, 16, 17, 20, full.len() - 1] {
            let (server_side, mut client) = duplex(4096);
            client.write_all(&full[..cut]).await.unwrap();
            drop(client);
            assert!(
                accept(server_side, CipherMethod::Aes256Cfb, &key).await.is_err(),
                "offset {}",
                cut
            );
        }
    }
}
