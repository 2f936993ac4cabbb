//! Shadowsocks stream cipher support
//!
//! Keys come from the OpenSSL `EVP_BytesToKey` MD5 chain. Each direction
//! of a connection starts with its own random IV, after which every byte
//! passes through the stream cipher. Only AES-256-CFB is provided; other
//! methods plug in behind [`StreamCrypter`].

use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use rand::RngCore;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// One direction of a stream cipher, applied in place
pub trait StreamCrypter: Send + Sync {
    fn apply(&mut self, data: &mut [u8]);
}

struct Aes256CfbEncrypt(BufEncryptor<Aes256>);
struct Aes256CfbDecrypt(BufDecryptor<Aes256>);

impl StreamCrypter for Aes256CfbEncrypt {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

impl StreamCrypter for Aes256CfbDecrypt {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

/// Supported Shadowsocks cipher methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMethod {
    Aes256Cfb,
}

impl CipherMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherMethod::Aes256Cfb => "aes-256-cfb",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherMethod::Aes256Cfb => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherMethod::Aes256Cfb => 16,
        }
    }

    /// Derive the master key for `password`
    pub fn derive_key(&self, password: &str) -> Vec<u8> {
        evp_bytes_to_key(password.as_bytes(), self.key_len())
    }

    pub fn encryptor(&self, key: &[u8], iv: &[u8]) -> io::Result<Box<dyn StreamCrypter>> {
        match self {
            CipherMethod::Aes256Cfb => BufEncryptor::<Aes256>::new_from_slices(key, iv)
                .map(|c| Box::new(Aes256CfbEncrypt(c)) as Box<dyn StreamCrypter>)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid key or IV length")),
        }
    }

    pub fn decryptor(&self, key: &[u8], iv: &[u8]) -> io::Result<Box<dyn StreamCrypter>> {
        match self {
            CipherMethod::Aes256Cfb => BufDecryptor::<Aes256>::new_from_slices(key, iv)
                .map(|c| Box::new(Aes256CfbDecrypt(c)) as Box<dyn StreamCrypter>)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid key or IV length")),
        }
    }
}

impl FromStr for CipherMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-cfb" => Ok(CipherMethod::Aes256Cfb),
            other => Err(format!("unsupported cipher method: {}", other)),
        }
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

pin_project! {
    /// Encrypting/decrypting wrapper around a client stream
    ///
    /// Reads are decrypted in place. Writes are encrypted into a pending
    /// buffer that is drained by later writes, flush and shutdown; the first
    /// pending bytes are the outbound IV.
    pub struct CipherStream<S> {
        #[pin]
        inner: S,
        decryptor: Box<dyn StreamCrypter>,
        encryptor: Box<dyn StreamCrypter>,
        pending: Vec<u8>,
        pending_pos: usize,
    }
}

impl<S> CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the client's IV and set up both directions
    pub async fn accept(mut inner: S, method: CipherMethod, key: &[u8]) -> io::Result<Self> {
        let mut client_iv = vec![0u8; method.iv_len()];
        inner.read_exact(&mut client_iv).await?;
        let decryptor = method.decryptor(key, &client_iv)?;

        let mut server_iv = vec![0u8; method.iv_len()];
        rand::thread_rng().fill_bytes(&mut server_iv);
        let encryptor = method.encryptor(key, &server_iv)?;

        Ok(Self {
            inner,
            decryptor,
            encryptor,
            pending: server_iv,
            pending_pos: 0,
        })
    }
}

impl<S> CipherStream<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn drain_pending<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    cx: &mut Context<'_>,
    pending: &mut Vec<u8>,
    pending_pos: &mut usize,
) -> Poll<io::Result<()>> {
    while *pending_pos < pending.len() {
        let n = ready!(inner.as_mut().poll_write(cx, &pending[*pending_pos..]))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        *pending_pos += n;
    }
    pending.clear();
    *pending_pos = 0;
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.decryptor.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(drain_pending(
            this.inner.as_mut(),
            cx,
            this.pending,
            this.pending_pos
        ))?;

        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        this.encryptor.apply(&mut this.pending[start..]);

        // The bytes are accepted; a short inner write stays queued
        if let Poll::Ready(Err(e)) = drain_pending(this.inner, cx, this.pending, this.pending_pos) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(drain_pending(
            this.inner.as_mut(),
            cx,
            this.pending,
            this.pending_pos
        ))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(drain_pending(
            this.inner.as_mut(),
            cx,
            this.pending,
            this.pending_pos
        ))?;
        this.inner.poll_shutdown(cx)
    }
}
