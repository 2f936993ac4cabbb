//! Bidirectional relay with traffic statistics
//!
//! Two copy loops run concurrently, each with its own fixed-size buffer.
//! Whichever loop ends first (EOF or error) tears down both streams, as do
//! the idle timeout and connection cancellation.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_BUFFER_SIZE;

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed its write side
    ClientEof,
    /// Upstream closed its write side
    UpstreamEof,
    /// Reading from or writing to the client failed
    ClientError,
    /// Reading from or writing to the upstream failed
    UpstreamError,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
    /// The connection was kicked
    Cancelled,
}

/// Result of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayResult {
    /// Bytes delivered to the upstream (upload)
    pub client_to_upstream: u64,
    /// Bytes delivered to the client (download)
    pub upstream_to_client: u64,
    pub reason: CloseReason,
}

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pin_project! {
    /// A stream wrapper that tracks the last activity time and bytes written
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        // Bytes successfully written into this stream
        write_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        write_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            write_bytes,
        }
    }
}

fn touch(start_time: &Instant, last_activity: &AtomicU64) {
    last_activity.store(start_time.elapsed().as_millis() as u64, Ordering::Release);
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before_len {
                touch(this.start_time, this.last_activity);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                touch(this.start_time, this.last_activity);
                this.write_bytes.fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// How one copy direction ended
enum PumpEnd {
    Eof,
    ReadError,
    WriteError,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(_) => return PumpEnd::ReadError,
        };
        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
            return PumpEnd::WriteError;
        }
    }
}

/// Relay bytes between `client` and `upstream` until one side finishes.
///
/// Both streams are dropped (and therefore closed) before this returns.
/// Byte counts include everything delivered before the close, whatever the
/// reason.
pub async fn relay<A, B>(
    client: A,
    upstream: B,
    options: RelayOptions,
    cancel: &CancellationToken,
) -> RelayResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let upload = Arc::new(AtomicU64::new(0));
    let download = Arc::new(AtomicU64::new(0));

    // Writes into the client are download, writes into the upstream are upload
    let client = TimedStream::new(
        client,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&download),
    );
    let upstream = TimedStream::new(
        upstream,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&upload),
    );

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let buffer_size = options.buffer_size.max(1);

    let idle_timeout = options.idle_timeout;
    let idle_check = async {
        let period = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let last_active = last_activity.load(Ordering::Acquire);
            let idle_ms = (start_time.elapsed().as_millis() as u64).saturating_sub(last_active);
            if idle_ms >= idle_timeout.as_millis() as u64 {
                return;
            }
        }
    };

    let reason = tokio::select! {
        end = pump(&mut client_rd, &mut upstream_wr, buffer_size) => match end {
            PumpEnd::Eof => CloseReason::ClientEof,
            PumpEnd::ReadError => CloseReason::ClientError,
            PumpEnd::WriteError => CloseReason::UpstreamError,
        },
        end = pump(&mut upstream_rd, &mut client_wr, buffer_size) => match end {
            PumpEnd::Eof => CloseReason::UpstreamEof,
            PumpEnd::ReadError => CloseReason::UpstreamError,
            PumpEnd::WriteError => CloseReason::ClientError,
        },
        _ = idle_check => CloseReason::IdleTimeout,
        _ = cancel.cancelled() => CloseReason::Cancelled,
    };

    drop((client_rd, client_wr, upstream_rd, upstream_wr));

    RelayResult {
        client_to_upstream: upload.load(Ordering::Relaxed),
        upstream_to_client: download.load(Ordering::Relaxed),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    fn options(idle: Duration) -> RelayOptions {
        RelayOptions {
            buffer_size: 32 * 1024,
            idle_timeout: idle,
        }
    }

    #[tokio::test]
    async fn test_timed_stream_write_counts_bytes() {
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let write_bytes = Arc::new(AtomicU64::new(0));

        let mut stream = TimedStream::new(
            Cursor::new(Vec::new()),
            start_time,
            Arc::clone(&last_activity),
            write_bytes.clone(),
        );

        let n = stream.write(b"test").await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(write_bytes.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_timed_stream_read_updates_activity() {
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let write_bytes = Arc::new(AtomicU64::new(0));

        let mut stream = TimedStream::new(
            Cursor::new(b"hello world".to_vec()),
            start_time,
            Arc::clone(&last_activity),
            write_bytes.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
        assert!(last_activity.load(Ordering::Acquire) >= 20);
        // Reads are not counted as delivered bytes
        assert_eq!(write_bytes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (client_near, mut client_far) = duplex(64 * 1024);
        let (upstream_near, mut upstream_far) = duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move {
            relay(client_near, upstream_near, options(Duration::from_secs(30)), &cancel).await
        });

        let download = vec![7u8; 50_000];
        upstream_far.write_all(&download).await.unwrap();
        let mut got = vec![0u8; download.len()];
        client_far.read_exact(&mut got).await.unwrap();
        assert_eq!(got, download);

        let upload = vec![3u8; 1234];
        client_far.write_all(&upload).await.unwrap();
        let mut got = vec![0u8; upload.len()];
        upstream_far.read_exact(&mut got).await.unwrap();
        assert_eq!(got, upload);

        client_far.shutdown().await.unwrap();
        let result = task.await.unwrap();

        assert_eq!(result.client_to_upstream, 1234);
        assert_eq!(result.upstream_to_client, 50_000);
        assert_eq!(result.reason, CloseReason::ClientEof);

        // The upstream side is closed as well
        let mut rest = Vec::new();
        upstream_far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_upstream_eof_closes_client() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let cancel = CancellationToken::new();

        drop(upstream_far);
        let result = relay(client_near, upstream_near, options(Duration::from_secs(30)), &cancel).await;
        assert_eq!(result.reason, CloseReason::UpstreamEof);
        assert_eq!(result.client_to_upstream, 0);

        let mut rest = Vec::new();
        client_far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (client_near, _client_far) = duplex(1024);
        let (upstream_near, _upstream_far) = duplex(1024);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let result = relay(client_near, upstream_near, options(Duration::from_millis(100)), &cancel).await;
        assert_eq!(result.reason, CloseReason::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_relay_cancelled_keeps_partial_counts() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);
        let cancel = CancellationToken::new();
        let kicker = cancel.clone();

        let task = tokio::spawn(async move {
            relay(client_near, upstream_near, options(Duration::from_secs(30)), &cancel).await
        });

        client_far.write_all(b"partial").await.unwrap();
        let mut got = [0u8; 7];
        upstream_far.read_exact(&mut got).await.unwrap();

        kicker.cancel();
        let result = task.await.unwrap();
        assert_eq!(result.reason, CloseReason::Cancelled);
        assert_eq!(result.client_to_upstream, 7);
    }

    #[test]
    fn test_relay_options_default() {
        let opts = RelayOptions::default();
        assert_eq!(opts.buffer_size, 32 * 1024);
    }
}
