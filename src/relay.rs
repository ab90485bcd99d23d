//! Bidirectional relay engine
//!
//! Splits both streams and runs the two directional copies side by side.
//! The relay returns only after both copies are joined (or the idle timeout
//! fires), and the streams are dropped once, here, never by a copy.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

/// Result of a relay with traffic stats
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes moved downstream -> upstream
    pub a_to_b: u64,
    /// Bytes moved upstream -> downstream
    pub b_to_a: u64,
    /// Whether both directions finished (true) or the relay idled out (false)
    pub completed: bool,
}

pin_project! {
    /// Records the last time bytes moved through the stream
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(inner: S, start_time: Instant, last_activity: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
        }
    }

    fn touch(start_time: &Instant, last_activity: &AtomicU64) {
        last_activity.store(start_time.elapsed().as_millis() as u64, Ordering::Release);
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before_len {
                Self::touch(this.start_time, this.last_activity);
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
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                Self::touch(this.start_time, this.last_activity);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// One direction: copy until EOF or error, then half-close the destination.
///
/// Only borrows the halves; closing the streams is left to the relay.
async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counting = CountingReader {
        inner: reader,
        counter,
    };
    let mut reader = BufReader::with_capacity(buffer_size, counting);
    let result = tokio::io::copy_buf(&mut reader, writer).await;
    // Half-close even after a read error so the other side sees EOF.
    // The peer may already be gone, so the shutdown result is ignored.
    let _ = writer.shutdown().await;
    result
}

pin_project! {
    /// Counts bytes as they are read so partial copies are still reported
    struct CountingReader<'a, R> {
        #[pin]
        inner: R,
        counter: &'a AtomicU64,
    }
}

impl<R: AsyncRead> AsyncRead for CountingReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before_len;
            this.counter.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

/// Relay `a` (downstream) and `b` (upstream) until both directions end.
///
/// - Each direction ends on its own EOF or error; an ended direction does
///   not cancel the other one.
/// - If no byte moves in either direction for `idle_timeout`, the relay
///   stops and reports `completed = false`.
/// - Both streams are closed exactly once when this function returns.
pub async fn relay<A, B>(
    a: A,
    b: B,
    buffer_size: usize,
    idle_timeout: Duration,
) -> std::io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let stream_a = TimedStream::new(a, start_time, Arc::clone(&last_activity));
    let stream_b = TimedStream::new(b, start_time, Arc::clone(&last_activity));

    let (mut a_read, mut a_write) = tokio::io::split(stream_a);
    let (mut b_read, mut b_write) = tokio::io::split(stream_b);

    let both = async {
        tokio::join!(
            copy_one_way(&mut a_read, &mut b_write, buffer_size, &a_to_b),
            copy_one_way(&mut b_read, &mut a_write, buffer_size, &b_to_a),
        )
    };

    let timeout_check = async {
        let period = (idle_timeout / 4).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let last_active = Duration::from_millis(last_activity.load(Ordering::Acquire));
            if start_time.elapsed().saturating_sub(last_active) >= idle_timeout {
                return;
            }
        }
    };

    let outcome = tokio::select! {
        (up, down) = both => match (up, down) {
            (Ok(up), Ok(down)) => Ok(CopyResult {
                a_to_b: up,
                b_to_a: down,
                completed: true,
            }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        _ = timeout_check => Ok(CopyResult {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
            completed: false,
        }),
    };

    // Both copies are finished or dropped; close each stream once
    drop(a_read.unsplit(a_write));
    drop(b_read.unsplit(b_write));

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_copy_result_clone() {
        let result = CopyResult {
            a_to_b: 100,
            b_to_a: 200,
            completed: true,
        };
        let cloned = result;
        assert_eq!(cloned.a_to_b, 100);
        assert_eq!(cloned.b_to_a, 200);
        assert!(cloned.completed);
    }

    #[tokio::test]
    async fn test_timed_stream_read_updates_activity() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let start_time = Instant::now() - Duration::from_secs(1);
        let last_activity = Arc::new(AtomicU64::new(0));
        let mut stream = TimedStream::new(cursor, start_time, Arc::clone(&last_activity));

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert!(last_activity.load(Ordering::Acquire) >= 1000);
    }

    #[tokio::test]
    async fn test_timed_stream_write_updates_activity() {
        let start_time = Instant::now() - Duration::from_secs(1);
        let last_activity = Arc::new(AtomicU64::new(0));
        let mut stream =
            TimedStream::new(Cursor::new(Vec::new()), start_time, Arc::clone(&last_activity));

        let n = stream.write(b"test").await.unwrap();
        assert_eq!(n, 4);
        assert!(last_activity.load(Ordering::Acquire) >= 1000);
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, down) = duplex(1024);
        let (up, mut target) = duplex(1024);

        let handle = tokio::spawn(relay(down, up, 512, Duration::from_secs(30)));

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        target.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client);
        drop(target);

        let result = handle.await.unwrap().unwrap();
        assert!(result.completed);
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
    }

    #[tokio::test]
    async fn test_relay_half_close_keeps_other_direction() {
        let (mut client, down) = duplex(1024);
        let (up, mut target) = duplex(1024);

        let handle = tokio::spawn(relay(down, up, 512, Duration::from_secs(30)));

        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        // Target sees the data then EOF
        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        // The other direction still delivers after the client half-closed
        target.write_all(b"late reply").await.unwrap();
        target.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");

        let result = handle.await.unwrap().unwrap();
        assert!(result.completed);
        assert_eq!(result.a_to_b, 10);
        assert_eq!(result.b_to_a, 10);
    }

    #[tokio::test]
    async fn test_relay_large_transfer() {
        let (mut client, down) = duplex(4096);
        let (up, mut target) = duplex(4096);
        let handle = tokio::spawn(relay(down, up, 1024, Duration::from_secs(30)));

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(target);

        drop(writer.await.unwrap());
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client, down) = duplex(1024);
        let (up, _target) = duplex(1024);

        let result = relay(down, up, 512, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!result.completed);
        assert_eq!(result.a_to_b, 0);
        assert_eq!(result.b_to_a, 0);
    }

    #[tokio::test]
    async fn test_relay_closes_both_streams() {
        let (client, down) = duplex(1024);
        let (up, mut target) = duplex(1024);

        drop(client);
        let mut buf = Vec::new();
        let relay_task = tokio::spawn(relay(down, up, 512, Duration::from_secs(30)));
        // Upstream sees EOF because downstream ended
        target.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        drop(target);

        let result = relay_task.await.unwrap().unwrap();
        assert!(result.completed);
    }

    /// Downstream whose reads fail immediately; writes are swallowed
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_relay_read_error_half_closes_destination() {
        let (up, mut target) = duplex(1024);
        let handle = tokio::spawn(relay(ResetStream, up, 512, Duration::from_secs(30)));

        // Upstream sees EOF instead of waiting for the idle timeout
        let mut buf = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(2), target.read_to_end(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0))));
        drop(target);

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
