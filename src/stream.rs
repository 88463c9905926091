//! The byte stream interface consumed by the socket scheduler.
//!
//! `ByteStream` is deliberately small: send all, receive all, honor a stop
//! token, close. The scheduler's writer and reader tasks call `send` and
//! `recv` concurrently but never overlap two sends or two receives.
//!
//! Two implementations ship with the crate: [`duplex`] builds an in-memory
//! capacity-bounded pipe pair (the loopback transport the tests run on), and
//! [`IoStream`] adapts anything implementing tokio's `AsyncRead + AsyncWrite`.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;

/// A bidirectional byte stream the scheduler can drive.
///
/// Contract for both transfer methods: on success the full buffer is
/// transferred and the error is `None`; a short count is only ever reported
/// together with `Some(error)`. A triggered stop token must surface promptly
/// as [`MuxError::Aborted`] carrying the number of bytes actually moved.
///
/// At most one `send` and one `recv` are in flight at a time; they may run
/// concurrently with each other and with `close`.
pub trait ByteStream: Send + Sync + 'static {
    /// Write all of `buf`.
    fn send(
        &self,
        buf: &[u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send;

    /// Fill all of `buf`.
    fn recv(
        &self,
        buf: &mut [u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send;

    /// Shut the stream down. Pending and future transfers fail.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// In-memory pipe
// ---------------------------------------------------------------------------

struct PipeBuf {
    data: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

/// One direction of a pipe pair.
struct PipeHalf {
    buf: Mutex<PipeBuf>,
    readable: Notify,
    writable: Notify,
}

impl PipeHalf {
    fn new(capacity: usize) -> PipeHalf {
        PipeHalf {
            buf: Mutex::new(PipeBuf {
                data: VecDeque::new(),
                capacity,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn close(&self) {
        self.buf.lock().unwrap().closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// One endpoint of an in-memory byte pipe created by [`duplex`].
pub struct PipeStream {
    tx: Arc<PipeHalf>,
    rx: Arc<PipeHalf>,
}

/// Create a connected pair of in-memory byte streams.
///
/// Each direction buffers at most `capacity` bytes; a send blocks once the
/// buffer is full until the peer drains it, which is what makes mid-transfer
/// cancellation observable.
pub fn duplex(capacity: usize) -> (PipeStream, PipeStream) {
    assert!(capacity > 0, "pipe capacity must be non-zero");
    let a_to_b = Arc::new(PipeHalf::new(capacity));
    let b_to_a = Arc::new(PipeHalf::new(capacity));
    let a = PipeStream {
        tx: a_to_b.clone(),
        rx: b_to_a.clone(),
    };
    let b = PipeStream {
        tx: b_to_a,
        rx: a_to_b,
    };
    (a, b)
}

impl ByteStream for PipeStream {
    fn send(
        &self,
        buf: &[u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send {
        async move {
            let mut written = 0;
            while written < buf.len() {
                let notified = self.tx.writable.notified();
                {
                    let mut b = self.tx.buf.lock().unwrap();
                    if b.closed {
                        return (written, Some(MuxError::Closed));
                    }
                    let space = b.capacity - b.data.len();
                    if space > 0 {
                        let n = space.min(buf.len() - written);
                        b.data.extend(&buf[written..written + n]);
                        written += n;
                        drop(b);
                        self.tx.readable.notify_one();
                        continue;
                    }
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return (written, Some(MuxError::Aborted)),
                    _ = notified => {}
                }
            }
            (written, None)
        }
    }

    fn recv(
        &self,
        buf: &mut [u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send {
        async move {
            let mut filled = 0;
            while filled < buf.len() {
                let notified = self.rx.readable.notified();
                {
                    let mut b = self.rx.buf.lock().unwrap();
                    if !b.data.is_empty() {
                        let n = b.data.len().min(buf.len() - filled);
                        for byte in b.data.drain(..n) {
                            buf[filled] = byte;
                            filled += 1;
                        }
                        drop(b);
                        self.rx.writable.notify_one();
                        continue;
                    }
                    if b.closed {
                        return (filled, Some(MuxError::Closed));
                    }
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return (filled, Some(MuxError::Aborted)),
                    _ = notified => {}
                }
            }
            (filled, None)
        }
    }

    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

// ---------------------------------------------------------------------------
// AsyncRead/AsyncWrite adapter
// ---------------------------------------------------------------------------

/// Adapts a tokio `AsyncRead + AsyncWrite` transport (TCP, Unix sockets,
/// `tokio::io::duplex`, ...) to [`ByteStream`].
///
/// `close` here is logical: in-flight and future transfers fail with
/// [`MuxError::Closed`]; the OS handle is released when the adapter drops.
/// Stop tokens are honored at write/read call granularity.
pub struct IoStream<T> {
    reader: tokio::sync::Mutex<ReadHalf<T>>,
    writer: tokio::sync::Mutex<WriteHalf<T>>,
    closed: CancellationToken,
}

impl<T> IoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> IoStream<T> {
        let (r, w) = tokio::io::split(io);
        IoStream {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            closed: CancellationToken::new(),
        }
    }
}

impl<T> ByteStream for IoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send(
        &self,
        buf: &[u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send {
        async move {
            let mut w = self.writer.lock().await;
            let mut written = 0;
            while written < buf.len() {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return (written, Some(MuxError::Aborted)),
                    _ = self.closed.cancelled() => return (written, Some(MuxError::Closed)),
                    res = w.write(&buf[written..]) => match res {
                        Ok(0) => {
                            let e = io::Error::new(io::ErrorKind::WriteZero, "stream write returned zero");
                            return (written, Some(e.into()));
                        }
                        Ok(n) => written += n,
                        Err(e) => return (written, Some(e.into())),
                    }
                }
            }
            (written, None)
        }
    }

    fn recv(
        &self,
        buf: &mut [u8],
        stop: &CancellationToken,
    ) -> impl Future<Output = (usize, Option<MuxError>)> + Send {
        async move {
            let mut r = self.reader.lock().await;
            let mut filled = 0;
            while filled < buf.len() {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return (filled, Some(MuxError::Aborted)),
                    _ = self.closed.cancelled() => return (filled, Some(MuxError::Closed)),
                    res = r.read(&mut buf[filled..]) => match res {
                        Ok(0) => {
                            let e = io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-frame");
                            return (filled, Some(e.into()));
                        }
                        Ok(n) => filled += n,
                        Err(e) => return (filled, Some(e.into())),
                    }
                }
            }
            (filled, None)
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_send_recv() {
        let (a, b) = duplex(64);
        let none = CancellationToken::new();

        let (n, err) = a.send(b"hello", &none).await;
        assert_eq!(n, 5);
        assert!(err.is_none());

        let mut buf = [0u8; 5];
        let (n, err) = b.recv(&mut buf, &none).await;
        assert_eq!(n, 5);
        assert!(err.is_none());
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_pipe_send_blocks_until_drained() {
        let (a, b) = duplex(4);
        let none = CancellationToken::new();

        let sender = tokio::spawn(async move {
            let (n, err) = a.send(&[1, 2, 3, 4, 5, 6], &none).await;
            assert_eq!(n, 6);
            assert!(err.is_none());
            a
        });

        let none = CancellationToken::new();
        let mut buf = [0u8; 6];
        let (n, err) = b.recv(&mut buf, &none).await;
        assert_eq!(n, 6);
        assert!(err.is_none());
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_send_abort_reports_partial_count() {
        let (a, _b) = duplex(4);
        let stop = CancellationToken::new();

        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move { a.send(&[0u8; 64], &stop).await })
        };
        tokio::task::yield_now().await;
        stop.cancel();

        let (n, err) = handle.await.unwrap();
        assert_eq!(n, 4); // filled the pipe, then stopped
        assert!(matches!(err, Some(MuxError::Aborted)));
    }

    #[tokio::test]
    async fn test_pipe_recv_abort() {
        let (a, b) = duplex(8);
        let none = CancellationToken::new();
        let stop = CancellationToken::new();

        let (n, err) = a.send(&[9, 9], &none).await;
        assert_eq!((n, err.is_none()), (2, true));

        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let (n, err) = b.recv(&mut buf, &stop).await;
                (n, err, buf)
            })
        };
        tokio::task::yield_now().await;
        stop.cancel();

        let (n, err, buf) = handle.await.unwrap();
        assert_eq!(n, 2);
        assert!(matches!(err, Some(MuxError::Aborted)));
        assert_eq!(&buf[..2], &[9, 9]);
    }

    #[tokio::test]
    async fn test_pipe_close_fails_blocked_peer() {
        let (a, b) = duplex(8);
        let none = CancellationToken::new();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            b.recv(&mut buf, &CancellationToken::new()).await
        });
        tokio::task::yield_now().await;
        a.close();

        let (n, err) = handle.await.unwrap();
        assert_eq!(n, 0);
        assert!(matches!(err, Some(MuxError::Closed)));

        let (_, err) = a.send(&[1], &none).await;
        assert!(matches!(err, Some(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_io_stream_adapter() {
        let (x, y) = tokio::io::duplex(32);
        let a = IoStream::new(x);
        let b = IoStream::new(y);
        let none = CancellationToken::new();

        let (n, err) = a.send(b"ping", &none).await;
        assert_eq!((n, err.is_none()), (4, true));

        let mut buf = [0u8; 4];
        let (n, err) = b.recv(&mut buf, &none).await;
        assert_eq!((n, err.is_none()), (4, true));
        assert_eq!(&buf, b"ping");
    }
}
