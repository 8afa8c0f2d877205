//! Byte-stream transport: any `AsyncRead + AsyncWrite` pair behind async
//! mutexes, with corked writes and cancel-safe buffered reads.
//!
//! Two disciplines keep the stream coherent under concurrency:
//!
//! - Writes hold the writer lock across a header and its payload, so no
//!   other sender's bytes can land between them (the cork).
//! - Header reads accumulate into a transport-owned buffer and consume
//!   nothing until a full header is available, so cancelling a read future
//!   between polls never loses bytes off the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e)
        }
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<ReadHalf>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    shutdown: Notify,
}

struct ReadHalf {
    io: Box<dyn AsyncRead + Unpin + Send + Sync>,
    /// Bytes received off the stream but not yet consumed.
    pending: BytesMut,
}

impl ReadHalf {
    /// Grow `pending` until it holds at least `n` bytes.
    async fn fill(&mut self, n: usize) -> Result<(), TransportError> {
        let Self { io, pending } = self;
        while pending.len() < n {
            let got = io.read_buf(pending).await?;
            if got == 0 {
                return Err(TransportError::Closed);
            }
        }
        Ok(())
    }
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Build from separate read and write handles, e.g. split TCP halves or
    /// a TLS stream's two directions.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(ReadHalf {
                    io: Box::new(reader),
                    pending: BytesMut::new(),
                }),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Connected in-memory pair for tests.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (Self::new(a), Self::new(b))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Peek the next big-endian u32 without consuming it.
    pub async fn peek_u32(&self) -> Result<u32, TransportError> {
        let inner = &*self.inner;
        let shutdown = inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = &mut shutdown => Err(TransportError::Closed),
            res = async {
                let mut half = inner.reader.lock().await;
                half.fill(4).await?;
                Ok((&half.pending[..4]).get_u32())
            } => res,
        }
    }

    /// Take exactly `n` bytes off the stream.
    ///
    /// Cancel-safe: nothing is consumed until all `n` bytes have arrived, so
    /// a dropped future leaves them queued for the next read.
    pub async fn take(&self, n: usize) -> Result<BytesMut, TransportError> {
        let inner = &*self.inner;
        let shutdown = inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = &mut shutdown => Err(TransportError::Closed),
            res = async {
                let mut half = inner.reader.lock().await;
                half.fill(n).await?;
                Ok(half.pending.split_to(n))
            } => res,
        }
    }

    /// Read exactly `dest.len()` payload bytes into the caller's buffer.
    pub async fn read_into(&self, dest: &mut [u8]) -> Result<(), TransportError> {
        if dest.is_empty() {
            return Ok(());
        }
        let inner = &*self.inner;
        let shutdown = inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = &mut shutdown => Err(TransportError::Closed),
            res = async {
                let mut half = inner.reader.lock().await;
                let buffered = half.pending.len().min(dest.len());
                if buffered > 0 {
                    dest[..buffered].copy_from_slice(&half.pending[..buffered]);
                    half.pending.advance(buffered);
                }
                if buffered < dest.len() {
                    half.io.read_exact(&mut dest[buffered..]).await?;
                }
                Ok(())
            } => res,
        }
    }

    /// Write one header and optional payload as a single uninterrupted
    /// region, then flush.
    pub async fn write_message(
        &self,
        header: &[u8],
        payload: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let inner = &*self.inner;
        let shutdown = inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = &mut shutdown => Err(TransportError::Closed),
            res = async {
                let mut writer = inner.writer.lock().await;
                writer.write_all(header).await?;
                if let Some(payload) = payload {
                    if !payload.is_empty() {
                        writer.write_all(payload).await?;
                    }
                }
                writer.flush().await?;
                Ok(())
            } => res,
        }
    }

    /// Shut the transport down in both directions: every blocked or future
    /// read and write fails with [`TransportError::Closed`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        // Best-effort FIN; blocked writers were just told to abort, so the
        // lock frees promptly.
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn corked_write_arrives_as_one_region() {
        let (a, b) = StreamTransport::pair();
        a.write_message(b"head", Some(b"payload")).await.unwrap();
        let got = b.take(11).await.unwrap();
        assert_eq!(&got[..], b"headpayload");
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (a, b) = StreamTransport::pair();
        a.write_message(&7u32.to_be_bytes(), None).await.unwrap();
        assert_eq!(b.peek_u32().await.unwrap(), 7);
        assert_eq!(b.peek_u32().await.unwrap(), 7);
        let got = b.take(4).await.unwrap();
        assert_eq!(&got[..], &7u32.to_be_bytes());
    }

    #[tokio::test]
    async fn read_into_drains_buffered_bytes_first() {
        let (a, b) = StreamTransport::pair();
        a.write_message(b"abcdef", None).await.unwrap();
        // Force "abcdef" into the pending buffer, consume only "ab".
        b.peek_u32().await.unwrap();
        let head = b.take(2).await.unwrap();
        assert_eq!(&head[..], b"ab");
        let mut rest = [0u8; 4];
        b.read_into(&mut rest).await.unwrap();
        assert_eq!(&rest, b"cdef");
    }

    #[tokio::test]
    async fn shutdown_fails_blocked_reads() {
        let (a, b) = StreamTransport::pair();
        let reader = tokio::spawn(async move { b.take(4).await });
        tokio::task::yield_now().await;
        a.shutdown().await;
        drop(a);
        // The peer half sees EOF once the write side is gone.
        let res = reader.await.unwrap();
        assert!(matches!(res, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_sticky() {
        let (a, _b) = StreamTransport::pair();
        a.shutdown().await;
        a.shutdown().await;
        assert!(a.is_closed());
        assert!(matches!(
            a.write_message(b"x", None).await,
            Err(TransportError::Closed)
        ));
    }
}
