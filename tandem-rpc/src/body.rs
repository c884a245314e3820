//! Embedded bodies carried after a frame.
//!
//! An inbound body is exposed as a [`BodyReader`], a length-limited view
//! over the connection's read half. While a `BodyReader` is alive it owns
//! the read half; the receive loop gets it back through a one-shot release
//! once the view is drained, closed or dropped.
//!
//! An outbound body is an [`OutboundBody`]: any reader plus the exact number
//! of bytes it will produce, copied onto the write half after its frame.

use crate::config::MIN_COPY_BUFFER_SIZE;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tandem_protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf, Take};
use tokio::sync::oneshot;

/// Boxed read half of a connection stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half handed back by a released [`BodyReader`].
pub struct ReleasedReader {
    pub reader: BoxReader,
    /// Body bytes nobody read; they still sit ahead of the next frame.
    pub remaining: u64,
}

impl fmt::Debug for ReleasedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleasedReader")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

/// Receives the read half back from a [`BodyReader`].
pub type BodyRelease = oneshot::Receiver<ReleasedReader>;

/// A forward-only, length-limited view over an inbound body.
///
/// Reads return end-of-file once `len()` bytes have been produced. The
/// underlying stream ending first is reported as `UnexpectedEof`. The view
/// releases the read half as soon as the last byte is read, or when it is
/// closed or dropped.
pub struct BodyReader {
    inner: Option<Take<BoxReader>>,
    length: u64,
    release: Option<oneshot::Sender<ReleasedReader>>,
}

impl BodyReader {
    /// Wraps `reader` so that exactly `length` bytes can be read from it.
    pub fn new(reader: BoxReader, length: u64) -> (Self, BodyRelease) {
        let (tx, rx) = oneshot::channel();
        let mut body = Self {
            inner: Some(reader.take(length)),
            length,
            release: Some(tx),
        };
        if length == 0 {
            body.release();
        }
        (body, rx)
    }

    /// A body backed by bytes already in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        let reader: BoxReader = Box::new(io::Cursor::new(data));
        Self {
            inner: Some(reader.take(length)),
            length,
            release: None,
        }
    }

    /// Total body length announced on the wire.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes not yet read. Zero once released.
    pub fn remaining(&self) -> u64 {
        self.inner.as_ref().map_or(0, Take::limit)
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    /// Reads the rest of the body into memory.
    pub async fn read_to_bytes(mut self) -> io::Result<Bytes> {
        // Cap the up-front reservation; the announced length is peer data.
        let mut buf = Vec::with_capacity(self.remaining().min(1 << 20) as usize);
        self.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Stops reading and hands the read half back. Unread bytes are
    /// discarded by the connection.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            let remaining = inner.limit();
            let reader = inner.into_inner();
            if let Some(tx) = self.release.take() {
                // The connection may be gone already.
                let _ = tx.send(ReleasedReader { reader, remaining });
            }
        }
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut *inner).poll_read(cx, buf))?;
        let read = buf.filled().len() - before;

        if read == 0 && inner.limit() > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended with {} of {} body bytes unread",
                    inner.limit(),
                    this.length
                ),
            )));
        }
        if inner.limit() == 0 {
            this.release();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("length", &self.length)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// A body to be written after an outbound frame.
pub struct OutboundBody {
    reader: BoxReader,
    length: u64,
}

impl OutboundBody {
    /// A body of exactly `length` bytes read from `reader`.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, length: u64) -> Self {
        Self {
            reader: Box::new(reader),
            length,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        Self::new(io::Cursor::new(data), length)
    }

    /// A body streaming the whole file at `path`.
    pub async fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        Ok(Self::new(file, length))
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Copies exactly `len()` bytes onto `writer`.
    ///
    /// `buffer_size` is raised to [`MIN_COPY_BUFFER_SIZE`] if smaller. A
    /// source that ends early yields `TruncatedBody`; the bytes already
    /// written cannot be taken back.
    pub async fn copy_to<W>(self, writer: &mut W, buffer_size: usize) -> Result<u64, ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let expected = self.length;
        let capacity = buffer_size.max(MIN_COPY_BUFFER_SIZE);
        let mut source = BufReader::with_capacity(capacity, self.reader.take(expected));
        let copied = tokio::io::copy_buf(&mut source, writer).await?;
        if copied < expected {
            return Err(ProtocolError::TruncatedBody {
                expected,
                actual: copied,
            });
        }
        Ok(copied)
    }
}

impl From<Bytes> for OutboundBody {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for OutboundBody {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBody")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
