//! Single-pass byte streams used for request and response bodies.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

/// A lazily produced, finite sequence of bytes that can be consumed exactly once.
///
/// A [`ByteStream`] can not be rewound. Once it has been drained, the only way to get at the
/// same bytes again is to read them back from wherever they were persisted, which is why
/// [`Store::set`](crate::store::Store::set) hands back a fresh stream.
pub struct ByteStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl ByteStream {
    /// Wraps an arbitrary stream of byte chunks.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A stream that yields no bytes at all.
    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// A stream that yields the given buffer as a single chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self::new(stream::once(async move { Ok(bytes) }))
    }

    /// Opens the file at `path` and streams its contents.
    pub async fn from_file(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(ReaderStream::new(file)))
    }

    /// Drains the whole stream into a single buffer.
    pub async fn collect(self) -> io::Result<Bytes> {
        let mut inner = self.inner;
        let mut buf = BytesMut::new();
        while let Some(chunk) = inner.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

impl From<Bytes> for ByteStream {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&'static str> for ByteStream {
    fn from(s: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}
