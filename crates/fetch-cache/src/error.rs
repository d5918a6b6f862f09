use std::error::Error as StdError;
use std::io;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An error that happens during a cache-aware fetch.
///
/// Errors from the transport and the store are passed through unchanged. Nothing is retried
/// and nothing is cached on error.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request body can not be turned into a cache key.
    ///
    /// The attached string names the body shape.
    #[error("unsupported request body type: {0}")]
    UnsupportedBodyType(String),
    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Reading from or writing to the cache store failed.
    #[error("cache storage failed")]
    Storage(#[from] StorageError),
}

/// An error from one of the [`Store`](crate::store::Store) backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("failed to read or write cache metadata")]
    Json(#[from] serde_json::Error),
    /// A content blob did not hash to the digest it is stored under.
    #[error("integrity mismatch: expected {expected}, found {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    /// A content write finished without receiving a single byte.
    ///
    /// This is a recognized condition for empty response bodies, not a failure.
    #[error("no data written")]
    NoDataWritten,
    #[error("malformed cache entry: {0}")]
    Malformed(String),
}

/// Any failure of the underlying transport.
#[derive(Debug, Error)]
#[error("request failed: {source}")]
pub struct TransportError {
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Marks an I/O error of a response body stream as a transport failure.
    ///
    /// Errors that are already marked are passed through unchanged.
    pub fn tag_io(err: io::Error) -> io::Error {
        if err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return err;
        }
        io::Error::new(err.kind(), Self::new(err))
    }

    /// Recovers a transport failure marked with [`tag_io`](Self::tag_io).
    ///
    /// Any other I/O error is handed back as is.
    pub fn from_io(err: io::Error) -> Result<Self, io::Error> {
        if !err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return Err(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Self>()) {
            Some(Ok(err)) => Ok(*err),
            Some(Err(inner)) => Err(io::Error::new(kind, inner)),
            None => Err(kind.into()),
        }
    }

    /// Returns the underlying error.
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.source
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::new(err)
    }
}
