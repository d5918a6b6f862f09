//! A content-addressable blob store on the local filesystem.
//!
//! The layout below the root directory is:
//!
//! ```text
//! <root>/content/sha256/<aa>/<bb>/<rest of digest>   blobs, named by their digest
//! <root>/index/<aa>/<sha256 of key>                  JSON index entries, one per key
//! <root>/tmp/                                        in-progress writes
//! ```
//!
//! All writes first go to a temporary file that is atomically persisted into place, so
//! readers never observe partially written blobs or index entries. Identical content written
//! under different keys is stored only once.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::body::ByteStream;
use crate::error::StorageError;

const INTEGRITY_PREFIX: &str = "sha256-";

/// The SHA-256 digest of a blob, rendered as `sha256-<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Integrity {
    digest: [u8; 32],
}

impl Integrity {
    /// Computes the integrity of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(data).into(),
        }
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            digest: hasher.finalize().into(),
        }
    }

    fn hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{INTEGRITY_PREFIX}{}", self.hex())
    }
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Integrity({self})")
    }
}

impl FromStr for Integrity {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StorageError::Malformed(format!("invalid integrity `{s}`"));

        let hex_digest = s.strip_prefix(INTEGRITY_PREFIX).ok_or_else(malformed)?;
        let mut digest = [0u8; 32];
        hex::decode_to_slice(hex_digest, &mut digest).map_err(|_| malformed())?;
        Ok(Self { digest })
    }
}

impl Serialize for Integrity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Integrity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An index entry, mapping a key to the blob stored for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub integrity: Integrity,
    pub size: u64,
    /// Milliseconds since the unix epoch at which the entry was written.
    pub time: u64,
}

/// Milliseconds since the unix epoch.
pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Moves `temp_file` to `path`, creating missing parent directories.
async fn persist_tempfile(temp_file: NamedTempFile, path: PathBuf) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::task::spawn_blocking(move || temp_file.persist(path).map(drop).map_err(|e| e.error))
        .await
        .map_err(io::Error::other)?
}

pub(crate) fn is_not_found(err: &StorageError) -> bool {
    matches!(err, StorageError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

/// A content-addressable blob store rooted in a single directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_path(&self, integrity: &Integrity) -> PathBuf {
        let hex = integrity.hex();
        self.root
            .join("content")
            .join("sha256")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex[4..])
    }

    fn index_path(&self, key: &str) -> PathBuf {
        let hex = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join("index").join(&hex[..2]).join(&hex)
    }

    /// Creates a new temporary file next to the final destination, so it can be moved into
    /// place atomically.
    ///
    /// Returns the file together with an async handle for writing to it.
    async fn tempfile(&self) -> io::Result<(NamedTempFile, File)> {
        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let (temp_file, file) = tokio::task::spawn_blocking(move || {
            let temp_file = NamedTempFile::new_in(tmp_dir)?;
            let file = temp_file.reopen()?;
            io::Result::Ok((temp_file, file))
        })
        .await
        .map_err(io::Error::other)??;
        Ok((temp_file, File::from_std(file)))
    }

    /// Drains `stream` into a new blob and points `key` at it.
    ///
    /// Fails with [`StorageError::NoDataWritten`] if the stream did not yield a single byte. In
    /// that case, nothing is written and any previous entry for `key` stays untouched.
    pub async fn write(
        &self,
        key: &str,
        mut stream: ByteStream,
    ) -> Result<IndexEntry, StorageError> {
        let (temp_file, mut file) = self.tempfile().await?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if size == 0 {
            return Err(StorageError::NoDataWritten);
        }

        let integrity = Integrity::from_hasher(hasher);
        let content_path = self.content_path(&integrity);
        if tokio::fs::try_exists(&content_path).await? {
            tracing::trace!(%integrity, "content already stored");
        } else {
            persist_tempfile(temp_file, content_path).await?;
        }

        let entry = IndexEntry {
            key: key.to_owned(),
            integrity,
            size,
            time: unix_millis(SystemTime::now()),
        };
        self.write_index(&entry).await?;
        tracing::trace!(key, %integrity, size, "wrote content entry");

        Ok(entry)
    }

    /// Writes `data` as a new blob and points `key` at it.
    pub async fn write_bytes(
        &self,
        key: &str,
        data: impl Into<Bytes>,
    ) -> Result<IndexEntry, StorageError> {
        self.write(key, ByteStream::from_bytes(data)).await
    }

    async fn write_index(&self, entry: &IndexEntry) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(entry)?;
        let (temp_file, mut file) = self.tempfile().await?;
        file.write_all(&raw).await?;
        file.flush().await?;
        drop(file);
        persist_tempfile(temp_file, self.index_path(&entry.key)).await?;
        Ok(())
    }

    /// Looks up the index entry for `key`.
    pub async fn info(&self, key: &str) -> Result<Option<IndexEntry>, StorageError> {
        let raw = match tokio::fs::read(self.index_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: IndexEntry = serde_json::from_slice(&raw)?;

        // index files are named by a digest of the key
        if entry.key != key {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Opens a stream over the blob with the given `integrity`.
    ///
    /// The content is hashed while being read. If it does not match `integrity`, the stream
    /// ends with an [`io::ErrorKind::InvalidData`] error.
    pub async fn read(&self, integrity: &Integrity) -> Result<ByteStream, StorageError> {
        let file = File::open(self.content_path(integrity)).await?;
        Ok(ByteStream::new(VerifyingStream {
            inner: ReaderStream::new(file),
            hasher: Some(Sha256::new()),
            expected: *integrity,
        }))
    }

    /// Reads the complete blob with the given `integrity`.
    pub async fn read_to_bytes(&self, integrity: &Integrity) -> Result<Bytes, StorageError> {
        let data = tokio::fs::read(self.content_path(integrity)).await?;
        let actual = Integrity::compute(&data);
        if actual != *integrity {
            return Err(StorageError::IntegrityMismatch {
                expected: integrity.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data.into())
    }

    /// Checks whether the blob with the given `integrity` exists and is intact.
    pub async fn verify(&self, integrity: &Integrity) -> Result<bool, StorageError> {
        match self.read_to_bytes(integrity).await {
            Ok(_) => Ok(true),
            Err(StorageError::IntegrityMismatch { .. }) => Ok(false),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes the index entry for `key`.
    ///
    /// The blob itself is left in place, as other keys may point to the same content.
    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.index_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes everything below the root directory.
    pub async fn clear(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hashes a blob while it streams, failing at the end if the digest does not match.
struct VerifyingStream {
    inner: ReaderStream<File>,
    /// `None` once the digest has been checked.
    hasher: Option<Sha256>,
    expected: Integrity,
}

impl Stream for VerifyingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                let Some(hasher) = this.hasher.take() else {
                    return Poll::Ready(None);
                };
                let actual = Integrity::from_hasher(hasher);
                if actual == this.expected {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("integrity mismatch: expected {}, found {actual}", this.expected),
                    ))))
                }
            }
            other => other,
        }
    }
}
