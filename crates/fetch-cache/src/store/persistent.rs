use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::body::ByteStream;
use crate::cache_key::CacheKey;
use crate::content::{ContentStore, Integrity, is_not_found, unix_millis};
use crate::error::StorageError;
use crate::metadata::ResponseMeta;

use super::{Store, StoredResponse};

/// The JSON document stored under the `<key>meta` entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedMeta {
    #[serde(flatten)]
    meta: ResponseMeta,
    /// Milliseconds since the unix epoch after which the entry is treated as missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<u64>,
    /// The blob holding the body. `None` for empty bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    integrity: Option<Integrity>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    empty: bool,
}

impl PersistedMeta {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expiration
            .is_some_and(|expiration| unix_millis(now) >= expiration)
    }
}

/// A [`Store`] that writes responses to a directory on disk.
///
/// Each response is split in two entries of the underlying [`ContentStore`]: `<key>body` holds
/// the raw body bytes and `<key>meta` holds a JSON document with the [`ResponseMeta`], the
/// body integrity and the expiration time.
///
/// Expired entries are never deleted eagerly. They are masked as missing on read and
/// overwritten on the next write.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    content: ContentStore,
    ttl: Option<Duration>,
}

impl PersistentStore {
    /// Creates a store in `dir` whose entries never expire.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            content: ContentStore::new(dir),
            ttl: None,
        }
    }

    /// Creates a store in `dir` whose entries expire `ttl` after they were written.
    ///
    /// A zero `ttl` disables expiration.
    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            content: ContentStore::new(dir),
            ttl: Some(ttl).filter(|ttl| !ttl.is_zero()),
        }
    }

    pub fn dir(&self) -> &Path {
        self.content.root()
    }

    /// The underlying content store.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Deletes all entries of this store.
    pub async fn clear(&self) -> Result<(), StorageError> {
        tracing::debug!(dir = %self.dir().display(), "clearing persistent store");
        self.content.clear().await
    }

    async fn read_meta(&self, key: &CacheKey) -> Result<Option<PersistedMeta>, StorageError> {
        let Some(entry) = self.content.info(&meta_key(key)).await? else {
            return Ok(None);
        };
        let raw = match self.content.read_to_bytes(&entry.integrity).await {
            Ok(raw) => raw,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}

fn body_key(key: &CacheKey) -> String {
    format!("{key}body")
}

fn meta_key(key: &CacheKey) -> String {
    format!("{key}meta")
}

impl Store for PersistentStore {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn get<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, StorageError>> {
        Box::pin(async move {
            let Some(persisted) = self.read_meta(key).await? else {
                tracing::trace!(%key, "persistent store miss");
                return Ok(None);
            };
            if persisted.is_expired(SystemTime::now()) {
                tracing::trace!(%key, "persistent store entry expired");
                return Ok(None);
            }

            let body = match (persisted.integrity, persisted.empty) {
                (_, true) => ByteStream::empty(),
                (Some(integrity), false) => match self.content.read(&integrity).await {
                    Ok(body) => body,
                    Err(e) if is_not_found(&e) => {
                        tracing::warn!(%key, %integrity, "cached body is missing");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                },
                (None, false) => {
                    return Err(StorageError::Malformed(format!(
                        "entry `{key}` has neither a body nor the empty flag"
                    )));
                }
            };
            tracing::trace!(%key, "persistent store hit");

            Ok(Some(StoredResponse {
                body,
                meta: persisted.meta,
            }))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        body: ByteStream,
        meta: ResponseMeta,
    ) -> BoxFuture<'a, Result<StoredResponse, StorageError>> {
        Box::pin(async move {
            let body_key = body_key(key);
            let integrity = match self.content.write(&body_key, body).await {
                Ok(entry) => Some(entry.integrity),
                Err(StorageError::NoDataWritten) => {
                    self.content.remove(&body_key).await?;
                    None
                }
                Err(e) => return Err(e),
            };

            let persisted = PersistedMeta {
                meta,
                expiration: self
                    .ttl
                    .map(|ttl| unix_millis(SystemTime::now() + ttl)),
                integrity,
                empty: integrity.is_none(),
            };
            let raw = serde_json::to_vec(&persisted)?;
            self.content.write_bytes(&meta_key(key), raw).await?;
            tracing::debug!(%key, ?integrity, "stored response on disk");

            let body = match &integrity {
                Some(integrity) => self.content.read(integrity).await?,
                None => ByteStream::empty(),
            };
            Ok(StoredResponse {
                body,
                meta: persisted.meta,
            })
        })
    }

    fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.content.remove(&meta_key(key)).await?;
            self.content.remove(&body_key(key)).await?;
            Ok(())
        })
    }
}
