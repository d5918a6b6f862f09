use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::body::ByteStream;
use crate::cache_key::CacheKey;
use crate::error::StorageError;
use crate::metadata::ResponseMeta;

use super::{Store, StoredResponse};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct MemoryItem {
    /// How long after its last write this item stays alive.
    ttl: Option<Duration>,
    body: Bytes,
    meta: ResponseMeta,
}

type InMemoryCache = moka::future::Cache<CacheKey, MemoryItem>;

/// A struct implementing [`moka::Expiry`] that uses the [`MemoryItem`] TTL as the explicit
/// expiration time.
///
/// Every write schedules a fresh expiration, replacing whatever was pending for the same key.
struct CacheExpiration;

impl moka::Expiry<CacheKey, MemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &MemoryItem,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &MemoryItem,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// A [`Store`] that keeps responses in process memory.
///
/// Bodies are buffered completely on [`set`](Store::set). With a TTL configured, every entry is
/// removed once the TTL has elapsed since it was last written.
#[derive(Clone)]
pub struct MemoryStore {
    cache: InMemoryCache,
    ttl: Option<Duration>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryStore {
    /// Creates an unbounded store whose entries never expire.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Creates an unbounded store whose entries expire `ttl` after they were written.
    ///
    /// A zero `ttl` disables expiration.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::build(Some(ttl), None)
    }

    /// Creates a store from optional settings.
    ///
    /// `max_capacity` bounds the total size of all bodies in bytes. When exceeded, the least
    /// recently used entries are evicted.
    pub fn build(ttl: Option<Duration>, max_capacity: Option<u64>) -> Self {
        let ttl = ttl.filter(|ttl| !ttl.is_zero());

        let mut builder = InMemoryCache::builder()
            .name("fetch_cache")
            .expire_after(CacheExpiration);
        if let Some(max_capacity) = max_capacity {
            builder = builder
                .max_capacity(max_capacity)
                // NOTE: we count all the bookkeeping structures to the weight as well
                .weigher(|_k, v: &MemoryItem| {
                    let size = std::mem::size_of::<(CacheKey, MemoryItem)>() + v.body.len();
                    u32::try_from(size).unwrap_or(u32::MAX)
                });
        }

        Self {
            cache: builder.build(),
            ttl,
        }
    }

    /// The number of entries currently held, including ones pending removal.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, StorageError>> {
        Box::pin(async move {
            let Some(item) = self.cache.get(key).await else {
                tracing::trace!(%key, "memory store miss");
                return Ok(None);
            };
            tracing::trace!(%key, "memory store hit");

            Ok(Some(StoredResponse {
                body: ByteStream::from_bytes(item.body),
                meta: item.meta,
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
            let body = body.collect().await?;
            tracing::debug!(%key, size = body.len(), "storing response in memory");

            let item = MemoryItem {
                ttl: self.ttl,
                body: body.clone(),
                meta: meta.clone(),
            };
            self.cache.insert(key.clone(), item).await;

            Ok(StoredResponse {
                body: ByteStream::from_bytes(body),
                meta,
            })
        })
    }

    fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.cache.invalidate(key).await;
            Ok(())
        })
    }
}
