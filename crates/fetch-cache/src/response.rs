use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::body::ByteStream;
use crate::cache_key::CacheKey;
use crate::error::StorageError;
use crate::metadata::ResponseMeta;
use crate::store::Store;

/// Removes a single entry from the store it was read from or written to.
#[derive(Clone)]
pub struct Evictor {
    store: Arc<dyn Store>,
    key: CacheKey,
}

impl Evictor {
    pub(crate) fn new(store: Arc<dyn Store>, key: CacheKey) -> Self {
        Self { store, key }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Removes the entry, so the next fetch for the same key goes to the network.
    pub async fn evict(&self) -> Result<(), StorageError> {
        tracing::debug!(key = %self.key, store = self.store.name(), "evicting cache entry");
        self.store.remove(&self.key).await?;
        metric!(counter("cache.evict") += 1, "store" => self.store.name());
        Ok(())
    }
}

impl fmt::Debug for Evictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evictor")
            .field("store", &self.store.name())
            .field("key", &self.key)
            .finish()
    }
}

/// A response returned by [`CachingFetch::fetch`](crate::fetch::CachingFetch::fetch).
///
/// The body is read back from the store, whether the entry was found there or has just been
/// written. Responses to `no-store` requests carry the transport body as it arrived.
#[derive(Debug)]
pub struct CachedResponse {
    meta: ResponseMeta,
    body: ByteStream,
    from_cache: bool,
    evictor: Evictor,
}

impl CachedResponse {
    pub(crate) fn new(
        meta: ResponseMeta,
        body: ByteStream,
        from_cache: bool,
        evictor: Evictor,
    ) -> Self {
        Self {
            meta,
            body,
            from_cache,
            evictor,
        }
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn status_text(&self) -> &str {
        &self.meta.status_text
    }

    pub fn ok(&self) -> bool {
        self.meta.ok()
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn headers(&self) -> &std::collections::BTreeMap<String, Vec<String>> {
        &self.meta.headers
    }

    /// Returns the first value of the header `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta.header(name)
    }

    /// The body size declared by the server, if any.
    pub fn size(&self) -> Option<u64> {
        self.meta.size
    }

    pub fn redirected(&self) -> bool {
        self.meta.redirected()
    }

    /// Whether this response was served from the cache instead of the network.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn key(&self) -> &CacheKey {
        self.evictor.key()
    }

    /// A handle that can remove this entry from the cache after the body was consumed.
    pub fn evictor(&self) -> Evictor {
        self.evictor.clone()
    }

    /// Removes this entry from the cache.
    pub async fn evict(&self) -> Result<(), StorageError> {
        self.evictor.evict().await
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Reads the complete body.
    pub async fn bytes(self) -> Result<Bytes, StorageError> {
        Ok(self.body.collect().await?)
    }

    /// Reads the complete body as text, replacing invalid UTF-8 sequences.
    pub async fn text(self) -> Result<String, StorageError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
