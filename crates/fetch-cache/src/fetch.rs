//! The cache-aware fetch orchestration.
//!
//! A fetch goes through the following steps:
//!
//! 1. The request is fingerprinted into a [`CacheKey`]. Requests whose body can not be
//!    fingerprinted fail before anything else happens.
//! 2. The store is consulted. A hit is returned immediately, without taking any lock.
//! 3. On a miss, requests marked `Cache-Control: only-if-cached` resolve to `None`.
//! 4. Otherwise the per-key lock is taken and the store is consulted a second time, as another
//!    caller may have filled the entry while we were waiting.
//! 5. If it is still a miss, the request goes to the [`Transport`], and the response is written
//!    to the store and read back from it.
//!
//! The lock is released on every exit path, including errors and cancellation. Locks are shared
//! by all [`CachingFetch`] instances of the process, so instances over the same store never
//! fetch the same key twice.
//!
//! Requests marked `Cache-Control: no-store` skip the store entirely. They are still
//! fingerprinted in step 1, so the returned response can be evicted like any other, and an
//! opaque stream body fails them with [`FetchError::UnsupportedBodyType`] as well.
//!
//! Failures while reading the response body are reported as [`FetchError::Transport`], even
//! though the body is only drained while being written to the store.

use std::sync::Arc;
use std::time::Instant;

use futures::TryStreamExt;

use crate::body::ByteStream;
use crate::cache_key::{CACHE_FORMAT_VERSION, CacheKey, KeyFlags, derive_key};
use crate::error::{FetchError, StorageError, TransportError};
use crate::lock::KeyedLocks;
use crate::request::{RequestInit, Resource, is_no_store, is_only_if_cached};
use crate::response::{CachedResponse, Evictor};
use crate::store::{Store, StoredResponse};
use crate::transport::{Transport, TransportResponse};

/// Options for a [`CachingFetch`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Selects which request fields contribute to the cache key.
    pub key_flags: KeyFlags,
    /// The cache format version. Changing it invalidates all existing entries.
    pub version: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            key_flags: KeyFlags::default(),
            version: CACHE_FORMAT_VERSION,
        }
    }
}

/// Derives the [`CacheKey`] of a fetch with the default [`KeyFlags`].
///
/// This yields exactly the key [`CachingFetch::fetch`] uses with default [`CacheOptions`].
pub fn get_cache_key(resource: &Resource, init: &RequestInit) -> Result<CacheKey, FetchError> {
    derive_key(resource, init, &KeyFlags::default(), CACHE_FORMAT_VERSION)
}

/// Which lookup produced a cache hit.
#[derive(Clone, Copy, Debug)]
enum HitPhase {
    /// The first lookup, without holding the lock.
    Lookup,
    /// The second lookup, after the lock was acquired.
    Recheck,
}

impl HitPhase {
    fn as_str(self) -> &'static str {
        match self {
            HitPhase::Lookup => "lookup",
            HitPhase::Recheck => "recheck",
        }
    }
}

/// A fetch function backed by a response cache.
///
/// Concurrent fetches for the same key result in at most one call to the transport, all other
/// callers wait and are served from the store afterwards.
pub struct CachingFetch<T> {
    store: Arc<dyn Store>,
    transport: T,
    options: CacheOptions,
    locks: KeyedLocks,
}

impl<T> std::fmt::Debug for CachingFetch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingFetch")
            .field("store", &self.store.name())
            .field("options", &self.options)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> CachingFetch<T> {
    pub fn new(store: Arc<dyn Store>, transport: T, options: CacheOptions) -> Self {
        Self {
            store,
            transport,
            options,
            locks: KeyedLocks::global(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Derives the [`CacheKey`] this instance uses for a fetch.
    pub fn cache_key(
        &self,
        resource: &Resource,
        init: &RequestInit,
    ) -> Result<CacheKey, FetchError> {
        derive_key(resource, init, &self.options.key_flags, self.options.version)
    }

    /// Fetches a resource, serving it from the cache if possible.
    ///
    /// Returns `None` only for `only-if-cached` requests that missed the cache. Errors of the
    /// transport and the store are returned as they are, nothing is cached on error.
    pub async fn fetch(
        &self,
        resource: impl Into<Resource>,
        init: RequestInit,
    ) -> Result<Option<CachedResponse>, FetchError> {
        let resource = resource.into();
        let key = self.cache_key(&resource, &init)?;
        metric!(counter("cache.access") += 1);

        if is_no_store(&resource, &init) {
            tracing::debug!(%key, "bypassing cache for no-store request");
            let response = self.call_transport(&key, resource, init).await?;
            return Ok(Some(CachedResponse::new(
                response.meta,
                response.body,
                false,
                self.evictor(key),
            )));
        }

        if let Some(stored) = self.store.get(&key).await? {
            return Ok(Some(self.hit(stored, key, HitPhase::Lookup)));
        }

        if is_only_if_cached(&resource, &init) {
            tracing::debug!(%key, "only-if-cached request missed the cache");
            metric!(counter("cache.only_if_cached_miss") += 1);
            return Ok(None);
        }

        let _guard = self.locks.lock(key.as_str()).await;

        if let Some(stored) = self.store.get(&key).await? {
            return Ok(Some(self.hit(stored, key, HitPhase::Recheck)));
        }

        tracing::debug!(%key, url = resource.url(), "cache miss");
        metric!(counter("cache.miss") += 1);

        let response = self.call_transport(&key, resource, init).await?;
        let body = ByteStream::new(response.body.map_err(TransportError::tag_io));
        let stored = match self.store.set(&key, body, response.meta).await {
            Ok(stored) => stored,
            Err(StorageError::Io(err)) => {
                return Err(match TransportError::from_io(err) {
                    Ok(err) => {
                        let error = &err as &dyn std::error::Error;
                        tracing::debug!(%key, error, "reading the response body failed");
                        err.into()
                    }
                    Err(err) => StorageError::Io(err).into(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        metric!(counter("store.write") += 1, "store" => self.store.name());

        Ok(Some(CachedResponse::new(
            stored.meta,
            stored.body,
            false,
            self.evictor(key),
        )))
    }

    async fn call_transport(
        &self,
        key: &CacheKey,
        resource: Resource,
        init: RequestInit,
    ) -> Result<TransportResponse, FetchError> {
        let start = Instant::now();
        let result = self.transport.fetch(resource, init).await;
        metric!(timer("transport.duration") = start.elapsed());

        match result {
            Ok(response) => {
                let status = response.meta.status.to_string();
                metric!(counter("transport") += 1, "status" => &status);
                Ok(response)
            }
            Err(err) => {
                tracing::debug!(%key, error = &err as &dyn std::error::Error, "transport failed");
                metric!(counter("transport") += 1, "status" => "error");
                Err(err.into())
            }
        }
    }

    fn hit(&self, stored: StoredResponse, key: CacheKey, phase: HitPhase) -> CachedResponse {
        tracing::trace!(%key, phase = phase.as_str(), "cache hit");
        metric!(counter("cache.hit") += 1, "phase" => phase.as_str());
        CachedResponse::new(stored.meta, stored.body, true, self.evictor(key))
    }

    fn evictor(&self, key: CacheKey) -> Evictor {
        Evictor::new(Arc::clone(&self.store), key)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use futures::future::BoxFuture;

    use super::*;
    use crate::metadata::ResponseMeta;
    use crate::request::{Request, RequestBody};
    use crate::store::memory::MemoryStore;

    /// A transport that answers every request with a body naming the URL and the call number.
    #[derive(Clone, Default)]
    struct MockTransport {
        calls: Arc<AtomicUsize>,
        latency: Duration,
        fail: bool,
        /// Whether the body breaks off after the first chunk.
        broken_body: bool,
    }

    impl MockTransport {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn fetch(
            &self,
            resource: Resource,
            _init: RequestInit,
        ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.latency).await;
                if self.fail {
                    return Err(TransportError::new("connection refused"));
                }

                let body = format!("{} #{call}", resource.url());
                let mut meta = ResponseMeta::new(resource.url(), 200, "OK");
                meta.append_header("content-type", "text/plain");
                meta.size = Some(body.len() as u64);
                let body = if self.broken_body {
                    ByteStream::new(futures::stream::iter([
                        Ok(Bytes::from_static(b"part")),
                        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                    ]))
                } else {
                    ByteStream::from_bytes(body)
                };
                Ok(TransportResponse { meta, body })
            })
        }
    }

    /// A store that reads from memory but fails every write.
    struct ReadOnlyStore(MemoryStore);

    impl Store for ReadOnlyStore {
        fn name(&self) -> &'static str {
            "read-only"
        }

        fn get<'a>(
            &'a self,
            key: &'a CacheKey,
        ) -> BoxFuture<'a, Result<Option<StoredResponse>, StorageError>> {
            self.0.get(key)
        }

        fn set<'a>(
            &'a self,
            _key: &'a CacheKey,
            body: ByteStream,
            _meta: ResponseMeta,
        ) -> BoxFuture<'a, Result<StoredResponse, StorageError>> {
            Box::pin(async move {
                body.collect().await?;
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into())
            })
        }

        fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), StorageError>> {
            self.0.remove(key)
        }
    }

    fn caching_fetch(transport: MockTransport) -> CachingFetch<MockTransport> {
        CachingFetch::new(
            Arc::new(MemoryStore::new()),
            transport,
            CacheOptions::default(),
        )
    }

    fn is_tracked(fetch: &CachingFetch<MockTransport>, url: &str) -> bool {
        let key = fetch
            .cache_key(&url.into(), &RequestInit::default())
            .unwrap();
        fetch.locks.is_tracked(key.as_str())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        let first = fetch
            .fetch("https://example.com/a", RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!first.from_cache());
        assert_eq!(first.status(), 200);
        assert_eq!(first.header("Content-Type"), Some("text/plain"));
        assert_eq!(first.text().await.unwrap(), "https://example.com/a #1");

        let second = fetch
            .fetch("https://example.com/a", RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert!(second.from_cache());
        assert_eq!(second.text().await.unwrap(), "https://example.com/a #1");

        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_ttl_scenario() {
        let transport = MockTransport::default();
        let fetch = CachingFetch::new(
            Arc::new(MemoryStore::with_ttl(Duration::from_millis(500))),
            transport.clone(),
            CacheOptions::default(),
        );
        let get = || fetch.fetch("https://example.com/a", RequestInit::default());

        let first = get().await.unwrap().unwrap();
        assert!(!first.from_cache());
        assert_eq!(transport.calls(), 1);

        let second = get().await.unwrap().unwrap();
        assert!(second.from_cache());
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;

        let third = get().await.unwrap().unwrap();
        assert!(!third.from_cache());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_key_matches_get_cache_key() {
        let fetch = caching_fetch(MockTransport::default());
        let resource = Resource::from("https://example.com/a");
        let init = RequestInit::default().header("accept", "text/plain");

        let expected = get_cache_key(&resource, &init).unwrap();
        assert_eq!(fetch.cache_key(&resource, &init).unwrap(), expected);

        let response = fetch.fetch(resource, init).await.unwrap().unwrap();
        assert_eq!(response.key(), &expected);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let transport = MockTransport {
            latency: Duration::from_millis(100),
            ..Default::default()
        };
        let fetch = caching_fetch(transport.clone());

        let responses = futures::future::join_all(
            (0..10).map(|_| fetch.fetch("https://example.com/single", RequestInit::default())),
        )
        .await;

        let mut from_network = 0;
        for response in responses {
            let response = response.unwrap().unwrap();
            if !response.from_cache() {
                from_network += 1;
            }
            assert_eq!(response.text().await.unwrap(), "https://example.com/single #1");
        }

        assert_eq!(transport.calls(), 1);
        assert_eq!(from_network, 1);
        assert!(!is_tracked(&fetch, "https://example.com/single"));
    }

    #[tokio::test]
    async fn test_single_flight_across_instances() {
        let transport = MockTransport {
            latency: Duration::from_millis(100),
            ..Default::default()
        };
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = CachingFetch::new(store.clone(), transport.clone(), CacheOptions::default());
        let second = CachingFetch::new(store, transport.clone(), CacheOptions::default());

        let url = "https://example.com/shared";
        let (a, b) = futures::join!(
            first.fetch(url, RequestInit::default()),
            second.fetch(url, RequestInit::default()),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        assert_eq!(transport.calls(), 1);
        assert!(a.from_cache() != b.from_cache());
        assert_eq!(b.text().await.unwrap(), "https://example.com/shared #1");
    }

    #[tokio::test]
    async fn test_only_if_cached() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());
        let only_if_cached = || RequestInit::default().header("Cache-Control", "only-if-cached");

        let missed = fetch
            .fetch("https://example.com/a", only_if_cached())
            .await
            .unwrap();
        assert!(missed.is_none());
        assert_eq!(transport.calls(), 0);

        fetch
            .fetch("https://example.com/a", RequestInit::default())
            .await
            .unwrap();

        let hit = fetch
            .fetch("https://example.com/a", only_if_cached())
            .await
            .unwrap()
            .unwrap();
        assert!(hit.from_cache());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_only_if_cached_on_request() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        let request =
            Request::new("https://example.com/a").header("cache-control", "only-if-cached");
        let missed = fetch.fetch(request, RequestInit::default()).await.unwrap();
        assert!(missed.is_none());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_store() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());
        let no_store = || RequestInit::default().header("Cache-Control", "no-store");

        for expected in ["#1", "#2"] {
            let response = fetch
                .fetch("https://example.com/a", no_store())
                .await
                .unwrap()
                .unwrap();
            assert!(!response.from_cache());
            assert!(response.text().await.unwrap().ends_with(expected));
        }

        let key = get_cache_key(&"https://example.com/a".into(), &no_store()).unwrap();
        assert!(fetch.store().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        let response = fetch
            .fetch("https://example.com/a", RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        let evictor = response.evictor();
        assert_eq!(response.text().await.unwrap(), "https://example.com/a #1");
        evictor.evict().await.unwrap();

        let refetched = fetch
            .fetch("https://example.com/a", RequestInit::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!refetched.from_cache());
        assert_eq!(refetched.text().await.unwrap(), "https://example.com/a #2");
    }

    #[tokio::test]
    async fn test_transport_error() {
        let transport = MockTransport {
            fail: true,
            ..Default::default()
        };
        let fetch = caching_fetch(transport.clone());

        let url = "https://example.com/refused";
        let err = fetch.fetch(url, RequestInit::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(err.to_string(), "request failed: connection refused");

        // the lock was released and nothing was cached
        assert!(!is_tracked(&fetch, url));
        let err = fetch
            .fetch(url, RequestInit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_broken_body_is_a_transport_error() {
        let transport = MockTransport {
            broken_body: true,
            ..Default::default()
        };
        let fetch = caching_fetch(transport.clone());

        let url = "https://example.com/broken";
        let err = fetch.fetch(url, RequestInit::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(err.to_string(), "request failed: reset");

        assert!(!is_tracked(&fetch, url));
        let key = fetch.cache_key(&url.into(), &RequestInit::default()).unwrap();
        assert!(fetch.store().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_error() {
        let transport = MockTransport::default();
        let fetch = CachingFetch::new(
            Arc::new(ReadOnlyStore(MemoryStore::new())),
            transport.clone(),
            CacheOptions::default(),
        );

        let url = "https://example.com/read-only";
        for calls in [1, 2] {
            let err = fetch.fetch(url, RequestInit::default()).await.unwrap_err();
            let FetchError::Storage(StorageError::Io(ref io_err)) = err else {
                panic!("unexpected error: {err:?}");
            };
            assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
            assert_eq!(transport.calls(), calls);
            assert!(!is_tracked(&fetch, url));
        }

        let key = fetch.cache_key(&url.into(), &RequestInit::default()).unwrap();
        assert!(fetch.store().get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_store_requires_a_key() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        let init = RequestInit::default()
            .header("Cache-Control", "no-store")
            .body(RequestBody::Stream(ByteStream::from("data")));
        let err = fetch
            .fetch("https://example.com/no-store", init)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::UnsupportedBodyType(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_body() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        let init = RequestInit::default()
            .method("POST")
            .body(RequestBody::Stream(ByteStream::from("data")));
        let err = fetch
            .fetch("https://example.com/a", init)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::UnsupportedBodyType(ref kind) if kind == "stream"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_distinct_requests() {
        let transport = MockTransport::default();
        let fetch = caching_fetch(transport.clone());

        for method in ["GET", "POST"] {
            let init = RequestInit::default().method(method);
            let response = fetch.fetch("https://example.com/a", init).await.unwrap().unwrap();
            assert!(!response.from_cache());
        }
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_lock() {
        let transport = MockTransport {
            latency: Duration::from_secs(10),
            ..Default::default()
        };
        let fetch = caching_fetch(transport.clone());

        let url = "https://example.com/cancelled";
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            fetch.fetch(url, RequestInit::default()),
        )
        .await;
        assert!(result.is_err());
        assert!(!is_tracked(&fetch, url));
    }
}
