use std::sync::Arc;
use std::time::Duration;

use fetch_cache::{CacheOptions, CachingFetch, HttpTimeouts, HttpTransport, Store};

pub use fetch_cache_test as test;

/// Creates a [`CachingFetch`] that performs real HTTP requests and caches them in `store`.
pub fn setup_fetch(store: impl Store) -> CachingFetch<HttpTransport> {
    test::setup();

    let timeouts = HttpTimeouts {
        connect: Duration::from_secs(1),
        request: Duration::from_secs(10),
    };
    let transport = HttpTransport::new(timeouts).unwrap();
    CachingFetch::new(Arc::new(store), transport, CacheOptions::default())
}
