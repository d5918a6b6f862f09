//! A response cache that sits in front of an HTTP client.
//!
//! Outgoing requests are fingerprinted into a [`CacheKey`](cache_key::CacheKey), looked up in a
//! pluggable [`Store`](store::Store), and only forwarded to the [`Transport`](transport::Transport)
//! on a miss. Concurrent misses for the same key are collapsed into a single outbound call.
//!
//! The entry point is [`CachingFetch`](fetch::CachingFetch).

#[macro_use]
pub mod metrics;

pub mod body;
pub mod cache_key;
pub mod config;
pub mod content;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod logging;
pub mod metadata;
pub mod request;
pub mod response;
pub mod store;
pub mod transport;

pub use body::ByteStream;
pub use cache_key::{CacheKey, HeaderFlags, KeyFlags};
pub use error::{FetchError, StorageError, TransportError};
pub use fetch::{CacheOptions, CachingFetch, get_cache_key};
pub use metadata::ResponseMeta;
pub use request::{Request, RequestBody, RequestInit, Resource};
pub use response::CachedResponse;
pub use store::memory::MemoryStore;
pub use store::persistent::PersistentStore;
pub use store::{Store, StoredResponse};
pub use transport::{HttpTimeouts, HttpTransport, Transport, TransportResponse};
