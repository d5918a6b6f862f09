//! Pluggable storage for cached responses.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`](memory::MemoryStore) keeps fully buffered bodies in process memory.
//! - [`PersistentStore`](persistent::PersistentStore) writes bodies and metadata into a
//!   content-addressable [`ContentStore`](crate::content::ContentStore) on disk.
//!
//! Both backends share the same contract:
//!
//! - [`Store::get`] returns `None` for missing or expired entries, it never fails because an
//!   entry does not exist.
//! - [`Store::set`] fully drains the given body before returning, and hands back a *fresh*
//!   stream of the stored bytes, as the input stream is exhausted by then.
//! - [`Store::remove`] is idempotent.

use futures::future::BoxFuture;

use crate::body::ByteStream;
use crate::cache_key::CacheKey;
use crate::error::StorageError;
use crate::metadata::ResponseMeta;

pub mod memory;
pub mod persistent;

/// A response as it was read back from a [`Store`].
#[derive(Debug)]
pub struct StoredResponse {
    pub body: ByteStream,
    pub meta: ResponseMeta,
}

pub trait Store: Send + Sync + 'static {
    /// A short name of the backend, used for logging and metrics.
    fn name(&self) -> &'static str;

    /// Looks up the entry for `key`.
    fn get<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, StorageError>>;

    /// Stores `body` and `meta` under `key`, replacing any previous entry.
    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        body: ByteStream,
        meta: ResponseMeta,
    ) -> BoxFuture<'a, Result<StoredResponse, StorageError>>;

    /// Removes the entry for `key`, if there is one.
    fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<(), StorageError>>;
}
