//! Per-key mutual exclusion for concurrent fetches.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

static GLOBAL_LOCKS: LazyLock<KeyedLocks> = LazyLock::new(KeyedLocks::new);

/// Drops the entry for `name` if nobody holds or waits for it anymore.
fn prune(locks: &LockMap, name: &str) {
    let mut locks = locks.lock().unwrap();
    if locks
        .get(name)
        .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
    {
        locks.remove(name);
    }
}

/// A set of named asynchronous locks.
///
/// At most one [`KeyLockGuard`] exists per name at any time. Waiters are served in FIFO order.
/// A name is only tracked while someone holds or waits for its lock.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: LockMap,
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("tracked", &self.len())
            .finish()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The locks shared by the whole process.
    ///
    /// Every handle returned from here refers to the same set of names.
    pub fn global() -> Self {
        GLOBAL_LOCKS.clone()
    }

    /// Waits until the lock for `name` is free and takes it.
    ///
    /// The lock is released once the returned guard is dropped.
    pub async fn lock(&self, name: &str) -> KeyLockGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(name.to_owned()).or_default())
        };

        let mut waiter = Waiter {
            name,
            locks: &self.locks,
            acquire: Some(mutex.lock_owned().boxed()),
        };
        let guard = (&mut waiter).await;
        drop(waiter);
        tracing::trace!(name, "acquired key lock");

        KeyLockGuard {
            name: name.to_owned(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Whether the lock for `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        let locks = self.locks.lock().unwrap();
        locks
            .get(name)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Whether `name` has a current holder or waiter.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.locks.lock().unwrap().contains_key(name)
    }

    /// The number of names with a current holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pending acquisition, which cleans up after itself when cancelled.
struct Waiter<'a> {
    name: &'a str,
    locks: &'a LockMap,
    acquire: Option<BoxFuture<'static, OwnedMutexGuard<()>>>,
}

impl Future for Waiter<'_> {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.acquire.as_mut() {
            Some(acquire) => acquire.poll_unpin(cx),
            None => Poll::Pending,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // The pending future holds a reference to the mutex, release it before pruning.
        drop(self.acquire.take());
        prune(self.locks, self.name);
    }
}

/// Holds the lock for a single name, see [`KeyedLocks::lock`].
pub struct KeyLockGuard {
    name: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock, the same as dropping the guard.
    pub fn release(self) {}
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.locks, &self.name);
        tracing::trace!(name = %self.name, "released key lock");
    }
}
