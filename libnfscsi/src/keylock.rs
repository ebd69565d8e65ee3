//! Per-key mutual exclusion.
//!
//! [`KeyLocks`] hands out one async mutex per string key.  Operations on the
//! same key are serialized; operations on different keys never contend.
//! Entries are created on first use and evicted as soon as no holder or
//! waiter references them, so the table stays proportional to the number of
//! keys currently in use.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

/// Registry of per-key locks, owned by the controller.
#[derive(Debug, Default)]
pub struct KeyLocks {
    entries: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    ///
    /// The key is held until the returned guard is dropped or
    /// [`KeyLockGuard::release`]d.
    pub async fn lock(&self, key: &str) -> KeyLockGuard<'_> {
        let guard = PendingLock {
            locks: self,
            key,
            acquire: Some(Box::pin(self.handle(key).lock_owned())),
        }
        .await;
        trace!(key, "key lock acquired");
        KeyLockGuard {
            locks: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// Take `key` only if nobody holds it right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyLockGuard<'_>> {
        let mutex = self.handle(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyLockGuard {
                locks: self,
                key: key.to_owned(),
                guard: Some(guard),
            }),
            // Someone holds the key, so the entry stays.
            Err(_) => None,
        }
    }

    /// Number of keys with a live holder or waiter.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch or create the mutex for `key`.  The clone is taken while the
    /// shard is locked, so it can never race with eviction.
    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn evict_if_unused(&self, key: &str) {
        self.entries
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    fn unlock(&self, key: &str, guard: OwnedMutexGuard<()>) {
        if !self.entries.contains_key(key) {
            warn!(key, "releasing a key lock that the table does not track");
        }
        drop(guard);
        self.evict_if_unused(key);
        trace!(key, "key lock released");
    }
}

type AcquireFuture = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// A waiter queued on one key.
///
/// Dropped unfinished (the caller gave up waiting), it releases its handle
/// and evicts the entry if it was the last reference.
struct PendingLock<'a> {
    locks: &'a KeyLocks,
    key: &'a str,
    acquire: Option<AcquireFuture>,
}

impl Future for PendingLock<'_> {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.acquire.as_mut() {
            Some(acquire) => acquire.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        self.acquire = None;
        self.locks.evict_if_unused(self.key);
    }
}

/// Holds one key of a [`KeyLocks`] table until dropped.
#[derive(Debug)]
pub struct KeyLockGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.locks.unlock(&self.key, guard);
        }
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
