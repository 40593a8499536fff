//! A write-through cache for use in asynchronous contexts where multiple
//! concurrent callers may request the same key and value generation is
//! expensive.
//!
//! Unlike a plain `LruCache`, concurrent misses for the same key are
//! coalesced: the first caller computes the value, and every other caller
//! waiting on the same key is notified via a broadcast channel rather than
//! recomputing. This is the mechanism behind both the module loader's
//! cross-execution cache and the engine facade's metadata/policy snapshot
//! cache.
//!
//! Simplified from the grounding codebase's `async_lru` crate: no CoDel
//! admission queue and no generic `Runtime` abstraction, since this system
//! does not need deterministic-simulation testing of the cache itself. See
//! `DESIGN.md`.

use std::{
    future::Future,
    hash::Hash,
    num::NonZeroUsize,
    sync::Arc,
};

use async_broadcast::{Receiver as BroadcastReceiver, Sender as BroadcastSender};
use lru::LruCache;
use parking_lot::Mutex;

enum Slot<Value> {
    Ready(Arc<Value>),
    Waiting(BroadcastReceiver<Result<Arc<Value>, Arc<anyhow::Error>>>),
}

impl<Value> Clone for Slot<Value> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(v) => Self::Ready(v.clone()),
            Self::Waiting(rx) => Self::Waiting(rx.clone()),
        }
    }
}

struct Inner<Key: Hash + Eq, Value> {
    cache: LruCache<Key, Slot<Value>>,
}

/// A write-through, request-coalescing LRU cache.
pub struct AsyncLru<Key: Hash + Eq, Value> {
    inner: Arc<Mutex<Inner<Key, Value>>>,
    label: &'static str,
}

impl<Key: Hash + Eq, Value> Clone for AsyncLru<Key, Value> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            label: self.label,
        }
    }
}

impl<Key, Value> AsyncLru<Key, Value>
where
    Key: Hash + Eq + Clone + Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    pub fn new(max_size: usize, label: &'static str) -> Self {
        let max_size = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache: LruCache::new(max_size),
            })),
            label,
        }
    }

    /// Returns the cached value for `key`, computing it via `generate` if
    /// absent. Concurrent callers for the same key share one computation.
    pub async fn get_or_try_compute<F, Fut>(
        &self,
        key: Key,
        generate: F,
    ) -> anyhow::Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        enum Action<Value> {
            Ready(Arc<Value>),
            Wait(BroadcastReceiver<Result<Arc<Value>, Arc<anyhow::Error>>>),
            Compute(BroadcastSender<Result<Arc<Value>, Arc<anyhow::Error>>>),
        }

        loop {
            let action = {
                let mut inner = self.inner.lock();
                match inner.cache.get(&key) {
                    Some(Slot::Ready(v)) => Action::Ready(v.clone()),
                    Some(Slot::Waiting(rx)) => Action::Wait(rx.clone()),
                    None => {
                        let (mut tx, rx) = async_broadcast::broadcast(1);
                        tx.set_overflow(true);
                        inner.cache.put(key.clone(), Slot::Waiting(rx));
                        Action::Compute(tx)
                    },
                }
            };
            match action {
                Action::Ready(v) => return Ok(v),
                Action::Wait(mut rx) => match rx.recv().await {
                    Ok(Ok(v)) => return Ok(v),
                    Ok(Err(e)) => anyhow::bail!("{e}"),
                    // The computing caller was dropped/canceled before
                    // publishing a result; retry by becoming the computer.
                    Err(_) => continue,
                },
                Action::Compute(tx) => {
                    let result = generate().await;
                    let mut inner = self.inner.lock();
                    match result {
                        Ok(value) => {
                            let value = Arc::new(value);
                            inner.cache.put(key, Slot::Ready(value.clone()));
                            drop(inner);
                            let _ = tx.broadcast(Ok(value.clone())).await;
                            return Ok(value);
                        },
                        Err(err) => {
                            inner.cache.pop(&key);
                            drop(inner);
                            let shared = Arc::new(err);
                            let _ = tx.broadcast(Err(shared.clone())).await;
                            tracing::debug!(label = self.label, "async_lru compute failed");
                            anyhow::bail!("{shared}");
                        },
                    }
                },
            }
        }
    }

    /// Removes `key` unconditionally, e.g. in response to an invalidation
    /// event. A no-op if the key currently has an in-flight computation;
    /// that computation is left to finish and publish its own (now orphaned)
    /// result, which the next caller will ignore since `get_or_try_compute`
    /// re-checks the cache rather than trusting a stale read.
    pub fn remove(&self, key: &Key) {
        self.inner.lock().cache.pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().cache.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
