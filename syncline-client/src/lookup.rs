//! Batched, coalescing lookup cache for auxiliary metadata such as author
//! profiles.
//!
//! `resolve` answers from an LRU when it can. Misses join a pending batch that
//! is flushed as one bulk request when the batch window elapses; callers asking
//! for a key that is already pending or in flight share its result. Not-found
//! answers are cached, transport failures are not.

use crate::lru::LruCache;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use syncline_core::{config::LookupConfig, SyncResult};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<V> {
    Found(V),
    /// The source answered and does not know the key.
    NotFound,
    /// The batch request failed; a later resolve retries.
    Unavailable,
}

impl<V> Resolved<V> {
    pub fn found(self) -> Option<V> {
        match self {
            Resolved::Found(value) => Some(value),
            _ => None,
        }
    }
}

pub trait BulkLookup<K, V>: Send + Sync {
    /// Keys missing from the returned map are treated as not found.
    fn lookup(&self, keys: Vec<K>) -> BoxFuture<'_, SyncResult<HashMap<K, V>>>;
}

type Waiters<V> = Vec<oneshot::Sender<Resolved<V>>>;

struct State<K, V> {
    cache: LruCache<K, Resolved<V>>,
    pending: HashMap<K, Waiters<V>>,
    in_flight: HashMap<K, Waiters<V>>,
    timer_armed: bool,
    batches_sent: usize,
}

struct Inner<K, V> {
    source: Arc<dyn BulkLookup<K, V>>,
    window: Duration,
    state: Mutex<State<K, V>>,
}

impl<K, V> Inner<K, V> {
    fn state(&self) -> MutexGuard<'_, State<K, V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LookupCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LookupCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> LookupCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn BulkLookup<K, V>>, capacity: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                window,
                state: Mutex::new(State {
                    cache: LruCache::new(capacity),
                    pending: HashMap::new(),
                    in_flight: HashMap::new(),
                    timer_armed: false,
                    batches_sent: 0,
                }),
            }),
        }
    }

    pub fn from_config(source: Arc<dyn BulkLookup<K, V>>, config: &LookupConfig) -> Self {
        Self::new(source, config.capacity, config.batch_window())
    }

    pub async fn resolve(&self, key: K) -> Resolved<V> {
        let rx = {
            let mut state = self.inner.state();
            if let Some(hit) = state.cache.get(&key) {
                return hit.clone();
            }

            let (tx, rx) = oneshot::channel();
            if let Some(waiters) = state.in_flight.get_mut(&key) {
                waiters.push(tx);
            } else {
                state.pending.entry(key).or_default().push(tx);
                if !state.timer_armed {
                    state.timer_armed = true;
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(flush_after_window(inner));
                }
            }
            rx
        };
        rx.await.unwrap_or(Resolved::Unavailable)
    }

    /// Cache-only read; never triggers a lookup.
    pub fn peek(&self, key: &K) -> Option<Resolved<V>> {
        self.inner.state().cache.peek(key).cloned()
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.inner.state().cache.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.state().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bulk requests issued so far.
    pub fn batches_sent(&self) -> usize {
        self.inner.state().batches_sent
    }
}

async fn flush_after_window<K, V>(inner: Arc<Inner<K, V>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::time::sleep(inner.window).await;

    let keys: Vec<K> = {
        let mut state = inner.state();
        state.timer_armed = false;
        let pending = std::mem::take(&mut state.pending);
        let keys = pending.keys().cloned().collect::<Vec<_>>();
        for (key, waiters) in pending {
            state.in_flight.entry(key).or_default().extend(waiters);
        }
        if !keys.is_empty() {
            state.batches_sent += 1;
        }
        keys
    };
    if keys.is_empty() {
        return;
    }

    tracing::debug!("Lookup batch of {} key(s)", keys.len());
    let result = inner.source.lookup(keys.clone()).await;

    let mut state = inner.state();
    match result {
        Ok(mut found) => {
            for key in keys {
                let value = match found.remove(&key) {
                    Some(value) => Resolved::Found(value),
                    None => Resolved::NotFound,
                };
                state.cache.put(key.clone(), value.clone());
                for waiter in state.in_flight.remove(&key).unwrap_or_default() {
                    let _ = waiter.send(value.clone());
                }
            }
        }
        Err(err) => {
            tracing::warn!("Lookup batch of {} key(s) failed: {}", keys.len(), err);
            for key in keys {
                for waiter in state.in_flight.remove(&key).unwrap_or_default() {
                    let _ = waiter.send(Resolved::Unavailable);
                }
            }
        }
    }
}
