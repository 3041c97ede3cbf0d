use crate::error::Result;
use crate::router::types::{MergedResult, NormalizedQuery};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub index: String,
    pub generation: u64,
    pub query: NormalizedQuery,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that waited on another request's computation.
    pub coalesced: u64,
    pub entries: usize,
}

type Flight = Arc<OnceCell<Result<Arc<MergedResult>>>>;

pub struct QueryCache {
    entries: Mutex<LruCache<CacheKey, Arc<MergedResult>>>,
    in_flight: DashMap<CacheKey, Flight>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Cached result for `key`, refreshing its recency.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<MergedResult>> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns the cached result or runs `compute`. While one caller computes
    /// a key, other callers for the same key wait for its outcome. Partial
    /// results and results from lagging copies are handed out but never
    /// stored.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<Arc<MergedResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MergedResult>>,
    {
        if let Some(hit) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let flight = {
            let entry = self.in_flight.entry(key.clone());
            if matches!(entry, dashmap::mapref::entry::Entry::Occupied(_)) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            entry.or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let outcome = flight
            .get_or_init(|| async {
                // Another flight may have finished between the lookup and now
                if let Some(hit) = self.lookup(&key) {
                    return Ok(hit);
                }
                let result = compute().await.map(Arc::new);
                if let Ok(merged) = &result
                    && !merged.partial
                    && !merged.behind
                {
                    self.entries.lock().put(key.clone(), merged.clone());
                }
                result
            })
            .await
            .clone();

        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &flight));
        outcome
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
