//! In-memory cache tier.
//!
//! A byte-budgeted LRU over [`CachedSegment`] values. `get` refreshes the LRU
//! position; eviction runs synchronously inside `put` and hands the evicted
//! entries back to the caller so the tiered facade can demote them to disk.
//!
//! Values larger than the whole budget never enter this tier; the facade
//! routes them straight to disk.

use std::sync::Mutex;

use lru::LruCache;
use tracing::trace;

use super::CachedSegment;

pub(crate) struct MemoryCache {
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    map: LruCache<String, CachedSegment>,
    used: u64,
}

impl MemoryCache {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Fetch a segment, promoting it to most-recently-used.
    pub fn get(&self, key: &str) -> Option<CachedSegment> {
        let mut inner = self.lock();
        inner.map.get(key).cloned()
    }

    /// Check presence without touching the LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        inner.map.peek(key).is_some()
    }

    /// Insert a segment and evict down to the byte budget.
    ///
    /// Returns the entries evicted to make room, LRU-first, so the caller can
    /// demote them. Values larger than the budget are rejected (`false` in the
    /// second tuple slot) and must bypass this tier.
    pub fn put(&self, key: &str, segment: CachedSegment) -> (Vec<(String, CachedSegment)>, bool) {
        let incoming = segment.data.len() as u64;
        if incoming > self.budget {
            return (Vec::new(), false);
        }

        let mut inner = self.lock();

        if let Some(old) = inner.map.pop(key) {
            inner.used -= old.data.len() as u64;
        }
        inner.map.put(key.to_string(), segment);
        inner.used += incoming;

        let mut evicted = Vec::new();
        while inner.used > self.budget {
            let Some((victim_key, victim)) = inner.map.pop_lru() else {
                break;
            };
            inner.used -= victim.data.len() as u64;
            trace!(key = %victim_key, bytes = victim.data.len(), "memory tier evict");
            evicted.push((victim_key, victim));
        }

        (evicted, true)
    }

    pub fn remove(&self, key: &str) -> Option<CachedSegment> {
        let mut inner = self.lock();
        let removed = inner.map.pop(key);
        if let Some(seg) = &removed {
            inner.used -= seg.data.len() as u64;
        }
        removed
    }

    /// Drop every entry whose key lives under `fingerprint`.
    pub fn remove_prefix(&self, fingerprint: &str) {
        let prefix = format!("{fingerprint}/");
        let mut inner = self.lock();
        let victims: Vec<String> = inner
            .map
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in victims {
            if let Some(seg) = inner.map.pop(&key) {
                inner.used -= seg.data.len() as u64;
            }
        }
    }

    /// Keys currently resident, MRU-first, without touching the order.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.lock();
        inner.map.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.used = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
