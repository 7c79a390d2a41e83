//! # Memory Cache Provider
//!
//! This module provides a size-accounted, strict LRU in-memory cache of decoded
//! payloads. Every `get` counts as an access.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::types::CacheKey;

/// Entry in the memory cache
struct CacheEntry<V> {
    /// Decoded payload
    value: Arc<V>,
    /// Accounted size in bytes
    size: u64,
}

struct Inner<V> {
    entries: LruCache<CacheKey, CacheEntry<V>>,
    weighted_size: u64,
}

/// Memory cache provider implementation using a strict LRU list
pub struct MemoryCache<V> {
    inner: Mutex<Inner<V>>,
    /// Maximum size for this cache in bytes
    max_size: u64,
}

impl<V> MemoryCache<V> {
    /// Create a new memory cache with the specified size limit
    pub fn new(max_size_bytes: u64) -> Self {
        debug!(max_size = max_size_bytes, "Memory cache created with size limit");

        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                weighted_size: 0,
            }),
            max_size: max_size_bytes,
        }
    }

    /// Look up a payload and mark it as most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert a payload of the given accounted size.
    ///
    /// The first writer wins: an existing entry is left untouched. An entry
    /// larger than the whole cache is silently skipped. Returns whether the
    /// entry was inserted.
    pub fn put(&self, key: CacheKey, value: Arc<V>, size: u64) -> bool {
        if size > self.max_size {
            warn!(
                key = %key,
                size = size,
                max_size = self.max_size,
                "Entry too large for memory cache, skipping"
            );
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.entries.contains(&key) {
            return false;
        }

        while inner.weighted_size + size > self.max_size {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.weighted_size -= evicted.size;
                    debug!(key = %evicted_key, size = evicted.size, "Evicted entry from memory cache");
                }
                None => break,
            }
        }

        inner.entries.put(key, CacheEntry { value, size });
        inner.weighted_size += size;
        true
    }

    /// Remove a key; returns whether it was present
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.weighted_size -= entry.size;
                debug!(key = %key, "Removed entry from memory cache");
                true
            }
            None => false,
        }
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.weighted_size = 0;
        debug!("Memory cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the accounted sizes of all entries
    pub fn weighted_size(&self) -> u64 {
        self.inner.lock().weighted_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}
