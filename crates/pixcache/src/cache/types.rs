//! # Cache Types
//!
//! This module defines common types used across the caching system.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Length of a [`CacheKey`] in characters (hex-encoded SHA-256)
pub const CACHE_KEY_LEN: usize = 64;

/// Where a fetched payload was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Found in the memory tier
    MemoryHit,
    /// Found in the disk tier and promoted to memory
    DiskHit,
    /// Produced by the source and written through both tiers
    Populated,
    /// Produced by the source but not persisted
    Uncached,
}

/// Fixed-length, filesystem-safe key derived from an opaque identifier.
///
/// Equal identifiers always hash to the same key. Two identifiers that collide
/// alias the same cache slot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from an identifier such as a source URL
    pub fn from_identifier(identifier: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept an already-derived key, e.g. one read back from the journal
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == CACHE_KEY_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.0).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for the cache system
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether the disk tier is used at all
    pub enabled: bool,
    /// Path for disk cache storage
    pub disk_cache_path: Option<PathBuf>,
    /// Maximum size of disk cache in bytes
    pub max_disk_cache_size: u64,
    /// Maximum size of memory cache in bytes
    pub max_memory_cache_size: u64,
}

impl CacheConfig {
    /// The configured cache directory, or a folder under the system temp dir
    pub fn resolved_disk_path(&self) -> PathBuf {
        self.disk_cache_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pixcache"))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disk_cache_path: None, // If None, we'll use system temp dir
            max_disk_cache_size: 50 * 1024 * 1024, // 50MB
            max_memory_cache_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Point-in-time counters for both tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_max_bytes: u64,
    /// `None` when the disk tier is unavailable
    pub disk_entries: Option<usize>,
    pub disk_bytes: Option<u64>,
    pub disk_max_bytes: u64,
}
