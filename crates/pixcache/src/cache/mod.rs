//! # Cache System
//!
//! Two-tier caching of decoded payloads: an in-memory LRU in front of a
//! persistent, journaled disk store whose bring-up happens asynchronously.

// Module declarations
mod initializer;
mod manager;
pub mod providers;
mod types;

// Re-export primary types from our various modules
pub use initializer::{CacheInitializer, InitState};
pub use manager::CacheManager;
pub use types::{CACHE_KEY_LEN, CacheConfig, CacheKey, CacheStats, CacheStatus};

pub use providers::{DiskCache, MemoryCache, ReadHandle, WriteOutcome, WriteTransaction, WriteWatch};
