//! # Cache Providers
//!
//! The two storage tiers: a bounded in-process LRU of decoded payloads and a
//! bounded, journaled blob store on local disk.

pub use self::disk::{
    DiskCache, NO_MEDIA_MARKER, ReadHandle, WriteOutcome, WriteTransaction, WriteWatch,
};
pub use self::memory::MemoryCache;

pub mod disk;
pub mod memory;
