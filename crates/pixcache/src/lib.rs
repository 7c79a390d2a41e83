//! # Pixcache
//!
//! A two-tier cache for image payloads with a get-or-populate fetch pipeline
//! and resumable HTTP transfers.
//!
//! ## Features
//!
//! - Size-bounded strict LRU memory tier of decoded payloads
//! - Journaled, size-bounded disk tier with transactional writes
//! - At most one populate per key among concurrent fetches
//! - Byte-range resumption of interrupted downloads with progress events
//!
//! ```no_run
//! use pixcache_engine::{CacheConfig, CacheManager, HttpSource, ImageDecoder, ResumableTransfer, TransferConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheManager::new(CacheConfig::default(), ImageDecoder);
//! let transfer = ResumableTransfer::from_config(TransferConfig::default())?;
//! let http = HttpSource::new(transfer, std::env::temp_dir().join("pixcache-staging"));
//!
//! let (image, status) = cache.fetch_url("https://example.com/a.png", &http).await?;
//! println!("{}x{} ({status:?})", image.width, image.height);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod decode;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod source;
pub mod transfer;

pub use builder::TransferConfigBuilder;
pub use cache::{
    CacheConfig, CacheInitializer, CacheKey, CacheManager, CacheStats, CacheStatus, DiskCache,
    InitState, MemoryCache,
};
pub use config::TransferConfig;
pub use decode::{DecodedImage, ImageDecoder, ImageFormat, PayloadDecoder, RawDecoder};
pub use downloader::create_client;
pub use error::{CacheError, DecodeError, FetchError, InitError, SourceError, TransferError};
pub use fetch::FetchCoordinator;
pub use source::{
    FileStorageMedium, HttpSource, MediumSource, SecondaryStorageMedium, Source, UrlSource,
};
pub use transfer::{
    OnTransferEvent, ProgressTracker, ResumableTransfer, TransferEvent, TransferOutcome,
};
