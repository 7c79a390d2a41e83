//! # Cache Manager
//!
//! The cache context owned by the application root. It ties the memory tier,
//! the gated disk tier and the fetch coordinator together; consumers receive a
//! clone instead of reaching for a global.

use std::sync::Arc;

use tracing::info;

use crate::cache::initializer::{CacheInitializer, InitState};
use crate::cache::types::{CacheConfig, CacheKey, CacheStats, CacheStatus};
use crate::decode::PayloadDecoder;
use crate::error::FetchError;
use crate::fetch::FetchCoordinator;
use crate::source::{HttpSource, Source};

/// Cache manager handling both memory and disk caching
pub struct CacheManager<D: PayloadDecoder> {
    coordinator: Arc<FetchCoordinator<D>>,
    config: Arc<CacheConfig>,
}

impl<D: PayloadDecoder> Clone for CacheManager<D> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: PayloadDecoder> CacheManager<D> {
    /// Create a new cache manager. The disk tier is brought up on the first
    /// fetch or an explicit [`start`](Self::start).
    pub fn new(config: CacheConfig, decoder: D) -> Self {
        let initializer = CacheInitializer::new(config.clone());
        let coordinator = FetchCoordinator::new(initializer, config.max_memory_cache_size, decoder);
        Self {
            coordinator: Arc::new(coordinator),
            config: Arc::new(config),
        }
    }

    /// Begin bringing up the disk tier in the background
    pub fn start(&self) {
        self.coordinator.initializer().start();
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &FetchCoordinator<D> {
        &self.coordinator
    }

    pub fn initializer(&self) -> &CacheInitializer {
        self.coordinator.initializer()
    }

    pub async fn fetch(
        &self,
        key: &CacheKey,
        source: Arc<dyn Source>,
    ) -> Result<Arc<D::Payload>, FetchError> {
        self.coordinator.fetch(key, source).await
    }

    pub async fn fetch_with_status(
        &self,
        key: &CacheKey,
        source: Arc<dyn Source>,
    ) -> Result<(Arc<D::Payload>, CacheStatus), FetchError> {
        self.coordinator.fetch_with_status(key, source).await
    }

    /// Fetch the resource at `url`, keyed by the URL itself
    pub async fn fetch_url(
        &self,
        url: &str,
        http: &HttpSource,
    ) -> Result<(Arc<D::Payload>, CacheStatus), FetchError> {
        let key = CacheKey::from_identifier(url);
        self.coordinator
            .fetch_with_status(&key, Arc::new(http.for_url(url)))
            .await
    }

    /// Drop every entry from both tiers
    pub async fn clear(&self) -> InitState {
        self.coordinator.memory().clear();
        let state = self.initializer().clear().await;
        info!("Cache cleared");
        state
    }

    pub fn flush(&self) {
        self.initializer().flush();
    }

    pub fn close(&self) {
        self.initializer().close();
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.coordinator.memory();
        let disk = self.initializer().disk();
        CacheStats {
            memory_entries: memory.len(),
            memory_bytes: memory.weighted_size(),
            memory_max_bytes: memory.max_size(),
            disk_entries: disk.as_ref().map(|d| d.len()),
            disk_bytes: disk.as_ref().map(|d| d.size()),
            disk_max_bytes: self.config.max_disk_cache_size,
        }
    }
}
