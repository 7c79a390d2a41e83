//! # Fetch Coordinator
//!
//! Get-or-populate over the two cache tiers:
//!
//! 1. Memory hit returns immediately.
//! 2. Wait for the disk tier to finish bring-up.
//! 3. Disk hit is decoded, promoted to memory and returned. Unreadable or
//!    undecodable entries are evicted and treated as a miss.
//! 4. On a miss, open a write transaction and populate it from the source.
//!    When another caller already holds the transaction for the key, wait for
//!    it to resolve, re-check the disk, then try to open a transaction once
//!    more before falling back to a fetch that is not persisted.
//!
//! The populate step runs in its own task, so a cancelled `fetch` never tears
//! down a transaction that serialized waiters depend on.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::cache::providers::{DiskCache, MemoryCache, WriteTransaction};
use crate::cache::{CacheInitializer, CacheKey, CacheStatus};
use crate::decode::PayloadDecoder;
use crate::error::FetchError;
use crate::source::Source;

pub struct FetchCoordinator<D: PayloadDecoder> {
    memory: MemoryCache<D::Payload>,
    initializer: CacheInitializer,
    decoder: Arc<D>,
}

impl<D: PayloadDecoder> FetchCoordinator<D> {
    pub fn new(initializer: CacheInitializer, max_memory_bytes: u64, decoder: D) -> Self {
        Self {
            memory: MemoryCache::new(max_memory_bytes),
            initializer,
            decoder: Arc::new(decoder),
        }
    }

    pub fn memory(&self) -> &MemoryCache<D::Payload> {
        &self.memory
    }

    pub fn initializer(&self) -> &CacheInitializer {
        &self.initializer
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Return the payload for `key`, producing it from `source` on a miss
    pub async fn fetch(
        &self,
        key: &CacheKey,
        source: Arc<dyn Source>,
    ) -> Result<Arc<D::Payload>, FetchError> {
        self.fetch_with_status(key, source)
            .await
            .map(|(payload, _)| payload)
    }

    /// Like [`fetch`](Self::fetch), also reporting which tier served the payload
    #[instrument(level = "debug", skip(self, key, source), fields(key = %key))]
    pub async fn fetch_with_status(
        &self,
        key: &CacheKey,
        source: Arc<dyn Source>,
    ) -> Result<(Arc<D::Payload>, CacheStatus), FetchError> {
        if let Some(payload) = self.memory.get(key) {
            return Ok((payload, CacheStatus::MemoryHit));
        }

        // A concurrent populate may have landed while the disk came up
        let state = self.initializer.wait().await;
        if let Some(payload) = self.memory.get(key) {
            return Ok((payload, CacheStatus::MemoryHit));
        }
        let Some(disk) = state.disk().filter(|disk| !disk.is_closed()).cloned() else {
            debug!("Disk cache unavailable, fetching into memory only");
            return self.fetch_uncached(key, &source).await;
        };

        if let Some(payload) = self.read_disk(&disk, key).await {
            return Ok((payload, CacheStatus::DiskHit));
        }

        if let Some(txn) = disk.begin_write(key).await {
            return self.populate(&disk, txn, source).await;
        }

        // Serialize behind the open transaction, then look again
        if let Some(pending) = disk.pending_write(key) {
            let outcome = pending.resolved().await;
            debug!(?outcome, "Concurrent write resolved");
        }
        if let Some(payload) = self.memory.get(key) {
            return Ok((payload, CacheStatus::MemoryHit));
        }
        if let Some(payload) = self.read_disk(&disk, key).await {
            return Ok((payload, CacheStatus::DiskHit));
        }
        if let Some(txn) = disk.begin_write(key).await {
            return self.populate(&disk, txn, source).await;
        }

        debug!("Key still contended, fetching without persisting");
        self.fetch_uncached(key, &source).await
    }

    /// Read and decode a committed entry, evicting it if it is unusable
    async fn read_disk(&self, disk: &DiskCache, key: &CacheKey) -> Option<Arc<D::Payload>> {
        let handle = disk.get(key).await?;
        let decoded = match handle.read_to_bytes().await {
            Ok(bytes) => self.decoder.decode(bytes).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match decoded {
            Ok(payload) => Some(self.remember(key, payload)),
            Err(reason) => {
                warn!(key = %key, reason = %reason, "Discarding unusable disk cache entry");
                Self::evict(disk, key).await;
                None
            }
        }
    }

    async fn populate(
        &self,
        disk: &DiskCache,
        txn: WriteTransaction,
        source: Arc<dyn Source>,
    ) -> Result<(Arc<D::Payload>, CacheStatus), FetchError> {
        let key = txn.key().clone();
        let task = tokio::spawn(write_through(txn, source));
        let bytes = task
            .await
            .map_err(|e| FetchError::Internal(e.to_string()))??;

        match self.decoder.decode(bytes) {
            Ok(payload) => Ok((self.remember(&key, payload), CacheStatus::Populated)),
            Err(e) => {
                warn!(key = %key, error = %e, "Produced bytes could not be decoded");
                Self::evict(disk, &key).await;
                Err(e.into())
            }
        }
    }

    async fn fetch_uncached(
        &self,
        key: &CacheKey,
        source: &Arc<dyn Source>,
    ) -> Result<(Arc<D::Payload>, CacheStatus), FetchError> {
        let bytes = source.produce(key).await?;
        let payload = self.decoder.decode(bytes)?;
        Ok((self.remember(key, payload), CacheStatus::Uncached))
    }

    fn remember(&self, key: &CacheKey, payload: D::Payload) -> Arc<D::Payload> {
        let size = self.decoder.size_of(&payload);
        let payload = Arc::new(payload);
        self.memory.put(key.clone(), payload.clone(), size);
        payload
    }

    async fn evict(disk: &DiskCache, key: &CacheKey) {
        if let Err(e) = disk.remove(key).await {
            debug!(key = %key, error = %e, "Failed to evict disk cache entry");
        }
    }
}

/// Produce the bytes and publish them through `txn`; any failure aborts it
async fn write_through(mut txn: WriteTransaction, source: Arc<dyn Source>) -> Result<Bytes, FetchError> {
    let bytes = match source.produce(txn.key()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            txn.abort();
            return Err(e.into());
        }
    };

    if let Err(e) = txn.write(&bytes).await {
        txn.abort();
        return Err(e.into());
    }
    txn.commit().await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, InitState};
    use crate::decode::{ImageDecoder, RawDecoder};
    use crate::error::SourceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::Notify;

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
        data: Bytes,
    }

    impl CountingSource {
        fn new(data: &'static [u8]) -> Arc<Self> {
            Self::slow(data, Duration::ZERO)
        }

        fn slow(data: &'static [u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                data: Bytes::from_static(data),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for CountingSource {
        async fn produce(&self, _key: &CacheKey) -> Result<Bytes, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.data.clone())
        }
    }

    /// Fails once released
    struct GatedFailingSource {
        gate: Notify,
    }

    #[async_trait]
    impl Source for GatedFailingSource {
        async fn produce(&self, _key: &CacheKey) -> Result<Bytes, SourceError> {
            self.gate.notified().await;
            Err(SourceError::Generic("upstream unavailable".to_string()))
        }
    }

    fn coordinator(max_disk: u64) -> (FetchCoordinator<RawDecoder>, TempDir) {
        let dir = tempdir().unwrap();
        let init = CacheInitializer::new(CacheConfig {
            enabled: true,
            disk_cache_path: Some(dir.path().join("cache")),
            max_disk_cache_size: max_disk,
            max_memory_cache_size: 1024 * 1024,
        });
        (FetchCoordinator::new(init, 1024 * 1024, RawDecoder), dir)
    }

    async fn disk_of<D: PayloadDecoder>(coordinator: &FetchCoordinator<D>) -> DiskCache {
        match coordinator.initializer().wait().await {
            InitState::Ready(disk) => disk,
            other => panic!("Expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_fetch_does_not_call_source() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let source = CountingSource::new(b"payload");
        let key = CacheKey::from_identifier("https://example.com/a.png");

        let (first, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Populated);

        let (second, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::MemoryHit);
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_rechecked_after_disk_bring_up() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let source = CountingSource::new(b"from source");
        let key = CacheKey::from_identifier("landed-during-bring-up");

        let mut fetch = std::pin::pin!(coordinator.fetch_with_status(&key, source.clone()));
        // The bring-up task cannot run before this task yields
        assert!(futures::poll!(fetch.as_mut()).is_pending());

        coordinator
            .memory()
            .put(key.clone(), Arc::new(Bytes::from_static(b"from peer")), 9);

        let (payload, status) = fetch.await.unwrap();
        assert_eq!(status, CacheStatus::MemoryHit);
        assert_eq!(*payload, "from peer");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_disk_hit_after_memory_eviction() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let source = CountingSource::new(b"payload");
        let key = CacheKey::from_identifier("a");

        coordinator.fetch(&key, source.clone()).await.unwrap();
        coordinator.memory().clear();

        let (payload, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::DiskHit);
        assert_eq!(*payload, "payload");
        assert_eq!(source.calls(), 1);
        // Promoted back into memory
        assert!(coordinator.memory().contains(&key));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_produce_once() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let coordinator = Arc::new(coordinator);
        let source = CountingSource::slow(b"shared", Duration::from_millis(200));
        let key = CacheKey::from_identifier("hot");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                let source = source.clone();
                let key = key.clone();
                tokio::spawn(async move { coordinator.fetch(&key, source).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(*task.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_persists_nothing() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let failing = Arc::new(GatedFailingSource {
            gate: Notify::new(),
        });
        failing.gate.notify_one();
        let key = CacheKey::from_identifier("broken");

        let err = coordinator.fetch(&key, failing).await.unwrap_err();
        assert!(matches!(err, FetchError::Source(_)));

        let disk = disk_of(&coordinator).await;
        assert!(disk.get(&key).await.is_none());
        assert!(disk.pending_write(&key).is_none());

        // The next fetch tries the source again
        let source = CountingSource::new(b"recovered");
        assert_eq!(*coordinator.fetch(&key, source.clone()).await.unwrap(), "recovered");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_waiter_retries_after_failed_writer() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let coordinator = Arc::new(coordinator);
        let key = CacheKey::from_identifier("flaky");
        let disk = disk_of(&coordinator).await;

        let failing = Arc::new(GatedFailingSource {
            gate: Notify::new(),
        });
        let first = {
            let coordinator = coordinator.clone();
            let failing = failing.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.fetch(&key, failing).await })
        };
        while disk.pending_write(&key).is_none() {
            tokio::task::yield_now().await;
        }

        let source = CountingSource::new(b"second");
        let second = {
            let coordinator = coordinator.clone();
            let source = source.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.fetch_with_status(&key, source).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls(), 0);

        failing.gate.notify_one();

        assert!(first.await.unwrap().is_err());
        let (payload, status) = second.await.unwrap().unwrap();
        assert_eq!(*payload, "second");
        assert_eq!(status, CacheStatus::Populated);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_uncached_when_still_contended() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let coordinator = Arc::new(coordinator);
        let key = CacheKey::from_identifier("contended");
        let disk = disk_of(&coordinator).await;

        let blocker = disk.begin_write(&key).await.unwrap();
        let source = CountingSource::new(b"one-shot");
        let waiter = {
            let coordinator = coordinator.clone();
            let source = source.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.fetch_with_status(&key, source).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Release and immediately re-take the key before the waiter runs
        blocker.abort();
        let second_blocker = disk.begin_write(&key).await.unwrap();

        let (payload, status) = waiter.await.unwrap().unwrap();
        assert_eq!(*payload, "one-shot");
        assert_eq!(status, CacheStatus::Uncached);
        assert_eq!(source.calls(), 1);

        drop(second_blocker);
        assert!(disk.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_only_when_disk_unavailable() {
        let (coordinator, _dir) = coordinator(u64::MAX);
        let source = CountingSource::new(b"payload");
        let key = CacheKey::from_identifier("a");

        let (_, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Uncached);
        assert!(matches!(
            coordinator.initializer().state(),
            InitState::Unavailable(_)
        ));

        let (_, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::MemoryHit);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_is_refetched() {
        let dir = tempdir().unwrap();
        let init = CacheInitializer::new(CacheConfig {
            enabled: true,
            disk_cache_path: Some(dir.path().to_path_buf()),
            max_disk_cache_size: 1024 * 1024,
            max_memory_cache_size: 1024 * 1024,
        });
        let coordinator = FetchCoordinator::new(init, 1024 * 1024, ImageDecoder);
        let disk = disk_of(&coordinator).await;
        let key = CacheKey::from_identifier("https://example.com/a.png");

        let mut txn = disk.begin_write(&key).await.unwrap();
        txn.write(b"\x89PNG\r\n\x1a\n truncated").await.unwrap();
        txn.commit().await.unwrap();

        let png: &'static [u8] = Box::leak(crate::decode::tests::png(4, 2).into_boxed_slice());
        let source = CountingSource::new(png);
        let (image, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();

        assert_eq!(status, CacheStatus::Populated);
        assert_eq!((image.width, image.height), (4, 2));
        assert_eq!(source.calls(), 1);
        let stored = disk.get(&key).await.unwrap().read_to_bytes().await.unwrap();
        assert_eq!(stored, png);
    }

    #[tokio::test]
    async fn test_undecodable_source_bytes_are_not_kept() {
        let dir = tempdir().unwrap();
        let init = CacheInitializer::new(CacheConfig {
            enabled: true,
            disk_cache_path: Some(dir.path().to_path_buf()),
            max_disk_cache_size: 1024 * 1024,
            max_memory_cache_size: 1024 * 1024,
        });
        let coordinator = FetchCoordinator::new(init, 1024 * 1024, ImageDecoder);
        let key = CacheKey::from_identifier("not-an-image");

        let err = coordinator
            .fetch(&key, CountingSource::new(b"<html>"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Decode(_)));
        assert!(disk_of(&coordinator).await.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_still_commits_for_waiters() {
        let (coordinator, _dir) = coordinator(1024 * 1024);
        let source = CountingSource::slow(b"slow", Duration::from_millis(300));
        let key = CacheKey::from_identifier("slow");
        disk_of(&coordinator).await;

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), coordinator.fetch(&key, source.clone()))
                .await;
        assert!(cancelled.is_err());

        let (payload, status) = coordinator
            .fetch_with_status(&key, source.clone())
            .await
            .unwrap();
        assert_eq!(*payload, "slow");
        assert_eq!(status, CacheStatus::DiskHit);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_returned_but_not_kept_on_disk() {
        let (coordinator, _dir) = coordinator(4);
        let source = CountingSource::new(b"way too large");
        let key = CacheKey::from_identifier("big");

        let payload = coordinator.fetch(&key, source).await.unwrap();
        assert_eq!(*payload, "way too large");

        let disk = disk_of(&coordinator).await;
        assert!(disk.get(&key).await.is_none());
        assert!(disk.size() <= disk.max_size());
    }
}
