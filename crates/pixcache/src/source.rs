//! # Sources
//!
//! A [`Source`] produces the raw bytes for a key on a cache miss. Two
//! implementations ship with the crate:
//!
//! - [`HttpSource`], which downloads through [`ResumableTransfer`] into a
//!   staging file so an interrupted download continues where it stopped.
//! - [`MediumSource`], which consults a [`SecondaryStorageMedium`] before
//!   falling back to another source and writes the result back.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheKey;
use crate::error::{SourceError, TransferError};
use crate::transfer::{OnTransferEvent, ResumableTransfer};

const STAGING_EXTENSION: &str = "part";

/// Strategy producing the raw bytes of a key
#[async_trait]
pub trait Source: Send + Sync {
    async fn produce(&self, key: &CacheKey) -> Result<Bytes, SourceError>;
}

/// Alternate store consulted before the network
#[async_trait]
pub trait SecondaryStorageMedium: Send + Sync {
    async fn exists(&self, key: &CacheKey) -> bool;

    /// Stored size in bytes, 0 if absent
    async fn size(&self, key: &CacheKey) -> u64;

    async fn read(&self, key: &CacheKey) -> io::Result<Bytes>;

    /// Returns whether the bytes were stored
    async fn write(&self, key: &CacheKey, bytes: &[u8]) -> bool;

    /// Returns whether an entry was deleted
    async fn delete(&self, key: &CacheKey) -> bool;
}

/// One file per key in a directory
#[derive(Debug, Clone)]
pub struct FileStorageMedium {
    root: PathBuf,
}

impl FileStorageMedium {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    async fn write_inner(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(format!("{key}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(key)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl SecondaryStorageMedium for FileStorageMedium {
    async fn exists(&self, key: &CacheKey) -> bool {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false)
    }

    async fn size(&self, key: &CacheKey) -> u64 {
        tokio::fs::metadata(self.path_for(key))
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    async fn read(&self, key: &CacheKey) -> io::Result<Bytes> {
        tokio::fs::read(self.path_for(key)).await.map(Bytes::from)
    }

    async fn write(&self, key: &CacheKey, bytes: &[u8]) -> bool {
        match self.write_inner(key, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write to storage medium");
                false
            }
        }
    }

    async fn delete(&self, key: &CacheKey) -> bool {
        tokio::fs::remove_file(self.path_for(key)).await.is_ok()
    }
}

/// Serves from a storage medium when it holds a non-empty copy, otherwise
/// from `inner`, writing the result back to the medium
pub struct MediumSource<S> {
    medium: S,
    inner: Arc<dyn Source>,
}

impl<S: SecondaryStorageMedium> MediumSource<S> {
    pub fn new(medium: S, inner: Arc<dyn Source>) -> Self {
        Self { medium, inner }
    }

    pub fn medium(&self) -> &S {
        &self.medium
    }
}

#[async_trait]
impl<S: SecondaryStorageMedium> Source for MediumSource<S> {
    async fn produce(&self, key: &CacheKey) -> Result<Bytes, SourceError> {
        if self.medium.exists(key).await && self.medium.size(key).await != 0 {
            match self.medium.read(key).await {
                Ok(bytes) => {
                    debug!(key = %key, size = bytes.len(), "Served from storage medium");
                    return Ok(bytes);
                }
                Err(e) => warn!(key = %key, error = %e, "Storage medium read failed, falling back"),
            }
        }

        let bytes = self.inner.produce(key).await?;
        if !self.medium.write(key, &bytes).await {
            debug!(key = %key, "Storage medium did not keep a copy");
        }
        Ok(bytes)
    }
}

type StagingLocks = Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive use of one key's staging file. The map entry goes away with the
/// last holder or waiter.
struct StagingLease {
    guard: Option<OwnedMutexGuard<()>>,
    locks: StagingLocks,
    key: CacheKey,
}

impl Drop for StagingLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Downloads over HTTP with resumption through a staging directory.
///
/// One instance serves many URLs; bind it to a URL with [`HttpSource::for_url`].
/// Downloads of the same key through clones of one instance take turns on
/// the staging file.
#[derive(Clone)]
pub struct HttpSource {
    transfer: ResumableTransfer,
    staging_dir: PathBuf,
    on_event: Option<OnTransferEvent>,
    cancel: CancellationToken,
    staging_locks: StagingLocks,
}

impl HttpSource {
    pub fn new(transfer: ResumableTransfer, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            transfer,
            staging_dir: staging_dir.into(),
            on_event: None,
            cancel: CancellationToken::new(),
            staging_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Report transfer events to `callback`
    pub fn with_progress(mut self, callback: OnTransferEvent) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Stop transfers when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Source producing the bytes behind `url`
    pub fn for_url(&self, url: impl Into<String>) -> UrlSource {
        UrlSource {
            http: self.clone(),
            url: url.into(),
        }
    }

    fn staging_path(&self, key: &CacheKey) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}", key.as_str(), STAGING_EXTENSION))
    }

    async fn lease(&self, key: &CacheKey) -> StagingLease {
        let lock = self
            .staging_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        StagingLease {
            guard: Some(lock.lock_owned().await),
            locks: self.staging_locks.clone(),
            key: key.clone(),
        }
    }

    /// Download `url` for `key`, resuming a previous partial download.
    ///
    /// If the server cannot resume, the partial file is discarded and the
    /// download restarts from byte 0 once.
    pub async fn download(&self, url: &str, key: &CacheKey) -> Result<Bytes, SourceError> {
        let _lease = self.lease(key).await;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staging = self.staging_path(key);

        let result = self.run(url, &staging).await;
        match result {
            Err(TransferError::ResumeNotSupported { offset }) => {
                info!(url, offset, "Server cannot resume, restarting download");
                tokio::fs::remove_file(&staging).await?;
                self.run(url, &staging).await?;
            }
            other => {
                other?;
            }
        }

        let bytes = tokio::fs::read(&staging).await?;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!(path = ?staging, error = %e, "Failed to remove staging file");
        }
        Ok(Bytes::from(bytes))
    }

    async fn run(&self, url: &str, staging: &Path) -> Result<(), TransferError> {
        self.transfer
            .run(url, staging, self.on_event.clone(), self.cancel.clone())
            .await
            .map(|_| ())
    }
}

/// [`HttpSource`] bound to one URL
#[derive(Clone)]
pub struct UrlSource {
    http: HttpSource,
    url: String,
}

impl UrlSource {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Source for UrlSource {
    async fn produce(&self, key: &CacheKey) -> Result<Bytes, SourceError> {
        self.http.download(&self.url, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferConfig;
    use crate::downloader::test_client;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingSource {
        calls: AtomicUsize,
        data: &'static [u8],
    }

    #[async_trait]
    impl Source for CountingSource {
        async fn produce(&self, _key: &CacheKey) -> Result<Bytes, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(self.data))
        }
    }

    fn http_source(staging: &Path) -> HttpSource {
        let config = TransferConfig::builder()
            .with_connect_timeout(Duration::from_millis(500))
            .with_read_timeout(Duration::from_millis(500))
            .build();
        HttpSource::new(ResumableTransfer::new(test_client(), config), staging)
    }

    #[tokio::test]
    async fn test_medium_source_prefers_medium() {
        let dir = tempdir().unwrap();
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            data: b"from network",
        });
        let source = MediumSource::new(FileStorageMedium::new(dir.path()), inner.clone());
        let key = CacheKey::from_identifier("img");

        assert_eq!(source.produce(&key).await.unwrap(), "from network");
        assert!(source.medium().exists(&key).await);
        assert_eq!(source.medium().size(&key).await, 12);

        assert_eq!(source.produce(&key).await.unwrap(), "from network");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_medium_source_ignores_empty_copy() {
        let dir = tempdir().unwrap();
        let key = CacheKey::from_identifier("img");
        std::fs::write(dir.path().join(key.as_str()), b"").unwrap();
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            data: b"fresh",
        });
        let source = MediumSource::new(FileStorageMedium::new(dir.path()), inner.clone());

        assert_eq!(source.produce(&key).await.unwrap(), "fresh");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert!(source.medium().delete(&key).await);
        assert!(!source.medium().delete(&key).await);
    }

    #[tokio::test]
    async fn test_http_source_resumes_staged_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img"))
            .and(header("Range", "bytes=5-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 5-9/10")
                    .set_body_bytes(b"56789".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let http = http_source(dir.path());
        let key = CacheKey::from_identifier("img");
        std::fs::write(http.staging_path(&key), b"01234").unwrap();

        let bytes = http
            .for_url(format!("{}/img", server.uri()))
            .produce(&key)
            .await
            .unwrap();

        assert_eq!(bytes, "0123456789");
        assert!(!http.staging_path(&key).exists());
    }

    #[tokio::test]
    async fn test_http_source_restarts_when_resume_unsupported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let http = http_source(dir.path());
        let key = CacheKey::from_identifier("img");
        std::fs::write(http.staging_path(&key), b"stale").unwrap();

        let bytes = http
            .download(&format!("{}/img", server.uri()), &key)
            .await
            .unwrap();

        assert_eq!(bytes, "0123456789");
    }

    #[tokio::test]
    async fn test_http_source_failure_keeps_staging_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let http = http_source(dir.path());
        let key = CacheKey::from_identifier("img");
        std::fs::write(http.staging_path(&key), b"01234").unwrap();

        let err = http
            .download(&format!("{}/img", server.uri()), &key)
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::Transfer(TransferError::Status(_))));
        assert_eq!(std::fs::read(http.staging_path(&key)).unwrap(), b"01234");
    }
}
