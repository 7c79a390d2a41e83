//! # Disk Cache
//!
//! Bounded, persistent key-to-blob store with LRU eviction and transactional
//! writes. Layout of the cache directory:
//!
//! - `journal`: JSON-lines log of the index (see [`journal`])
//! - `<key>.<generation>`: committed blob
//! - `<key>.<n>.tmp`: bytes of an open write transaction
//! - `.nomedia`: marker keeping media scanners out of the directory
//!
//! The index and the per-key writer table sit behind separate locks so that
//! reads of one key never wait on writes of another. Renames, unlinks, durable
//! journal appends and compaction run on the blocking pool; the async paths
//! only touch the in-memory index and the journal's buffer.

mod journal;
mod transaction;

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cache::types::CacheKey;
use crate::error::CacheError;

use self::journal::{
    Compaction, IndexEntry, JOURNAL_COMPACT_FILE, Journal, JournalRecord,
    REDUNDANT_OP_COMPACT_THRESHOLD,
};
pub use self::transaction::{WriteOutcome, WriteTransaction, WriteWatch};

/// Name of the marker file excluding the directory from media scans
pub const NO_MEDIA_MARKER: &str = ".nomedia";

const TMP_EXTENSION: &str = "tmp";

struct DiskIndex {
    entries: LruCache<CacheKey, IndexEntry>,
    total_size: u64,
    redundant_ops: usize,
    /// `None` once the cache is closed
    journal: Option<Journal>,
    /// Records appended while a compaction is writing its snapshot
    backlog: Option<Vec<JournalRecord>>,
}

impl DiskIndex {
    /// Append `record`, flushing it to the file when `durable`
    fn log(&mut self, record: JournalRecord, durable: bool) -> Result<(), CacheError> {
        let journal = self.journal.as_mut().ok_or(CacheError::Closed)?;
        if durable {
            journal.append(&record)?;
        } else {
            journal.append_buffered(&record)?;
        }
        if let Some(backlog) = self.backlog.as_mut() {
            backlog.push(record);
        }
        Ok(())
    }

    /// Append a record that does not describe a live entry
    fn append_redundant(&mut self, record: JournalRecord, durable: bool) -> Result<(), CacheError> {
        self.log(record, durable)?;
        self.redundant_ops += 1;
        Ok(())
    }

    /// Pop least recently used entries until `total_size <= max_size`,
    /// returning the blobs to delete
    fn trim_to_size(&mut self, directory: &Path, max_size: u64) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while self.total_size > max_size {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_size -= entry.size;
            evicted.push(blob_path(directory, &key, entry.generation));
            debug!(key = %key, size = entry.size, "Evicting disk cache entry");
            if let Err(e) = self.append_redundant(
                JournalRecord::Remove {
                    key: key.to_string(),
                },
                true,
            ) {
                warn!(key = %key, error = %e, "Failed to journal eviction");
            }
        }
        evicted
    }

    fn needs_compaction(&self) -> bool {
        self.journal.is_some()
            && self.backlog.is_none()
            && self.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_ops >= self.entries.len()
    }

    /// Live entries, eldest first
    fn snapshot(&self) -> Vec<(CacheKey, IndexEntry)> {
        self.entries
            .iter()
            .rev()
            .map(|(key, entry)| (key.clone(), *entry))
            .collect()
    }
}

struct DiskInner {
    directory: PathBuf,
    max_size: u64,
    index: Mutex<DiskIndex>,
    writers: Mutex<HashMap<CacheKey, watch::Receiver<WriteOutcome>>>,
    closed: AtomicBool,
    compacting: AtomicBool,
    next_tmp: AtomicU64,
}

/// Handle to an open disk cache. Cheap to clone.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<DiskInner>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("directory", &self.inner.directory)
            .field("max_size", &self.inner.max_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn blob_path(directory: &Path, key: &CacheKey, generation: u64) -> PathBuf {
    directory.join(format!("{key}.{generation}"))
}

fn tmp_path(directory: &Path, key: &CacheKey, nonce: u64) -> PathBuf {
    directory.join(format!("{key}.{nonce}.{TMP_EXTENSION}"))
}

fn join_error(e: tokio::task::JoinError) -> CacheError {
    CacheError::Io(io::Error::other(e))
}

fn remove_files(paths: Vec<PathBuf>) {
    for path in paths {
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?path, error = %e, "Failed to remove cache file");
        }
    }
}

/// Create or refresh the marker file
fn touch_marker(directory: &Path) {
    let path = directory.join(NO_MEDIA_MARKER);
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
    {
        debug!(path = ?path, error = %e, "Failed to create marker file");
    }
}

/// Delete everything inside `directory`, keeping the directory itself
fn wipe_directory(directory: &Path) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl DiskCache {
    /// Open (or create) the cache in `directory`, bounded to `max_size` bytes.
    ///
    /// Fails when the directory cannot be created or written, or when less
    /// than `max_size` bytes of free space are available.
    #[instrument(level = "debug", skip_all, fields(max_size))]
    pub async fn open(directory: impl AsRef<Path>, max_size: u64) -> Result<Self, CacheError> {
        let directory = directory.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(directory, max_size))
            .await
            .map_err(join_error)?
    }

    fn open_blocking(directory: PathBuf, max_size: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(&directory)?;

        let available = fs2::available_space(&directory)?;
        if available < max_size {
            return Err(CacheError::InsufficientSpace {
                available,
                required: max_size,
            });
        }

        touch_marker(&directory);

        let replayed = match journal::replay(&directory) {
            Ok(replayed) => replayed,
            Err(CacheError::CorruptJournal(reason)) => {
                warn!(dir = ?directory, reason = %reason, "Disk cache journal is corrupt, starting over");
                wipe_directory(&directory)?;
                touch_marker(&directory);
                None
            }
            Err(e) => return Err(e),
        };

        let fresh = replayed.is_none();
        let (mut entries, dirty, mut redundant_ops, torn_tail) = match replayed {
            Some(r) => (r.entries, r.dirty, r.redundant_ops, r.torn_tail),
            None => (LruCache::unbounded(), HashSet::new(), 0, false),
        };

        // Writes that never resolved leave only a temp blob, swept below
        if !dirty.is_empty() {
            debug!(count = dirty.len(), "Discarding unfinished disk cache writes");
        }

        // Drop entries whose blob went missing or changed size behind our back
        let mut stale = Vec::new();
        for (key, entry) in entries.iter() {
            let path = blob_path(&directory, key, entry.generation);
            match fs::metadata(&path) {
                Ok(meta) if meta.len() == entry.size => {}
                _ => stale.push(key.clone()),
            }
        }
        for key in &stale {
            warn!(key = %key, "Dropping disk cache entry with missing blob");
            entries.pop(key);
        }

        sweep_orphans(&directory, &entries);

        let total_size = entries.iter().map(|(_, e)| e.size).sum();
        let journal = if fresh || torn_tail || !stale.is_empty() {
            redundant_ops = 0;
            Journal::rebuild(&directory, &entries)?
        } else {
            Journal::open_append(&directory)?
        };

        let cache = Self {
            inner: Arc::new(DiskInner {
                directory,
                max_size,
                index: Mutex::new(DiskIndex {
                    entries,
                    total_size,
                    redundant_ops,
                    journal: Some(journal),
                    backlog: None,
                }),
                writers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                compacting: AtomicBool::new(false),
                next_tmp: AtomicU64::new(1),
            }),
        };

        // The budget may have shrunk since the last run
        let (evicted, compact) = {
            let mut index = cache.inner.index.lock();
            let evicted = index.trim_to_size(&cache.inner.directory, max_size);
            (evicted, index.needs_compaction())
        };
        remove_files(evicted);
        if compact {
            cache.compact();
        }

        info!(
            dir = ?cache.inner.directory,
            entries = cache.len(),
            size = cache.size(),
            max_size,
            "Disk cache opened"
        );
        Ok(cache)
    }

    /// Open a streaming reader over the committed bytes of `key`.
    ///
    /// Counts as an access for eviction purposes. Absent keys and a closed
    /// cache both yield `None`.
    pub async fn get(&self, key: &CacheKey) -> Option<ReadHandle> {
        if self.is_closed() {
            return None;
        }

        let (path, entry, compact) = {
            let mut index = self.inner.index.lock();
            let entry = *index.entries.get(key)?;
            let read = JournalRecord::Read {
                key: key.to_string(),
            };
            if let Err(e) = index.append_redundant(read, false) {
                warn!(key = %key, error = %e, "Failed to journal read");
            }
            let path = blob_path(&self.inner.directory, key, entry.generation);
            (path, entry, index.needs_compaction())
        };
        if compact {
            self.schedule_compaction();
        }

        match tokio::fs::File::open(&path).await {
            Ok(file) => Some(ReadHandle {
                file,
                key: key.clone(),
                size: entry.size,
                generation: entry.generation,
            }),
            Err(e) => {
                // Evicted between the index lookup and the open
                debug!(key = %key, error = %e, "Disk cache blob vanished before read");
                None
            }
        }
    }

    /// Start a write for `key`.
    ///
    /// Returns `None` when another transaction for the same key is open or
    /// the cache is closed.
    pub async fn begin_write(&self, key: &CacheKey) -> Option<WriteTransaction> {
        if self.is_closed() {
            return None;
        }

        let outcome_tx = {
            let mut writers = self.inner.writers.lock();
            if writers.contains_key(key) {
                debug!(key = %key, "Write already in progress");
                return None;
            }
            let (tx, rx) = watch::channel(WriteOutcome::Pending);
            writers.insert(key.clone(), rx);
            tx
        };

        let dirty = JournalRecord::Dirty {
            key: key.to_string(),
        };
        let journaled = self.inner.index.lock().append_redundant(dirty, false);
        if let Err(e) = journaled {
            warn!(key = %key, error = %e, "Failed to journal write start");
            self.release_writer(key);
            return None;
        }

        let nonce = self.inner.next_tmp.fetch_add(1, Ordering::Relaxed);
        let path = tmp_path(&self.inner.directory, key, nonce);
        match tokio::fs::File::create(&path).await {
            Ok(file) => Some(WriteTransaction::new(
                self.clone(),
                key.clone(),
                path,
                file,
                outcome_tx,
            )),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to create temporary cache file");
                self.journal_abort(key);
                self.release_writer(key);
                None
            }
        }
    }

    /// Observe the transaction currently open for `key`, if any
    pub fn pending_write(&self, key: &CacheKey) -> Option<WriteWatch> {
        self.inner
            .writers
            .lock()
            .get(key)
            .cloned()
            .map(WriteWatch::new)
    }

    /// Delete the committed entry for `key`; returns whether one existed
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        let cache = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || cache.remove_blocking(&key))
            .await
            .map_err(join_error)?
    }

    fn remove_blocking(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let (path, compact) = {
            let mut index = self.inner.index.lock();
            let Some(entry) = index.entries.pop(key) else {
                return Ok(false);
            };
            index.total_size -= entry.size;
            let remove = JournalRecord::Remove {
                key: key.to_string(),
            };
            index.append_redundant(remove, true)?;
            let path = blob_path(&self.inner.directory, key, entry.generation);
            (path, index.needs_compaction())
        };

        remove_files(vec![path]);
        if compact {
            self.compact();
        }
        debug!(key = %key, "Removed disk cache entry");
        Ok(true)
    }

    /// Delete every committed entry and reset the journal
    pub async fn clear(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.clear_blocking())
            .await
            .map_err(join_error)?
    }

    fn clear_blocking(&self) -> Result<(), CacheError> {
        let paths = {
            let mut index = self.inner.index.lock();
            let paths: Vec<PathBuf> = index
                .entries
                .iter()
                .map(|(key, entry)| blob_path(&self.inner.directory, key, entry.generation))
                .collect();
            index.entries.clear();
            index.total_size = 0;
            index.redundant_ops = 0;
            // An in-flight compaction sees this and drops its snapshot
            index.backlog = None;
            index.journal = Some(Journal::rebuild(&self.inner.directory, &index.entries)?);
            paths
        };

        let count = paths.len();
        remove_files(paths);
        debug!(count, "Cleared disk cache entries");
        Ok(())
    }

    /// Force the journal to stable storage without closing
    pub fn flush(&self) -> Result<(), CacheError> {
        let mut index = self.inner.index.lock();
        let journal = index.journal.as_mut().ok_or(CacheError::Closed)?;
        journal.sync()?;
        debug!(path = ?journal.path(), "Disk cache journal flushed");
        Ok(())
    }

    /// Release the journal handle. Later operations report a closed cache.
    pub fn close(&self) -> Result<(), CacheError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let journal = self.inner.index.lock().journal.take();
        if let Some(mut journal) = journal {
            journal.sync()?;
        }
        info!(dir = ?self.inner.directory, "Disk cache closed");
        Ok(())
    }

    /// Close the cache and remove its directory wholesale
    pub async fn delete(self) -> Result<(), CacheError> {
        self.close()?;
        match tokio::fs::remove_dir_all(&self.inner.directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.inner.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of committed entries
    pub fn size(&self) -> u64 {
        self.inner.index.lock().total_size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Publish a finished temp blob as the new generation of `key`.
    ///
    /// Blocking; the caller holds the key's write slot.
    fn publish(&self, key: &CacheKey, tmp: &Path, size: u64) -> Result<u64, CacheError> {
        let directory = &self.inner.directory;
        let generation = {
            let index = self.inner.index.lock();
            if self.is_closed() {
                return Err(CacheError::Closed);
            }
            index.entries.peek(key).map_or(1, |e| e.generation + 1)
        };
        let path = blob_path(directory, key, generation);
        fs::rename(tmp, &path)?;

        let (obsolete, compact) = {
            let mut index = self.inner.index.lock();
            let clean = JournalRecord::Clean {
                key: key.to_string(),
                size,
                generation,
            };
            if let Err(e) = index.log(clean, true) {
                drop(index);
                remove_files(vec![path]);
                return Err(e);
            }

            let mut obsolete = Vec::new();
            if let Some(previous) = index.entries.put(key.clone(), IndexEntry { size, generation }) {
                index.total_size -= previous.size;
                index.redundant_ops += 1;
                if previous.generation != generation {
                    obsolete.push(blob_path(directory, key, previous.generation));
                }
            }
            index.total_size += size;

            obsolete.extend(index.trim_to_size(directory, self.inner.max_size));
            (obsolete, index.needs_compaction())
        };

        remove_files(obsolete);
        if compact {
            self.compact();
        }
        Ok(generation)
    }

    fn schedule_compaction(&self) {
        if self.inner.compacting.load(Ordering::Acquire) {
            return;
        }
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.compact());
    }

    /// Rewrite the journal down to the live entries. Blocking.
    ///
    /// The index lock is held only to take the snapshot and to swap in the
    /// new journal together with whatever was appended in between.
    fn compact(&self) {
        if self.inner.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.compact_inner();
        self.inner.compacting.store(false, Ordering::Release);
    }

    fn compact_inner(&self) {
        let directory = &self.inner.directory;
        let snapshot = {
            let mut index = self.inner.index.lock();
            if !index.needs_compaction() {
                return;
            }
            index.backlog = Some(Vec::new());
            index.snapshot()
        };

        let written = Compaction::begin(
            directory,
            JOURNAL_COMPACT_FILE,
            snapshot.iter().map(|(key, entry)| (key, entry)),
        );

        let mut index = self.inner.index.lock();
        let backlog = index.backlog.take();
        let compaction = match written {
            Ok(compaction) => compaction,
            Err(e) => {
                warn!(dir = ?directory, error = %e, "Failed to compact disk cache journal");
                return;
            }
        };
        // Closed or cleared while the snapshot was being written
        let Some(backlog) = backlog.filter(|_| index.journal.is_some()) else {
            drop(index);
            compaction.discard();
            return;
        };

        match install_compaction(compaction, &backlog) {
            Ok(journal) => {
                index.journal = Some(journal);
                index.redundant_ops =
                    (snapshot.len() + backlog.len()).saturating_sub(index.entries.len());
                debug!(dir = ?directory, entries = snapshot.len(), "Compacted disk cache journal");
            }
            Err(e) => warn!(dir = ?directory, error = %e, "Failed to install compacted journal"),
        }
    }

    fn journal_abort(&self, key: &CacheKey) {
        let abort = JournalRecord::Abort {
            key: key.to_string(),
        };
        let journaled = self.inner.index.lock().append_redundant(abort, false);
        if let Err(e) = journaled
            && !matches!(e, CacheError::Closed)
        {
            warn!(key = %key, error = %e, "Failed to journal aborted write");
        }
    }

    fn release_writer(&self, key: &CacheKey) {
        self.inner.writers.lock().remove(key);
    }
}

fn install_compaction(
    mut compaction: Compaction,
    backlog: &[JournalRecord],
) -> Result<Journal, CacheError> {
    for record in backlog {
        compaction.append(record)?;
    }
    compaction.install()
}

/// Remove files that belong to no live entry: older generations, stray temp
/// blobs and leftovers from a crashed compaction
fn sweep_orphans(directory: &Path, entries: &LruCache<CacheKey, IndexEntry>) {
    let Ok(dir_entries) = fs::read_dir(directory) else {
        return;
    };

    let mut orphans = Vec::new();
    for dir_entry in dir_entries.flatten() {
        let path = dir_entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == journal::JOURNAL_FILE || name == NO_MEDIA_MARKER {
            continue;
        }
        let live = name
            .split_once('.')
            .and_then(|(raw_key, suffix)| {
                let key = CacheKey::parse(raw_key)?;
                let generation: u64 = suffix.parse().ok()?;
                entries.peek(&key).map(|e| e.generation == generation)
            })
            .unwrap_or(false);
        if !live && path.is_file() {
            orphans.push(path);
        }
    }

    if !orphans.is_empty() {
        debug!(count = orphans.len(), "Removing orphaned cache files");
        remove_files(orphans);
    }
}

/// Streaming reader over one committed blob.
///
/// The underlying file stays readable even if the entry is evicted while the
/// handle is open. Dropping the handle closes the file.
#[derive(Debug)]
pub struct ReadHandle {
    file: tokio::fs::File,
    key: CacheKey,
    size: u64,
    generation: u64,
}

impl ReadHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Size recorded in the index at commit time
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read the whole blob, failing if it is shorter or longer than indexed
    pub async fn read_to_bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut buf).await?;
        if buf.len() as u64 != self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "cache blob {} has {} bytes, expected {}",
                    self.key,
                    buf.len(),
                    self.size
                ),
            ));
        }
        Ok(Bytes::from(buf))
    }
}

impl AsyncRead for ReadHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MB: u64 = 1024 * 1024;

    #[inline]
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer() // Write to test output
            .try_init();
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_identifier(name)
    }

    async fn put(cache: &DiskCache, name: &str, data: &[u8]) -> u64 {
        let mut txn = cache.begin_write(&key(name)).await.unwrap();
        txn.write(data).await.unwrap();
        txn.commit().await.unwrap()
    }

    async fn read(cache: &DiskCache, name: &str) -> Option<Bytes> {
        let handle = cache.get(&key(name)).await?;
        Some(handle.read_to_bytes().await.unwrap())
    }

    fn tmp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    /// Temp blobs of aborted writes are removed in the background
    async fn wait_for_no_tmp_files(dir: &Path) {
        for _ in 0..200 {
            if tmp_files(dir) == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("temporary files were never removed");
    }

    async fn wait_for_compaction(cache: &DiskCache) {
        for _ in 0..200 {
            if !cache.inner.compacting.load(Ordering::Acquire)
                && cache.inner.index.lock().redundant_ops < REDUNDANT_OP_COMPACT_THRESHOLD
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("journal was never compacted");
    }

    #[tokio::test]
    async fn test_commit_then_get() {
        init_tracing();
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        assert_eq!(put(&cache, "a", b"hello").await, 1);

        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.len(), 1);
        assert!(dir.path().join(NO_MEDIA_MARKER).exists());
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        let mut txn = cache.begin_write(&key("a")).await.unwrap();
        txn.write(b"partial").await.unwrap();

        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.size(), 0);

        txn.commit().await.unwrap();
        assert!(cache.get(&key("a")).await.is_some());
    }

    #[tokio::test]
    async fn test_one_transaction_per_key() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        let txn = cache.begin_write(&key("a")).await.unwrap();
        assert!(cache.begin_write(&key("a")).await.is_none());
        // Other keys are unaffected
        assert!(cache.begin_write(&key("b")).await.is_some());

        txn.abort();
        assert!(cache.begin_write(&key("a")).await.is_some());
    }

    #[tokio::test]
    async fn test_abort_keeps_previous_generation() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        put(&cache, "a", b"v1").await;

        let mut txn = cache.begin_write(&key("a")).await.unwrap();
        txn.write(b"v2-partial").await.unwrap();
        txn.abort();

        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"v1"));
        wait_for_no_tmp_files(dir.path()).await;
    }

    #[tokio::test]
    async fn test_dropped_transaction_aborts() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        {
            let mut txn = cache.begin_write(&key("a")).await.unwrap();
            txn.write(b"lost").await.unwrap();
        }

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.pending_write(&key("a")).is_none());
        assert!(cache.begin_write(&key("a")).await.is_some());
    }

    #[tokio::test]
    async fn test_rewrite_increments_generation() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        assert_eq!(put(&cache, "a", b"one").await, 1);
        assert_eq!(put(&cache, "a", b"three").await, 2);

        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"three"));
        assert_eq!(cache.size(), 5);
        assert!(!dir.path().join(format!("{}.1", key("a"))).exists());
    }

    #[tokio::test]
    async fn test_eviction_removes_least_recently_used() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 10 * MB).await.unwrap();
        let chunk = vec![7u8; (4 * MB) as usize];

        put(&cache, "a", &chunk).await;
        put(&cache, "b", &chunk).await;
        put(&cache, "c", &chunk).await;

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.get(&key("b")).await.is_some());
        assert!(cache.get(&key("c")).await.is_some());
        assert!(cache.size() <= 10 * MB);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 10).await.unwrap();

        put(&cache, "a", b"aaaa").await;
        put(&cache, "b", b"bbbb").await;
        assert!(cache.get(&key("a")).await.is_some());
        put(&cache, "c", b"cccc").await;

        assert!(cache.get(&key("a")).await.is_some());
        assert!(cache.get(&key("b")).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_never_exceeds_budget() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 8).await.unwrap();
        put(&cache, "small", b"1234").await;

        put(&cache, "huge", b"0123456789abcdef").await;

        assert!(cache.size() <= 8);
        assert!(cache.get(&key("huge")).await.is_none());
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), MB).await.unwrap();
            put(&cache, "a", b"alpha").await;
            put(&cache, "b", b"beta").await;
            cache.remove(&key("b")).await.unwrap();
            cache.close().unwrap();
        }

        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"alpha"));
        assert!(cache.get(&key("b")).await.is_none());
        assert_eq!(cache.size(), 5);
    }

    #[tokio::test]
    async fn test_reopen_discards_unfinished_write() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), MB).await.unwrap();
            let mut txn = cache.begin_write(&key("a")).await.unwrap();
            txn.write(b"never committed").await.unwrap();
            // Simulate a crash: the transaction is never resolved
            std::mem::forget(txn);
            cache.close().unwrap();
        }

        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(tmp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_corrupt_journal_starts_fresh() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), MB).await.unwrap();
            put(&cache, "a", b"alpha").await;
            cache.close().unwrap();
        }
        fs::write(dir.path().join(journal::JOURNAL_FILE), b"garbage\n").unwrap();

        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        assert!(cache.is_empty());
        assert!(!dir.path().join(format!("{}.1", key("a"))).exists());
        put(&cache, "b", b"beta").await;
        assert!(cache.get(&key("b")).await.is_some());
    }

    #[tokio::test]
    async fn test_shrunk_budget_trims_on_open() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), MB).await.unwrap();
            put(&cache, "a", b"aaaa").await;
            put(&cache, "b", b"bbbb").await;
            cache.close().unwrap();
        }

        let cache = DiskCache::open(dir.path(), 6).await.unwrap();
        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.get(&key("b")).await.is_some());
    }

    #[tokio::test]
    async fn test_insufficient_space_fails_open() {
        let dir = tempdir().unwrap();
        let result = DiskCache::open(dir.path(), u64::MAX).await;
        assert!(matches!(
            result,
            Err(CacheError::InsufficientSpace { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_operations() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        put(&cache, "a", b"alpha").await;
        let mut txn = cache.begin_write(&key("b")).await.unwrap();
        txn.write(b"beta").await.unwrap();

        cache.close().unwrap();

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.begin_write(&key("c")).await.is_none());
        assert!(matches!(cache.flush(), Err(CacheError::Closed)));
        assert!(matches!(txn.commit().await, Err(CacheError::Closed)));
        wait_for_no_tmp_files(dir.path()).await;
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        put(&cache, "a", b"alpha").await;
        put(&cache, "b", b"beta").await;

        cache.clear().await.unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert!(!dir.path().join(format!("{}.1", key("a"))).exists());
        put(&cache, "c", b"gamma").await;
        assert!(cache.get(&key("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_open_handle_survives_eviction() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 6).await.unwrap();
        put(&cache, "a", b"aaaa").await;

        let handle = cache.get(&key("a")).await.unwrap();
        put(&cache, "b", b"bbbb").await;
        assert!(cache.get(&key("a")).await.is_none());

        if cfg!(unix) {
            assert_eq!(handle.read_to_bytes().await.unwrap(), Bytes::from_static(b"aaaa"));
        }
    }

    #[tokio::test]
    async fn test_pending_write_resolves_on_commit() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        let mut txn = cache.begin_write(&key("a")).await.unwrap();
        let watch = cache.pending_write(&key("a")).unwrap();
        let waiter = tokio::spawn(watch.resolved());

        txn.write(b"alpha").await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), WriteOutcome::Committed);
        assert!(cache.pending_write(&key("a")).is_none());
    }

    #[tokio::test]
    async fn test_journal_compaction_keeps_entries() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        put(&cache, "a", b"alpha").await;

        for _ in 0..(REDUNDANT_OP_COMPACT_THRESHOLD + 10) {
            assert!(cache.get(&key("a")).await.is_some());
        }
        wait_for_compaction(&cache).await;
        cache.flush().unwrap();
        let journal_len = fs::metadata(dir.path().join(journal::JOURNAL_FILE))
            .unwrap()
            .len();
        assert!(journal_len < 100 * 1024);

        cache.close().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"alpha"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_during_compaction_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), MB).await.unwrap();
            put(&cache, "a", b"alpha").await;

            for _ in 0..REDUNDANT_OP_COMPACT_THRESHOLD {
                assert!(cache.get(&key("a")).await.is_some());
            }
            // Races the compaction the reads just scheduled
            for i in 0..20 {
                put(&cache, &format!("b{i}"), b"beta").await;
            }
            cache.remove(&key("b0")).await.unwrap();

            wait_for_compaction(&cache).await;
            assert!(!dir.path().join(JOURNAL_COMPACT_FILE).exists());
            cache.close().unwrap();
        }

        let cache = DiskCache::open(dir.path(), MB).await.unwrap();
        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"alpha"));
        assert!(cache.get(&key("b0")).await.is_none());
        for i in 1..20 {
            assert_eq!(read(&cache, &format!("b{i}")).await.unwrap(), Bytes::from_static(b"beta"));
        }
        assert_eq!(cache.len(), 20);
    }

    #[tokio::test]
    async fn test_abort_frees_key_before_cleanup() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), MB).await.unwrap();

        let mut first = cache.begin_write(&key("a")).await.unwrap();
        first.write(b"discarded").await.unwrap();
        first.abort();

        let mut second = cache.begin_write(&key("a")).await.unwrap();
        second.write(b"kept").await.unwrap();
        second.commit().await.unwrap();

        wait_for_no_tmp_files(dir.path()).await;
        assert_eq!(read(&cache, "a").await.unwrap(), Bytes::from_static(b"kept"));
    }
}
