//! # Write Transactions
//!
//! A transaction owns the temp blob of one key until it is committed or
//! aborted. Nothing it writes is visible to readers before `commit` returns.

use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::DiskCache;
use crate::cache::types::CacheKey;
use crate::error::CacheError;

/// Resolution state of a write transaction as seen by waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Pending,
    Committed,
    Aborted,
}

/// In-progress write for one key.
///
/// Dropping an unresolved transaction aborts it.
pub struct WriteTransaction {
    cache: DiskCache,
    key: CacheKey,
    tmp_path: PathBuf,
    file: Option<File>,
    written: u64,
    outcome_tx: Option<watch::Sender<WriteOutcome>>,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("key", &self.key)
            .field("written", &self.written)
            .finish()
    }
}

impl WriteTransaction {
    pub(super) fn new(
        cache: DiskCache,
        key: CacheKey,
        tmp_path: PathBuf,
        file: File,
        outcome_tx: watch::Sender<WriteOutcome>,
    ) -> Self {
        Self {
            cache,
            key,
            tmp_path,
            file: Some(file),
            written: 0,
            outcome_tx: Some(outcome_tx),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append bytes to the uncommitted blob
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), CacheError> {
        let file = self.file.as_mut().ok_or(CacheError::Closed)?;
        file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Publish the written bytes, evicting older entries as needed.
    ///
    /// Returns the new generation of the entry. On error the transaction is
    /// aborted and the index is left unchanged.
    pub async fn commit(mut self) -> Result<u64, CacheError> {
        let result = self.commit_inner().await;
        match &result {
            Ok(generation) => {
                debug!(key = %self.key, size = self.written, generation, "Committed disk cache entry");
                self.finish(WriteOutcome::Committed);
            }
            Err(e) => {
                if !matches!(e, CacheError::Closed) {
                    warn!(key = %self.key, error = %e, "Failed to commit disk cache entry");
                }
                self.finish(WriteOutcome::Aborted);
            }
        }
        result
    }

    async fn commit_inner(&mut self) -> Result<u64, CacheError> {
        let mut file = self.file.take().ok_or(CacheError::Closed)?;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        if self.cache.is_closed() {
            return Err(CacheError::Closed);
        }
        let cache = self.cache.clone();
        let key = self.key.clone();
        let tmp_path = self.tmp_path.clone();
        let size = self.written;
        tokio::task::spawn_blocking(move || cache.publish(&key, &tmp_path, size))
            .await
            .map_err(super::join_error)?
    }

    /// Discard the written bytes and release the key
    pub fn abort(mut self) {
        debug!(key = %self.key, "Aborting disk cache write");
        self.finish(WriteOutcome::Aborted);
    }

    /// Release the per-key lock and wake waiters. Idempotent.
    ///
    /// The temp blob of an unsuccessful write is unique to this transaction,
    /// so it is deleted on the blocking pool after the slot is already free.
    fn finish(&mut self, outcome: WriteOutcome) {
        let Some(outcome_tx) = self.outcome_tx.take() else {
            return;
        };
        self.file = None;

        // Free the slot before waking waiters so they can start a new write
        self.cache.release_writer(&self.key);
        outcome_tx.send_replace(outcome);

        if outcome == WriteOutcome::Committed {
            return;
        }
        let cache = self.cache.clone();
        let key = self.key.clone();
        let tmp_path = self.tmp_path.clone();
        let discard = move || {
            if let Err(e) = std::fs::remove_file(&tmp_path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = ?tmp_path, error = %e, "Failed to remove temporary cache file");
            }
            cache.journal_abort(&key);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(discard);
            }
            Err(_) => discard(),
        }
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        self.finish(WriteOutcome::Aborted);
    }
}

/// Wait handle on another caller's write transaction
#[derive(Debug, Clone)]
pub struct WriteWatch {
    rx: watch::Receiver<WriteOutcome>,
}

impl WriteWatch {
    pub(super) fn new(rx: watch::Receiver<WriteOutcome>) -> Self {
        Self { rx }
    }

    /// Wait until the transaction commits or aborts
    pub async fn resolved(mut self) -> WriteOutcome {
        match self.rx.wait_for(|outcome| *outcome != WriteOutcome::Pending).await {
            Ok(outcome) => *outcome,
            // The sender only disappears once the transaction is gone
            Err(_) => WriteOutcome::Aborted,
        }
    }
}
