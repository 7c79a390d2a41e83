//! # Cache Initializer
//!
//! One-shot asynchronous bring-up of the disk tier. The state moves
//! `NotStarted -> Initializing -> {Ready, Unavailable}`; both terminal states
//! hold for the rest of the process. Callers that arrive while bring-up is
//! running wait on a watch channel instead of polling.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::cache::providers::DiskCache;
use crate::cache::types::CacheConfig;
use crate::error::InitError;

/// Lifecycle of the disk tier
#[derive(Debug, Clone)]
pub enum InitState {
    NotStarted,
    Initializing,
    Ready(DiskCache),
    /// Permanently unavailable; the reason is kept for diagnostics only
    Unavailable(InitError),
}

impl InitState {
    /// Whether bring-up has reached a terminal state
    pub fn is_settled(&self) -> bool {
        matches!(self, InitState::Ready(_) | InitState::Unavailable(_))
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        match self {
            InitState::Ready(disk) => Some(disk),
            _ => None,
        }
    }
}

struct InitInner {
    config: CacheConfig,
    state: watch::Sender<InitState>,
    /// Serializes `clear` so only one re-initialization runs at a time
    gate: Mutex<()>,
}

/// Gate in front of every disk operation
#[derive(Clone)]
pub struct CacheInitializer {
    inner: Arc<InitInner>,
}

impl CacheInitializer {
    pub fn new(config: CacheConfig) -> Self {
        let (state, _) = watch::channel(InitState::NotStarted);
        Self {
            inner: Arc::new(InitInner {
                config,
                state,
                gate: Mutex::new(()),
            }),
        }
    }

    /// Kick off bring-up in the background if nobody has yet
    pub fn start(&self) {
        if self.try_begin() {
            self.spawn_bring_up();
        }
    }

    /// Wait until the disk tier is Ready or Unavailable, starting bring-up
    /// if this is the first caller
    pub async fn wait(&self) -> InitState {
        self.start();
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(InitState::is_settled).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`
            Err(_) => InitState::Unavailable(InitError::Io("initializer dropped".to_string())),
        }
    }

    /// Current state without waiting
    pub fn state(&self) -> InitState {
        self.inner.state.borrow().clone()
    }

    /// The disk cache if bring-up finished successfully
    pub fn disk(&self) -> Option<DiskCache> {
        self.inner.state.borrow().disk().cloned()
    }

    /// Wipe the disk tier and bring it up again.
    ///
    /// Callers arriving meanwhile wait exactly as they do during the first
    /// bring-up. An Unavailable tier stays Unavailable.
    pub async fn clear(&self) -> InitState {
        let _gate = self.inner.gate.lock().await;

        let disk = match self.wait().await {
            InitState::Ready(disk) => disk,
            other => return other,
        };

        self.inner.state.send_replace(InitState::Initializing);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = disk.delete().await {
                warn!(error = %e, "Failed to delete disk cache directory");
            }
            debug!("Disk cache deleted, reinitializing");
            bring_up(&inner).await;
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Disk cache reinitialization task failed");
            self.inner.state.send_if_modified(|state| {
                if state.is_settled() {
                    return false;
                }
                *state = InitState::Unavailable(InitError::Io(e.to_string()));
                true
            });
        }

        self.state()
    }

    /// Force the journal to storage if the disk tier is Ready
    pub fn flush(&self) {
        if let Some(disk) = self.disk()
            && let Err(e) = disk.flush()
        {
            warn!(error = %e, "Failed to flush disk cache");
        }
    }

    /// Close the disk tier; later disk operations report a closed cache
    pub fn close(&self) {
        if let Some(disk) = self.disk()
            && let Err(e) = disk.close()
        {
            warn!(error = %e, "Failed to close disk cache");
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Atomically claim the `NotStarted -> Initializing` transition
    fn try_begin(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, InitState::NotStarted) {
                *state = InitState::Initializing;
                true
            } else {
                false
            }
        })
    }

    /// Run bring-up detached so a cancelled caller cannot leave the state
    /// stuck in Initializing
    fn spawn_bring_up(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            bring_up(&inner).await;
        });
    }
}

async fn bring_up(inner: &InitInner) {
    let config = &inner.config;
    let result = if config.enabled && config.max_disk_cache_size > 0 {
        let path = config.resolved_disk_path();
        DiskCache::open(&path, config.max_disk_cache_size)
            .await
            .map_err(InitError::from)
    } else {
        Err(InitError::Disabled)
    };

    let state = match result {
        Ok(disk) => {
            info!(dir = ?disk.directory(), "Disk cache initialized");
            InitState::Ready(disk)
        }
        Err(reason) => {
            warn!(reason = %reason, "Disk cache unavailable, falling back to memory-only caching");
            InitState::Unavailable(reason)
        }
    };
    inner.state.send_replace(state);
}
