//! Deduplicated percent-complete reporting for a single transfer attempt.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

/// Events reported while a transfer runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Percent complete, strictly greater than the previous report
    Progress { percent: u8 },
    /// The transfer finished; emitted exactly once
    Completed,
    /// The transfer failed; nothing follows for this attempt
    Error { message: String },
}

/// A callback for transfer events, receiving the tag of the transfer
pub type OnTransferEvent = Arc<dyn Fn(&str, TransferEvent) + Send + Sync>;

/// Derives [`TransferEvent`]s from confirmed byte counts.
///
/// Bytes already present locally when the tracker is created count towards
/// the percentage but are never reported on their own.
pub struct ProgressTracker {
    tag: String,
    local_bytes: u64,
    /// `None` when the size is zero or unknown
    total: Option<u64>,
    last_percent: u8,
    finished: bool,
    callback: Option<OnTransferEvent>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("tag", &self.tag)
            .field("local_bytes", &self.local_bytes)
            .field("total", &self.total)
            .field("last_percent", &self.last_percent)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(
        tag: impl Into<String>,
        local_bytes: u64,
        total: Option<u64>,
        callback: Option<OnTransferEvent>,
    ) -> Self {
        let total = total.filter(|&t| t > 0);
        let mut tracker = Self {
            tag: tag.into(),
            local_bytes,
            total,
            last_percent: 0,
            finished: false,
            callback,
        };
        tracker.last_percent = tracker.percent().unwrap_or(0);
        tracker
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn local_bytes(&self) -> u64 {
        self.local_bytes
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Set the expected size once it becomes known; the current percentage
    /// becomes the new baseline
    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total.filter(|&t| t > 0);
        self.last_percent = self.percent().unwrap_or(0);
    }

    /// Whether a completion or error has been reported
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `floor(local * 100 / total)`, capped at 100; `None` while indeterminate
    pub fn percent(&self) -> Option<u8> {
        let total = self.total?;
        let percent = (self.local_bytes as u128 * 100 / total as u128).min(100);
        Some(percent as u8)
    }

    /// Record `n` more bytes confirmed written
    pub fn advance(&mut self, n: u64) {
        if self.finished {
            return;
        }
        self.local_bytes += n;

        let Some(percent) = self.percent() else {
            return;
        };
        if percent > self.last_percent {
            self.last_percent = percent;
            self.emit(TransferEvent::Progress { percent });
            if percent >= 100 {
                self.finished = true;
                self.emit(TransferEvent::Completed);
            }
        }
    }

    /// Signal completion explicitly; a no-op if already reported
    pub fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(TransferEvent::Completed);
    }

    /// Report a failure; later calls on this tracker are ignored
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(TransferEvent::Error {
            message: message.into(),
        });
    }

    fn emit(&self, event: TransferEvent) {
        trace!(tag = %self.tag, event = ?event, "Transfer event");
        if let Some(callback) = &self.callback {
            callback(&self.tag, event);
        }
    }
}
