use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use pixcache_engine::{OnTransferEvent, TransferEvent};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::warn;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {pos}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Renders transfer events as one progress bar per transfer tag
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            disabled: true,
            ..Self::new(multi)
        }
    }

    /// Callback feeding this manager, for [`pixcache_engine::HttpSource`] or
    /// [`pixcache_engine::ResumableTransfer`]
    pub fn callback(&self) -> OnTransferEvent {
        let manager = self.clone();
        Arc::new(move |tag: &str, event| manager.handle_event(tag, event))
    }

    pub fn handle_event(&self, tag: &str, event: TransferEvent) {
        if self.disabled {
            return;
        }

        let mut bars = self.bars.lock();
        match event {
            TransferEvent::Progress { percent } => {
                let bar = bars.entry(tag.to_string()).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new(100));
                    bar.set_style(download_style());
                    bar.set_message(format!("Downloading {tag}"));
                    bar.enable_steady_tick(Duration::from_millis(500));
                    bar
                });
                bar.set_position(percent as u64);
            }
            TransferEvent::Completed => {
                if let Some(bar) = bars.remove(tag) {
                    bar.finish_with_message(format!("Finished {tag}"));
                }
            }
            TransferEvent::Error { message } => {
                match bars.remove(tag) {
                    Some(bar) => bar.abandon_with_message(format!("Failed {tag}: {message}")),
                    None => warn!(tag, message = %message, "Transfer failed"),
                }
            }
        }
    }
}
