//! # Resumable Transfers
//!
//! Downloads a remote resource into a local file, continuing from the current
//! length of that file with a ranged request. A partial file is never
//! truncated or deleted here; whether to start over after
//! [`TransferError::ResumeNotSupported`] is the caller's decision.

pub mod progress;

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::TransferConfig;
use crate::downloader::create_client;
use crate::error::TransferError;

pub use self::progress::{OnTransferEvent, ProgressTracker, TransferEvent};

/// Result of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Length of the local file before this attempt
    pub resumed_from: u64,
    /// Bytes appended by this attempt
    pub bytes_transferred: u64,
    /// Final length of the local file
    pub file_size: u64,
}

impl TransferOutcome {
    /// Whether the local file was already complete before this attempt
    pub fn was_complete(&self) -> bool {
        self.bytes_transferred == 0 && self.resumed_from > 0
    }
}

/// A parsed `Content-Range` header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    /// Inclusive first and last byte, `None` for `*`
    range: Option<(u64, u64)>,
    /// Complete length, `None` for `*`
    complete_length: Option<u64>,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let complete_length = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let range = match range.trim() {
        "*" => None,
        r => {
            let (start, end) = r.split_once('-')?;
            Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
        }
    };
    Some(ContentRange {
        range,
        complete_length,
    })
}

/// What the response headers say about the transfer
enum Plan {
    /// Stream the body, expecting this complete length if known
    Stream { total: Option<u64> },
    /// The local file already holds every byte
    AlreadyComplete,
}

/// Await `fut`, failing with [`TransferError::Timeout`] after `limit`.
/// A zero limit disables the timeout.
async fn within<F: Future>(limit: Duration, what: &str, fut: F) -> Result<F::Output, TransferError> {
    if limit.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransferError::Timeout(format!("{what} exceeded {limit:?}")))
}

/// Downloads with byte-range resumption
#[derive(Debug, Clone)]
pub struct ResumableTransfer {
    client: Client,
    config: TransferConfig,
}

impl ResumableTransfer {
    pub fn new(client: Client, config: TransferConfig) -> Self {
        Self { client, config }
    }

    /// Build a transfer with its own client
    pub fn from_config(config: TransferConfig) -> Result<Self, TransferError> {
        let client = create_client(&config)?;
        Ok(Self::new(client, config))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Download `url` into `path`, resuming from the current length of `path`.
    ///
    /// On any error the bytes already written stay in place so a later call
    /// can resume from them.
    #[instrument(level = "debug", skip(self, path, on_event, cancel), fields(path = ?path.as_ref()))]
    pub async fn run(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        on_event: Option<OnTransferEvent>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let path = path.as_ref();
        let offset = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let tag = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());
        let mut tracker = ProgressTracker::new(tag, offset, None, on_event);

        let result = self.attempt(url, path, offset, &mut tracker, &cancel).await;
        match &result {
            Ok(outcome) => {
                tracker.complete();
                info!(
                    url,
                    resumed_from = outcome.resumed_from,
                    bytes = outcome.bytes_transferred,
                    "Transfer completed"
                );
            }
            Err(e) => {
                tracker.fail(e.to_string());
                warn!(url, offset, error = %e, "Transfer failed");
            }
        }
        result
    }

    async fn attempt(
        &self,
        url: &str,
        path: &Path,
        offset: u64,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let url = Url::parse(url).map_err(|_| TransferError::InvalidUrl(url.to_string()))?;

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        // Connect is bounded by the client; this bounds the wait for headers
        let header_limit = self.config.connect_timeout + self.config.read_timeout;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = within(header_limit, "waiting for response headers", request.send()) => response??,
        };

        let total = match Self::plan(&response, offset)? {
            Plan::AlreadyComplete => {
                debug!(%url, offset, "Local file already complete");
                return Ok(TransferOutcome {
                    resumed_from: offset,
                    bytes_transferred: 0,
                    file_size: offset,
                });
            }
            Plan::Stream { total } => total,
        };
        tracker.set_total(total);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        let mut writer = BufWriter::with_capacity(self.config.buffer_size, file);
        writer.seek(io::SeekFrom::Start(offset)).await?;

        let streamed = self
            .stream_body(response, &mut writer, tracker, cancel)
            .await;
        // Keep whatever arrived so the next attempt can resume from it
        let flushed = writer.flush().await;
        let (transferred, unconfirmed) = streamed?;
        flushed?;
        writer.get_ref().sync_data().await?;
        // Only now can the last chunk carry the tracker to 100%
        tracker.advance(unconfirmed);

        let file_size = offset + transferred;
        if let Some(total) = total
            && file_size < total
        {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended at {file_size} of {total} bytes"),
            )));
        }

        Ok(TransferOutcome {
            resumed_from: offset,
            bytes_transferred: transferred,
            file_size,
        })
    }

    /// Decide from the status and headers how to continue
    fn plan(response: &Response, offset: u64) -> Result<Plan, TransferError> {
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| (v.to_string(), parse_content_range(v)));

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let Some((raw, parsed)) = content_range else {
                    return Err(TransferError::InvalidContentRange("missing".to_string()));
                };
                let range = parsed.ok_or_else(|| TransferError::InvalidContentRange(raw.clone()))?;
                match range.range {
                    Some((start, _)) if start == offset => {}
                    _ => return Err(TransferError::InvalidContentRange(raw)),
                }
                let total = range
                    .complete_length
                    .or_else(|| response.content_length().map(|len| offset + len));
                Ok(Plan::Stream { total })
            }
            StatusCode::OK if offset > 0 => {
                debug!(offset, "Server ignored the range request");
                Err(TransferError::ResumeNotSupported { offset })
            }
            StatusCode::OK => Ok(Plan::Stream {
                total: response.content_length(),
            }),
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                let complete_length = content_range
                    .and_then(|(_, parsed)| parsed)
                    .and_then(|range| range.complete_length);
                match complete_length {
                    Some(len) if len == offset => Ok(Plan::AlreadyComplete),
                    // Local file does not match the remote resource
                    _ => Err(TransferError::ResumeNotSupported { offset }),
                }
            }
            status => Err(TransferError::Status(status)),
        }
    }

    /// Write the body, returning the bytes written and how many of them at
    /// the tail were not yet reported to `tracker`
    async fn stream_body<W>(
        &self,
        response: Response,
        writer: &mut W,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = response.bytes_stream();
        let mut transferred = 0u64;
        let mut unconfirmed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = within(self.config.read_timeout, "waiting for body data", stream.next()) => next?,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            tracker.advance(unconfirmed);
            unconfirmed = chunk.len() as u64;
        }

        Ok((transferred, unconfirmed))
    }
}
