use std::path::{Path, PathBuf};

use bytes::Bytes;

use pixcache_engine::{
    CacheKey, CacheManager, CacheStatus, HttpSource, ImageDecoder, InitState, PayloadDecoder,
    RawDecoder, ResumableTransfer,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::utils::format_bytes;
use crate::utils::progress::ProgressManager;

/// Everything a subcommand needs, built once in `main`
pub struct Context {
    pub cache_config: pixcache_engine::CacheConfig,
    pub transfer: ResumableTransfer,
    pub progress: ProgressManager,
    pub cancel: CancellationToken,
}

impl Context {
    fn staging_dir(&self) -> PathBuf {
        self.cache_config.resolved_disk_path().with_extension("staging")
    }

    fn http_source(&self) -> HttpSource {
        HttpSource::new(self.transfer.clone(), self.staging_dir())
            .with_progress(self.progress.callback())
            .with_cancellation(self.cancel.clone())
    }
}

/// File name for a fetched payload inside the output directory
fn output_name(key: &CacheKey, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{key}.{ext}"),
        None => key.to_string(),
    }
}

async fn write_output(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, AppError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

fn describe(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::MemoryHit => "memory hit",
        CacheStatus::DiskHit => "disk hit",
        CacheStatus::Populated => "downloaded and cached",
        CacheStatus::Uncached => "downloaded (not cached)",
    }
}

/// Fetch every URL through the cache; reports failures per URL and fails if
/// any URL failed
pub async fn fetch(
    ctx: &Context,
    urls: &[String],
    output_dir: Option<&Path>,
    raw: bool,
) -> Result<(), AppError> {
    if raw {
        let cache = CacheManager::new(ctx.cache_config.clone(), RawDecoder);
        fetch_all(ctx, &cache, urls, output_dir, |_| None, |bytes| bytes.clone()).await
    } else {
        let cache = CacheManager::new(ctx.cache_config.clone(), ImageDecoder);
        fetch_all(
            ctx,
            &cache,
            urls,
            output_dir,
            |image| Some(image.format.as_str()),
            |image| image.data.clone(),
        )
        .await
    }
}

async fn fetch_all<D, E, B>(
    ctx: &Context,
    cache: &CacheManager<D>,
    urls: &[String],
    output_dir: Option<&Path>,
    extension: E,
    bytes: B,
) -> Result<(), AppError>
where
    D: PayloadDecoder,
    E: Fn(&D::Payload) -> Option<&'static str>,
    B: Fn(&D::Payload) -> Bytes,
{
    cache.start();
    let http = ctx.http_source();
    let mut failures = 0usize;

    for url in urls {
        match cache.fetch_url(url, &http).await {
            Ok((payload, status)) => {
                let data = bytes(&payload);
                info!(url = %url, status = describe(status), size = %format_bytes(data.len() as u64), "Fetched");
                if let Some(dir) = output_dir {
                    let key = CacheKey::from_identifier(url);
                    let path = write_output(dir, &output_name(&key, extension(&payload)), &data).await?;
                    info!(path = %path.display(), "Wrote payload");
                }
            }
            Err(e) => {
                failures += 1;
                error!(url = %url, error = %e, "Fetch failed");
            }
        }
    }

    cache.flush();
    cache.close();

    if failures > 0 {
        return Err(AppError::FetchFailed {
            failed: failures,
            total: urls.len(),
        });
    }
    Ok(())
}

/// Download `url` to `output`, resuming a previous partial file
pub async fn download(ctx: &Context, url: &str, output: &Path) -> Result<(), AppError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let callback = Some(ctx.progress.callback());
    let outcome = match ctx
        .transfer
        .run(url, output, callback.clone(), ctx.cancel.clone())
        .await
    {
        Err(pixcache_engine::TransferError::ResumeNotSupported { offset }) => {
            warn!(offset, "Server cannot resume, restarting from the beginning");
            tokio::fs::remove_file(output).await?;
            ctx.transfer
                .run(url, output, callback, ctx.cancel.clone())
                .await?
        }
        other => other?,
    };

    if outcome.was_complete() {
        info!(path = %output.display(), "File was already complete");
    } else {
        info!(
            path = %output.display(),
            resumed_from = %format_bytes(outcome.resumed_from),
            size = %format_bytes(outcome.file_size),
            "Download finished"
        );
    }
    Ok(())
}

pub async fn clear(ctx: &Context) -> Result<(), AppError> {
    let cache = CacheManager::new(ctx.cache_config.clone(), RawDecoder);
    if let InitState::Unavailable(reason) = cache.initializer().wait().await {
        return Err(AppError::Initialization(reason.to_string()));
    }

    cache.clear().await;
    cache.close();

    let staging = ctx.staging_dir();
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
    }
    info!(path = %ctx.cache_config.resolved_disk_path().display(), "Cache cleared");
    Ok(())
}

pub async fn stats(ctx: &Context) -> Result<(), AppError> {
    let cache = CacheManager::new(ctx.cache_config.clone(), RawDecoder);
    let state = cache.initializer().wait().await;
    let stats = cache.stats();

    info!(path = %ctx.cache_config.resolved_disk_path().display(), "Cache directory");
    match state {
        InitState::Unavailable(reason) => info!(reason = %reason, "Disk cache unavailable"),
        _ => info!(
            entries = stats.disk_entries.unwrap_or(0),
            used = %format_bytes(stats.disk_bytes.unwrap_or(0)),
            max = %format_bytes(stats.disk_max_bytes),
            "Disk cache"
        ),
    }
    cache.close();
    Ok(())
}
