use std::time::Duration;

use clap::Parser;
use error::AppError;
use indicatif::MultiProgress;
use pixcache_engine::{CacheConfig, ResumableTransfer, TransferConfig};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod commands;
mod error;
mod utils;

use cli::{CliArgs, Command};
use commands::Context;
use utils::progress::ProgressManager;
use utils::{parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("pixcache.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("Pixcache - image cache and resumable downloader");

    let max_disk = parse_size(&args.cache.max_disk)?;
    let max_memory = parse_size(&args.cache.max_memory)?;
    let cache_config = CacheConfig {
        enabled: max_disk > 0,
        disk_cache_path: args.cache.cache_dir.clone(),
        max_disk_cache_size: max_disk,
        max_memory_cache_size: max_memory,
    };

    info!(
        "HTTP timeout configuration: connect={}ms, read={}ms",
        args.transfer.connect_timeout, args.transfer.read_timeout
    );

    let transfer_config = {
        let mut builder = TransferConfig::builder()
            .with_connect_timeout(Duration::from_millis(args.transfer.connect_timeout))
            .with_read_timeout(Duration::from_millis(args.transfer.read_timeout))
            .with_system_proxy(!args.transfer.no_proxy);
        if let Some(user_agent) = &args.transfer.user_agent {
            builder = builder.with_user_agent(user_agent);
        }
        let mut config = builder.build();
        config.headers.extend(parse_headers(&args.transfer.headers));
        config
    };
    let transfer = ResumableTransfer::from_config(transfer_config)?;

    let show_progress = matches!(
        args.command,
        Command::Download {
            show_progress: true,
            ..
        }
    );
    let multi = MultiProgress::new();
    let progress = if show_progress {
        ProgressManager::new(multi)
    } else {
        ProgressManager::new_disabled(multi)
    };

    // Ctrl-C stops transfers but keeps partial files for the next run
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping transfers");
            on_signal.cancel();
        }
    });

    let ctx = Context {
        cache_config,
        transfer,
        progress,
        cancel,
    };

    match &args.command {
        Command::Fetch {
            urls,
            output_dir,
            raw,
        } => commands::fetch(&ctx, urls, output_dir.as_deref(), *raw).await,
        Command::Download { url, output, .. } => commands::download(&ctx, url, output).await,
        Command::Clear => commands::clear(&ctx).await,
        Command::Stats => commands::stats(&ctx).await,
    }
}
