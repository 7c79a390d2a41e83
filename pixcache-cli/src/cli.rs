use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Two-tier image cache and resumable downloader",
    long_about = "Fetches images through a memory and disk cache, downloads files with\n\
                  byte-range resumption, and maintains the on-disk cache directory.\n\
                  \n\
                  Interrupted downloads continue from where they stopped the next time\n\
                  the same command is run."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    #[command(flatten)]
    pub cache: CacheArgs,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fetch URLs through the cache
    Fetch {
        /// URL(s) to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Copy fetched payloads into this directory
        #[arg(short, long, help = "Directory where fetched payloads are written")]
        output_dir: Option<PathBuf>,

        /// Keep payloads as raw bytes instead of validating them as images
        #[arg(long, help = "Skip image header validation")]
        raw: bool,
    },
    /// Download a URL to a file, resuming a previous partial download
    Download {
        /// URL to download
        url: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,

        /// Show a progress bar
        #[arg(short = 'P', long = "progress", help = "Show a progress bar for the download")]
        show_progress: bool,
    },
    /// Delete every cached entry
    Clear,
    /// Print cache statistics
    Stats,
}

#[derive(Args)]
pub struct CacheArgs {
    /// Cache directory
    #[arg(
        long,
        global = true,
        help = "Directory for the disk cache (default: <temp>/pixcache)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Maximum disk cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        global = true,
        default_value = "50MB",
        help = "Maximum size of the disk cache with optional unit (B, KB, MB, GB, TB). Use 0 to disable the disk cache."
    )]
    pub max_disk: String,

    /// Maximum memory cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        global = true,
        default_value = "16MB",
        help = "Maximum size of the memory cache with optional unit (B, KB, MB, GB, TB)"
    )]
    pub max_memory: String,
}

#[derive(Args)]
pub struct TransferArgs {
    /// Connection timeout in milliseconds
    #[arg(
        long,
        global = true,
        default_value = "3000",
        help = "Connection timeout in milliseconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in milliseconds
    #[arg(
        long,
        global = true,
        default_value = "3000",
        help = "Read timeout in milliseconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// User agent sent with every request
    #[arg(long, global = true, help = "User agent string for HTTP requests")]
    pub user_agent: Option<String>,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        global = true,
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        global = true,
        help = "Disable all proxy settings (including system proxy) for downloads"
    )]
    pub no_proxy: bool,
}
