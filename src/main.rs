use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use segdl::cli::VerifyMode;
use segdl::commands::{self, SingleDownload};
use segdl::config::{DownloaderConfig, DEFAULT_SEGMENTS};
use segdl::control;
use segdl::downloader::DownloadControl;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Single URL to download (optional, if provided, tasks-file is ignored)
    #[arg(index = 1)]
    url: Option<String>,

    /// Exact destination path for a single URL download
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Path to the file containing URLs (one per line, optionally `url|sha256`)
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Maximum number of files downloaded at once (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Number of segments per file, 1 to 32
    #[arg(short = 's', long, default_value_t = DEFAULT_SEGMENTS)]
    split: usize,

    /// Overall HTTP timeout in seconds (no limit by default)
    #[arg(long)]
    timeout: Option<u64>,

    /// Expected SHA-256 of a single URL download
    #[arg(long)]
    sha256: Option<String>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// List active and completed downloads in the download directory
    #[arg(short = 'l', long)]
    list: bool,

    /// Keep refreshing the list (like tail -f)
    #[arg(short = 'f', long)]
    follow: bool,

    /// Stop the running download process [Unix only]
    #[arg(short = 'x', long)]
    stop: bool,

    /// Pause the running download process [Unix only]
    #[arg(short = 'p', long)]
    pause: bool,

    /// Resume the running download process [Unix only]
    #[arg(short = 'u', long)]
    resume: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let mut args = Args::parse();

    if args.url.is_none() {
        if let Ok(abs_input) = std::fs::canonicalize(&args.tasks_file) {
            args.tasks_file = abs_input;
        }
    }
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    #[cfg(unix)]
    {
        if args.stop {
            return control::stop_running();
        }
        if args.pause {
            return control::pause_running();
        }
        if args.resume {
            return control::resume_running();
        }
    }

    let rt = tokio::runtime::Runtime::new()?;

    if args.list || args.follow {
        return rt.block_on(async move {
            if args.follow {
                commands::follow_list(args.download_dir).await
            } else {
                commands::list_downloads(args.download_dir).await
            }
        });
    }

    let config = DownloaderConfig {
        timeout: args.timeout.map(Duration::from_secs),
        rate_limit: args.rate_limit,
        ..DownloaderConfig::default()
    };

    let result = rt.block_on(async move {
        let handle = DownloadControl::new();
        control::cancel_on_ctrl_c(handle.clone());
        if let Err(e) = control::listen_for_signals(handle.clone()) {
            tracing::warn!(error = %e, "signal control unavailable");
        }

        if let Some(url) = args.url {
            let job = SingleDownload {
                url,
                output: args.output,
                download_dir: args.download_dir,
                split: args.split,
                verify_mode: args.verify_hash,
                sha256: args.sha256,
            };
            commands::run_single_download(job, &config, handle).await
        } else {
            commands::run_downloads(
                args.tasks_file,
                args.download_dir,
                args.concurrency,
                args.split,
                args.verify_hash,
                &config,
                handle,
            )
            .await
        }
    });

    control::cleanup_pid_file();
    result
}
