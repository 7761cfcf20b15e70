use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::cli::VerifyMode;
use crate::config::DownloaderConfig;
use crate::downloader::{DownloadControl, Downloader, Outcome};
use crate::state::{DownloadManifest, MANIFEST_SUFFIX};
use crate::utils::{get_filename_from_url, get_unique_filepath, get_unique_filepath_by, sanitize_filename};

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub hash: Option<String>,
}

/// Parses a tasks file body: one `url` or `url|sha256` per line, `#` comments.
pub fn parse_tasks(content: &str) -> Vec<DownloadItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|raw| {
            let mut parts = raw.splitn(2, '|');
            let url = parts.next().unwrap_or_default().trim().to_string();
            let hash = parts
                .next()
                .map(|h| h.trim().to_string())
                .filter(|s| !s.is_empty());
            (!url.is_empty()).then_some(DownloadItem { url, hash })
        })
        .collect()
}

/// Shared state of one CLI run: the downloader, progress bars and the root
/// control handle that signals act on.
struct Session {
    downloader: Downloader,
    control: DownloadControl,
    multi_progress: MultiProgress,
    split: usize,
    verify_mode: VerifyMode,
    downloaded_files: Arc<AtomicUsize>,
    downloaded_bytes: Arc<AtomicU64>,
    header_task: JoinHandle<()>,
}

impl Session {
    fn new(
        config: &DownloaderConfig,
        control: DownloadControl,
        split: usize,
        verify_mode: VerifyMode,
        total_files: usize,
    ) -> Self {
        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar()));

        let downloaded_files = Arc::new(AtomicUsize::new(0));
        let downloaded_bytes = Arc::new(AtomicU64::new(0));

        let df = downloaded_files.clone();
        let db = downloaded_bytes.clone();
        let header_task = tokio::spawn(async move {
            loop {
                header_pb.set_message(format!(
                    "Summary: Files: {}/{} | Downloaded: {}",
                    df.load(Ordering::Relaxed),
                    total_files,
                    HumanBytes(db.load(Ordering::Relaxed)),
                ));
                header_pb.tick();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        Self {
            downloader: Downloader::new(config),
            control,
            multi_progress,
            split,
            verify_mode,
            downloaded_files,
            downloaded_bytes,
            header_task,
        }
    }

    fn bar(&self, name: &str) -> ProgressBar {
        let pb = self.multi_progress.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_message(format!("Downloading {}", name));
        pb
    }

    /// Mirrors a download's control handle onto its progress bar.
    fn watch(&self, pb: ProgressBar, control: DownloadControl, name: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut was_paused = false;
            loop {
                if let Some(total) = control.total_size() {
                    pb.set_length(total);
                }
                pb.set_position(control.downloaded());
                let paused = control.is_paused();
                if paused != was_paused {
                    let state = if paused { "Paused" } else { "Downloading" };
                    pb.set_message(format!("{} {}", state, name));
                    was_paused = paused;
                }
                if control.phase().is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    }

    async fn download(&self, item: &DownloadItem, filepath: &Path) -> Result<()> {
        let name = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| item.url.clone());

        let control = self.control.child();
        let pb = self.bar(&name);
        let monitor = self.watch(pb.clone(), control.clone(), name.clone());

        let result = self
            .downloader
            .start_with_control(&item.url, filepath, self.split, &control)
            .await;
        let _ = monitor.await;

        match result {
            Ok(Outcome::Completed { path, bytes }) => {
                pb.set_position(bytes);
                let verified = match self.verify(item, &path).await {
                    Ok(v) => v,
                    Err(e) => {
                        pb.abandon_with_message(format!("Failed      {}: {}", name, e));
                        return Err(e);
                    }
                };
                match verified {
                    Some(hash) => pb.finish_with_message(format!("Verified    {} (SHA256: {})", name, hash)),
                    None => pb.finish_with_message(format!("Completed   {}", name)),
                }
                self.downloaded_files.fetch_add(1, Ordering::Relaxed);
                self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Ok(Outcome::Cancelled) => {
                pb.abandon_with_message(format!("Cancelled   {}", name));
                Ok(())
            }
            Err(e) => {
                pb.abandon_with_message(format!("Failed      {}: {}", name, e));
                Err(e).with_context(|| format!("Failed to download {}", item.url))
            }
        }
    }

    /// Returns the computed hash when a check was performed.
    async fn verify(&self, item: &DownloadItem, path: &Path) -> Result<Option<String>> {
        match (&self.verify_mode, &item.hash) {
            (VerifyMode::Off, _) => Ok(None),
            (VerifyMode::On, None) => bail!("Missing hash for {}", item.url),
            (_, None) => Ok(None),
            (_, Some(expected)) => {
                let hash = crate::hashing::calculate_hash(path).await?;
                if let Err(e) = crate::hashing::verify(expected, &hash) {
                    // Remove corrupted output to avoid confusion
                    let _ = fs::remove_file(path).await;
                    return Err(e.into());
                }
                Ok(Some(hash))
            }
        }
    }

    fn skip_existing(&self, filepath: &Path, size: u64, created: DateTime<Local>) {
        let pb = self.multi_progress.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}") {
            pb.set_style(style);
        }
        let name = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        pb.finish_with_message(format!(
            "{:>25} {:>17} Skipped {}",
            HumanBytes(size).to_string(),
            created.format("%Y-%m-%d %H:%M").to_string(),
            name
        ));
        self.downloaded_files.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(size, Ordering::Relaxed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.header_task.abort();
    }
}

pub struct SingleDownload {
    pub url: String,
    pub output: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub split: usize,
    pub verify_mode: VerifyMode,
    pub sha256: Option<String>,
}

pub async fn run_single_download(
    job: SingleDownload,
    config: &DownloaderConfig,
    control: DownloadControl,
) -> Result<()> {
    if matches!(job.verify_mode, VerifyMode::On) && job.sha256.is_none() {
        bail!("--verify-hash on requires --sha256");
    }

    let filepath = match job.output {
        Some(path) => path,
        None => {
            if !job.download_dir.exists() {
                fs::create_dir_all(&job.download_dir)
                    .await
                    .context("Failed to create download directory")?;
            }
            let filename = sanitize_filename(&get_filename_from_url(&job.url)?);
            get_unique_filepath(&job.download_dir, &filename)
        }
    };

    let item = DownloadItem {
        url: job.url,
        hash: job.sha256,
    };
    let session = Session::new(config, control, job.split, job.verify_mode, 1);
    session.download(&item, &filepath).await
}

pub async fn run_downloads(
    tasks_file: PathBuf,
    download_dir: PathBuf,
    concurrency: Option<usize>,
    split: usize,
    verify_mode: VerifyMode,
    config: &DownloaderConfig,
    control: DownloadControl,
) -> Result<()> {
    if !download_dir.exists() {
        fs::create_dir_all(&download_dir)
            .await
            .context("Failed to create download directory")?;
    }

    let content = fs::read_to_string(&tasks_file)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", tasks_file))?;
    let items = parse_tasks(&content);

    if matches!(verify_mode, VerifyMode::On) {
        let missing: Vec<&str> = items
            .iter()
            .filter(|i| i.hash.is_none())
            .map(|i| i.url.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("Verify mode is on, but these entries have no hash: {:?}", missing);
        }
    }

    let total_files = items.len();
    let session = Arc::new(Session::new(config, control, split, verify_mode, total_files));
    let concurrency = concurrency.unwrap_or_else(num_cpus::get).max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let failed = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    // Targets are assigned in task order before anything is spawned, so
    // lines sharing a filename get distinct outputs and part files.
    let mut claimed: HashSet<PathBuf> = HashSet::new();

    for item in items {
        let filename = match get_filename_from_url(&item.url) {
            Ok(name) => sanitize_filename(&name),
            Err(e) => {
                failed.fetch_add(1, Ordering::Relaxed);
                session
                    .multi_progress
                    .suspend(|| eprintln!("Invalid URL {}: {:#}", item.url, e));
                continue;
            }
        };
        let filepath = get_unique_filepath_by(&download_dir, &filename, |p| claimed.contains(p));
        claimed.insert(filepath.clone());

        let session = session.clone();
        let semaphore = semaphore.clone();
        let failed = failed.clone();

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if let Err(e) = download_listed(&session, &item, &filepath).await {
                failed.fetch_add(1, Ordering::Relaxed);
                session.multi_progress.suspend(|| eprintln!("{:#}", e));
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }

    let failed = failed.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total_files);
    }
    Ok(())
}

async fn download_listed(session: &Session, item: &DownloadItem, filepath: &Path) -> Result<()> {
    if filepath.exists() {
        let metadata = fs::metadata(filepath).await?;
        let stamp = metadata.created().or_else(|_| metadata.modified())?;
        session.skip_existing(filepath, metadata.len(), stamp.into());
        return Ok(());
    }

    session.download(item, filepath).await
}

/// `name.part12` style segment files.
fn is_part_file(name: &str) -> bool {
    name.rsplit_once(".part")
        .map(|(_, index)| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

pub async fn list_downloads(download_dir: PathBuf) -> Result<()> {
    if !download_dir.exists() {
        println!("Download directory '{:?}' does not exist.", download_dir);
        println!("Tip: If you used a custom download directory, specify it with --download-dir");
        return Ok(());
    }

    let mut active = vec![];
    let mut completed = vec![];

    let mut entries = fs::read_dir(&download_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        if let Some(target) = filename.strip_suffix(MANIFEST_SUFFIX) {
            let Ok(content) = fs::read_to_string(&path).await else { continue };
            if let Ok(manifest) = serde_json::from_str::<DownloadManifest>(&content) {
                active.push((target.to_string(), manifest.bytes_on_disk(), manifest.task.total_size));
            }
        } else if !is_part_file(&filename) && filename != ".DS_Store" {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                completed.push((filename, metadata.len()));
            }
        }
    }

    let downloaded: u64 = active.iter().map(|(_, d, _)| d).sum::<u64>()
        + completed.iter().map(|(_, s)| s).sum::<u64>();
    println!(
        "Summary: Completed: {} | Active: {} | Downloaded: {}",
        completed.len(),
        active.len(),
        HumanBytes(downloaded)
    );
    println!();

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");

    for (name, done, total) in &active {
        let (progress, size) = match total {
            Some(total) if *total > 0 => (
                format!("{:.2}%", *done as f64 / *total as f64 * 100.0),
                HumanBytes(*total).to_string(),
            ),
            _ => ("?".to_string(), "unknown".to_string()),
        };
        println!("{:<50} {:<15} {:<15} {:<15}", name, "Downloading", progress, size);
    }
    for (name, size) in &completed {
        println!("{:<50} {:<15} {:<15} {:<15}", name, "Completed", "100.00%", HumanBytes(*size).to_string());
    }

    if active.is_empty() && completed.is_empty() {
        println!("No active or completed downloads found in '{:?}'.", download_dir);
    }

    Ok(())
}

pub async fn follow_list(download_dir: PathBuf) -> Result<()> {
    loop {
        print!("\x1B[1;1H\x1B[0J");
        list_downloads(download_dir.clone()).await?;
        println!("\n(Press Ctrl+C to exit view)");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
