use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::merge::{merge_parts, remove_parts};
use crate::probe::probe;
use crate::state::{
    manifest_path, plan_segments, whole_file_segment, DownloadManifest, DownloadPhase,
    DownloadTask, Segment, MAX_SEGMENTS,
};
use crate::worker::{fetch_segment, RateLimit, WorkerContext};

const UNKNOWN_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { path: PathBuf, bytes: u64 },
    Cancelled,
}

/// Caller-side handle to a running download: pause, resume, cancel, progress.
#[derive(Clone)]
pub struct DownloadControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    phase: Arc<watch::Sender<DownloadPhase>>,
    downloaded: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Default for DownloadControl {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(watch::channel(false).0),
            phase: Arc::new(watch::channel(DownloadPhase::Idle).0),
            downloaded: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(UNKNOWN_SIZE)),
        }
    }

    /// A handle for one download of a batch. It shares the pause flag and
    /// follows cancellation of `self`, but keeps its own progress and phase.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            paused: self.paused.clone(),
            phase: Arc::new(watch::channel(DownloadPhase::Idle).0),
            downloaded: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(UNKNOWN_SIZE)),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bytes received so far across all segments.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            UNKNOWN_SIZE => None,
            size => Some(size),
        }
    }

    pub fn phase(&self) -> DownloadPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<DownloadPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: DownloadPhase) {
        tracing::debug!(?phase, "download phase");
        self.phase.send_replace(phase);
    }
}

pub struct Downloader {
    client: Client,
    rate_limit: Option<RateLimit>,
}

impl Downloader {
    pub fn new(config: &DownloaderConfig) -> Self {
        Self {
            client: config.build_client(),
            rate_limit: config.rate_limit.and_then(RateLimit::per_second),
        }
    }

    pub async fn start(
        &self,
        url: &str,
        output_path: &Path,
        segment_count: usize,
    ) -> Result<Outcome, DownloadError> {
        self.start_with_control(url, output_path, segment_count, &DownloadControl::new())
            .await
    }

    /// Runs one download to completion. Cancellation is reported as
    /// `Ok(Outcome::Cancelled)`; every error path removes temp artifacts.
    pub async fn start_with_control(
        &self,
        url: &str,
        output_path: &Path,
        segment_count: usize,
        control: &DownloadControl,
    ) -> Result<Outcome, DownloadError> {
        let result = match self.run(url, output_path, segment_count, control).await {
            Err(DownloadError::Cancelled) => Ok(Outcome::Cancelled),
            other => other,
        };

        match &result {
            Ok(Outcome::Completed { bytes, .. }) => {
                tracing::info!(url, bytes, "download completed");
                control.set_phase(DownloadPhase::Completed);
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!(url, "download cancelled");
                control.set_phase(DownloadPhase::Cancelled);
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "download failed");
                control.set_phase(DownloadPhase::Failed);
            }
        }
        result
    }

    async fn run(
        &self,
        url: &str,
        output_path: &Path,
        segment_count: usize,
        control: &DownloadControl,
    ) -> Result<Outcome, DownloadError> {
        if !(1..=MAX_SEGMENTS).contains(&segment_count) {
            return Err(DownloadError::InvalidSegmentCount {
                got: segment_count,
                max: MAX_SEGMENTS,
            });
        }
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(DownloadError::InvalidUrl(url.to_string())),
        }
        if control.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        control.set_phase(DownloadPhase::Probing);
        let probed = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => return Err(DownloadError::Cancelled),
            probed = probe(&self.client, url) => probed?,
        };
        tracing::debug!(url, size = ?probed.total_size, ranges = probed.accepts_ranges, "probed");
        control
            .total
            .store(probed.total_size.unwrap_or(UNKNOWN_SIZE), Ordering::Relaxed);

        if probed.total_size == Some(0) {
            fs::File::create(output_path)
                .await
                .map_err(|source| DownloadError::MergeIo {
                    path: output_path.to_path_buf(),
                    source,
                })?;
            return Ok(Outcome::Completed {
                path: output_path.to_path_buf(),
                bytes: 0,
            });
        }

        let ranged = probed.accepts_ranges && probed.total_size.is_some();
        let mut task = DownloadTask {
            url: url.to_string(),
            total_size: probed.total_size,
            segment_count,
            output_path: output_path.to_path_buf(),
        };

        let manifest = manifest_path(output_path);
        let result = self.fetch_all(&mut task, ranged, control).await;
        remove_manifest(&manifest).await;
        let segments = result?;

        if control.is_cancelled() {
            remove_parts(&segments).await;
            return Err(DownloadError::Cancelled);
        }

        control.set_phase(DownloadPhase::Merging);
        let bytes = merge_parts(&segments, output_path).await?;

        Ok(Outcome::Completed {
            path: output_path.to_path_buf(),
            bytes,
        })
    }

    /// Downloads every segment, falling back once to a single whole-file
    /// segment when the server turns out to ignore ranges.
    async fn fetch_all(
        &self,
        task: &mut DownloadTask,
        ranged: bool,
        control: &DownloadControl,
    ) -> Result<Vec<Segment>, DownloadError> {
        control.set_phase(DownloadPhase::Downloading);

        let segments = match (ranged, task.total_size) {
            (true, Some(size)) => plan_segments(size, task.segment_count, &task.output_path),
            _ => vec![whole_file_segment(task.total_size, &task.output_path)],
        };

        match self.fetch_segments(task, segments, ranged, control).await {
            Err(e) if ranged && e.is_range_unsupported() => {
                tracing::info!(url = %task.url, "server ignored range request, retrying as one segment");
                control.downloaded.store(0, Ordering::Relaxed);
                task.segment_count = 1;
                let whole = vec![whole_file_segment(task.total_size, &task.output_path)];
                self.fetch_segments(task, whole, false, control).await
            }
            other => other,
        }
    }

    async fn fetch_segments(
        &self,
        task: &DownloadTask,
        segments: Vec<Segment>,
        ranged: bool,
        control: &DownloadControl,
    ) -> Result<Vec<Segment>, DownloadError> {
        write_manifest(task, &segments).await;

        // Siblings are stopped on the first failure without touching the
        // caller's token.
        let attempt = control.cancel.child_token();
        let ctx = WorkerContext {
            client: self.client.clone(),
            url: task.url.clone(),
            ranged,
            progress: control.downloaded.clone(),
            cancel: attempt.clone(),
            paused: control.paused.subscribe(),
            rate_limit: self.rate_limit.clone(),
        };

        let mut workers = JoinSet::new();
        for segment in segments.iter().cloned() {
            workers.spawn(fetch_segment(ctx.clone(), segment));
        }

        let mut finished = Vec::with_capacity(segments.len());
        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(DownloadError::from).and_then(|r| r) {
                Ok(segment) => finished.push(segment),
                Err(e) => {
                    if failure.is_none() {
                        attempt.cancel();
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            remove_parts(&segments).await;
            return Err(e);
        }

        finished.sort_by_key(|s| s.index);
        if let Some(short) = finished.iter().find(|s| !s.is_complete()) {
            let err = DownloadError::Incomplete {
                index: short.index,
                expected: short.len(),
                received: short.bytes_written,
            };
            remove_parts(&segments).await;
            return Err(err);
        }

        Ok(finished)
    }
}

async fn write_manifest(task: &DownloadTask, segments: &[Segment]) {
    let manifest = DownloadManifest {
        task: task.clone(),
        segments: segments.to_vec(),
    };
    let path = manifest_path(&task.output_path);
    let written = match serde_json::to_vec_pretty(&manifest) {
        Ok(content) => fs::write(&path, content).await.map_err(anyhow::Error::from),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = written {
        tracing::warn!(path = ?path, error = %e, "failed to write manifest");
    }
}

async fn remove_manifest(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = ?path, error = %e, "failed to remove manifest");
        }
    }
}
