use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::state::Segment;

/// Byte budget shared by every worker of every download.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    burst: NonZeroU32,
}

impl RateLimit {
    pub fn per_second(bytes: u32) -> Option<Self> {
        let burst = NonZeroU32::new(bytes)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(burst))),
            burst,
        })
    }

    /// Waits until `len` bytes may pass. Chunks larger than one second of
    /// quota are admitted piecewise.
    pub async fn acquire(&self, len: usize) {
        let mut remaining = len as u64;
        while remaining > 0 {
            let n = remaining.min(self.burst.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(n) {
                // n never exceeds the burst size, so capacity is always sufficient.
                let _ = self.limiter.until_n_ready(n).await;
            }
            remaining -= n as u64;
        }
    }
}

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub url: String,
    /// Send `Range` and insist on `206`. Off for the whole-file fallback.
    pub ranged: bool,
    pub progress: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub paused: watch::Receiver<bool>,
    pub rate_limit: Option<RateLimit>,
}

/// Streams one segment into its part file. Returns the segment with
/// `bytes_written` filled in.
pub async fn fetch_segment(
    ctx: WorkerContext,
    mut segment: Segment,
) -> Result<Segment, DownloadError> {
    wait_while_paused(&ctx).await?;

    let mut request = ctx.client.get(&ctx.url);
    if ctx.ranged {
        request = request.header(header::RANGE, segment.range_header());
    }

    let response = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus {
            url: ctx.url.clone(),
            status,
        });
    }
    if ctx.ranged {
        let length_matches = response
            .content_length()
            .map_or(true, |len| len == segment.len());
        if status != StatusCode::PARTIAL_CONTENT || !length_matches {
            return Err(DownloadError::RangeUnsupported {
                index: segment.index,
            });
        }
    }

    let path = segment.temp_file_path.clone();
    let temp_err = |source| DownloadError::TempFile {
        path: path.clone(),
        source,
    };

    let mut file = File::create(&segment.temp_file_path)
        .await
        .map_err(temp_err)?;
    let mut stream = response.bytes_stream();

    tracing::debug!(
        index = segment.index,
        start = segment.byte_start,
        end = segment.byte_end,
        "segment started"
    );

    loop {
        wait_while_paused(&ctx).await?;

        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(item) = next else { break };
        let chunk = item?;
        let len = chunk.len() as u64;
        if len == 0 {
            continue;
        }

        if !segment.open_ended && segment.bytes_written + len > segment.len() {
            return Err(DownloadError::RangeUnsupported {
                index: segment.index,
            });
        }

        if let Some(limit) = &ctx.rate_limit {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = limit.acquire(chunk.len()) => {}
            }
        }

        file.write_all(&chunk).await.map_err(temp_err)?;
        segment.bytes_written += len;
        ctx.progress.fetch_add(len, Ordering::Relaxed);
    }

    file.flush().await.map_err(temp_err)?;

    if !segment.is_complete() {
        return Err(DownloadError::Incomplete {
            index: segment.index,
            expected: segment.len(),
            received: segment.bytes_written,
        });
    }

    tracing::debug!(index = segment.index, bytes = segment.bytes_written, "segment finished");
    Ok(segment)
}

/// Parks the worker until the pause flag clears or the download is cancelled.
async fn wait_while_paused(ctx: &WorkerContext) -> Result<(), DownloadError> {
    let mut paused = ctx.paused.clone();
    if !*paused.borrow() {
        return Ok(());
    }

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(DownloadError::Cancelled),
        resumed = paused.wait_for(|p| !*p) => match resumed {
            Ok(_) => Ok(()),
            // Control handle dropped while paused; nobody can resume us.
            Err(_) => Err(DownloadError::Cancelled),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::plan_segments;
    use crate::test_support::{payload, ServerMode, TestServer};
    use tempfile::TempDir;

    fn context(url: String, ranged: bool) -> (WorkerContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let ctx = WorkerContext {
            client: Client::new(),
            url,
            ranged,
            progress: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            paused: rx,
            rate_limit: None,
        };
        (ctx, tx)
    }

    #[tokio::test]
    async fn fetches_exactly_its_range() {
        let data = payload(10_000);
        let server = TestServer::start(data.clone(), ServerMode::Ranges).await;
        let dir = TempDir::new().unwrap();
        let segs = plan_segments(10_000, 3, &dir.path().join("out.bin"));
        let (ctx, _tx) = context(server.url(), true);

        let seg = fetch_segment(ctx.clone(), segs[1].clone()).await.unwrap();

        assert_eq!(seg.bytes_written, seg.len());
        let written = std::fs::read(&seg.temp_file_path).unwrap();
        assert_eq!(written, &data[3333..6666]);
        assert_eq!(ctx.progress.load(Ordering::Relaxed), 3333);
        assert_eq!(server.ranges_seen(), vec![Some("bytes=3333-6665".to_string())]);
    }

    #[tokio::test]
    async fn ignored_range_is_reported() {
        let server = TestServer::start(payload(1000), ServerMode::NoRanges).await;
        let dir = TempDir::new().unwrap();
        let segs = plan_segments(1000, 2, &dir.path().join("out.bin"));
        let (ctx, _tx) = context(server.url(), true);

        let err = fetch_segment(ctx, segs[1].clone()).await.unwrap_err();
        assert!(err.is_range_unsupported());
    }

    #[tokio::test]
    async fn short_body_is_incomplete() {
        let server = TestServer::start(payload(10_000), ServerMode::ShortSegment(3333)).await;
        let dir = TempDir::new().unwrap();
        let segs = plan_segments(10_000, 3, &dir.path().join("out.bin"));
        let (ctx, _tx) = context(server.url(), true);

        let err = fetch_segment(ctx.clone(), segs[1].clone()).await.unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Incomplete {
                index: 1,
                expected: 3333,
                received: 1666
            }
        ));
        assert_eq!(ctx.progress.load(Ordering::Relaxed), 1666);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let server = TestServer::start(payload(1000), ServerMode::Ranges).await;
        let dir = TempDir::new().unwrap();
        let segs = plan_segments(1000, 1, &dir.path().join("out.bin"));
        let (ctx, _tx) = context(server.url(), true);
        ctx.cancel.cancel();

        let err = fetch_segment(ctx, segs[0].clone()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert!(server.ranges_seen().is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_a_paused_worker() {
        let server = TestServer::start(payload(1000), ServerMode::Ranges).await;
        let dir = TempDir::new().unwrap();
        let segs = plan_segments(1000, 1, &dir.path().join("out.bin"));
        let (ctx, tx) = context(server.url(), true);
        tx.send_replace(true);

        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(fetch_segment(ctx, segs[0].clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!worker.is_finished());

        cancel.cancel();
        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }

    #[tokio::test]
    async fn rate_limit_admits_oversized_chunks() {
        let limit = RateLimit::per_second(1024).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), limit.acquire(1500))
            .await
            .unwrap();
        assert!(RateLimit::per_second(0).is_none());
    }
}
