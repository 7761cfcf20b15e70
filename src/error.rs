use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server returned {status} for {url}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The server ignored the `Range` header. Triggers the single-segment fallback.
    #[error("server ignored range request for segment {index}")]
    RangeUnsupported { index: usize },

    #[error("segment {index} ended early: expected {expected} bytes, got {received}")]
    Incomplete {
        index: usize,
        expected: u64,
        received: u64,
    },

    #[error("failed to write part file {path:?}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("merge failed at {path:?}")]
    MergeIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("segment count must be between 1 and {max}, got {got}")]
    InvalidSegmentCount { got: usize, max: usize },

    #[error("unsupported url {0}")]
    InvalidUrl(String),

    #[error("hash mismatch: expected {expected}, got {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("worker task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl DownloadError {
    pub fn is_range_unsupported(&self) -> bool {
        matches!(self, DownloadError::RangeUnsupported { .. })
    }
}
