use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MAX_SEGMENTS: usize = 32;
pub const MANIFEST_SUFFIX: &str = ".segdl.json";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    /// `None` when the server did not report a length.
    pub total_size: Option<u64>,
    pub segment_count: usize,
    pub output_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub byte_start: u64,
    /// Inclusive. Ignored for an open-ended segment.
    pub byte_end: u64,
    pub bytes_written: u64,
    pub temp_file_path: PathBuf,
    /// Whole-file segment of unknown length, fetched without a `Range` header.
    #[serde(default)]
    pub open_ended: bool,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.byte_end - self.byte_start + 1
    }

    pub fn is_complete(&self) -> bool {
        self.open_ended || self.bytes_written == self.len()
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.byte_start, self.byte_end)
    }
}

/// Phase of a single download. Pausing happens inside `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadPhase {
    Idle,
    Probing,
    Downloading,
    Merging,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadPhase::Completed | DownloadPhase::Cancelled | DownloadPhase::Failed
        )
    }
}

/// Splits `[0, total_size)` into contiguous inclusive ranges, the last one
/// taking the remainder. The count is clamped so that no range is empty.
pub fn plan_segments(total_size: u64, segment_count: usize, output_path: &Path) -> Vec<Segment> {
    if total_size == 0 {
        return vec![];
    }

    let count = (segment_count.max(1) as u64).min(total_size);
    let part_size = total_size / count;
    let mut parts = Vec::with_capacity(count as usize);

    for i in 0..count {
        let byte_start = i * part_size;
        let byte_end = if i == count - 1 {
            total_size - 1
        } else {
            (i + 1) * part_size - 1
        };

        parts.push(Segment {
            index: i as usize,
            byte_start,
            byte_end,
            bytes_written: 0,
            temp_file_path: part_path(output_path, i as usize),
            open_ended: false,
        });
    }

    parts
}

/// A single segment covering the whole resource, used when ranges are unavailable.
pub fn whole_file_segment(total_size: Option<u64>, output_path: &Path) -> Segment {
    let (byte_end, open_ended) = match total_size {
        Some(size) if size > 0 => (size - 1, false),
        _ => (0, true),
    };
    Segment {
        index: 0,
        byte_start: 0,
        byte_end,
        bytes_written: 0,
        temp_file_path: part_path(output_path, 0),
        open_ended,
    }
}

/// `movie.mkv` -> `movie.mkv.part3`, next to the output.
pub fn part_path(output_path: &Path, index: usize) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(format!(".part{}", index));
    output_path.with_file_name(name)
}

pub fn manifest_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(MANIFEST_SUFFIX);
    output_path.with_file_name(name)
}

/// Sidecar describing an in-flight download; read by `--list`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadManifest {
    pub task: DownloadTask,
    pub segments: Vec<Segment>,
}

impl DownloadManifest {
    /// Bytes on disk across all part files. Parts are only written by their
    /// worker, so their length is the segment's progress.
    pub fn bytes_on_disk(&self) -> u64 {
        self.segments
            .iter()
            .filter_map(|s| std::fs::metadata(&s.temp_file_path).ok())
            .map(|m| m.len())
            .sum()
    }
}
