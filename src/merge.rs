use std::io::ErrorKind;
use std::path::Path;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::state::Segment;

/// Concatenates part files in index order into `output`, then deletes them.
/// On failure the partial output is removed as well.
pub async fn merge_parts(segments: &[Segment], output: &Path) -> Result<u64, DownloadError> {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    let result = concat(&ordered, output).await;
    if result.is_err() {
        if let Err(e) = fs::remove_file(output).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = ?output, error = %e, "failed to remove partial output");
            }
        }
    }
    remove_parts(segments).await;
    result
}

async fn concat(ordered: &[&Segment], output: &Path) -> Result<u64, DownloadError> {
    for segment in ordered {
        if let Err(source) = fs::metadata(&segment.temp_file_path).await {
            return Err(DownloadError::MergeIo {
                path: segment.temp_file_path.clone(),
                source,
            });
        }
    }

    let output_err = |source| DownloadError::MergeIo {
        path: output.to_path_buf(),
        source,
    };

    if let [only] = ordered {
        match fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(output_err(e)),
        }
        fs::rename(&only.temp_file_path, output)
            .await
            .map_err(output_err)?;
        let len = fs::metadata(output).await.map_err(output_err)?.len();
        return Ok(len);
    }

    let mut out = File::create(output).await.map_err(output_err)?;
    let mut total = 0u64;
    for segment in ordered {
        let mut part = File::open(&segment.temp_file_path)
            .await
            .map_err(|source| DownloadError::MergeIo {
                path: segment.temp_file_path.clone(),
                source,
            })?;
        total += tokio::io::copy(&mut part, &mut out)
            .await
            .map_err(output_err)?;
    }
    out.flush().await.map_err(output_err)?;
    out.sync_all().await.map_err(output_err)?;

    Ok(total)
}

/// Deletes every part file, ignoring ones that were never created.
pub async fn remove_parts(segments: &[Segment]) {
    for segment in segments {
        match fs::remove_file(&segment.temp_file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = ?segment.temp_file_path, error = %e, "failed to remove part file");
            }
        }
    }
}
