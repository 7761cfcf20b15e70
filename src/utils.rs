use anyhow::Result;
use std::path::{Path, PathBuf};
use url::Url;

const FALLBACK_FILENAME: &str = "download";

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    Ok(FALLBACK_FILENAME.to_string())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// `dir/name.ext`, or `dir/name_1.ext`, `dir/name_2.ext`... if taken.
pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    get_unique_filepath_by(dir, filename, |path| path.exists())
}

/// Same naming sequence as [`get_unique_filepath`], with the caller deciding
/// which candidates are taken.
pub fn get_unique_filepath_by(
    dir: &Path,
    filename: &str,
    mut is_taken: impl FnMut(&Path) -> bool,
) -> PathBuf {
    let base = dir.join(filename);
    if !is_taken(&base) {
        return base;
    }

    let file_stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
    let extension = base
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };
        let path = dir.join(new_filename);
        if !is_taken(&path) {
            return path;
        }
        counter += 1;
    }
}
