use reqwest::{header, Client, StatusCode};

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
}

/// Asks for the first byte only. A `206` carrying `Content-Range: bytes 0-0/N`
/// proves range support and gives the size; a `200` means the server ignores
/// ranges, in which case `Content-Length` is the size if present.
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult, DownloadError> {
    let response = client
        .get(url)
        .header(header::RANGE, "bytes=0-0")
        .send()
        .await?;

    let status = response.status();

    if status == StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        return Ok(ProbeResult {
            total_size: total,
            accepts_ranges: total.is_some(),
        });
    }

    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        // Empty resources answer `bytes */0`.
        let total = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        if total == Some(0) {
            return Ok(ProbeResult {
                total_size: Some(0),
                accepts_ranges: false,
            });
        }
    }

    if !status.is_success() {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }

    Ok(ProbeResult {
        total_size: response.content_length(),
        accepts_ranges: false,
    })
}

/// `bytes 0-0/1234` -> `Some(1234)`; `bytes 0-0/*` -> `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}
