//! Range support detection

use crate::utils::error::DownloadError;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the origin told us about a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub supports_ranges: bool,
    /// Total length in bytes, when the server exposes it.
    pub total_length: Option<u64>,
}

impl ProbeResult {
    /// Ranged mode needs both range support and a known, non-zero length.
    pub fn can_split(&self) -> bool {
        self.supports_ranges && matches!(self.total_length, Some(len) if len > 0)
    }
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
    /// `None` for `*`.
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Total length announced by a 206 to `bytes=0-`.
///
/// `content_range` is `None` when the header is absent and `Some(None)` when
/// it is present but unparsable. Only a 206 without `Content-Range` may be
/// sized by its `Content-Length`; otherwise that is just the length of the
/// partial body. A `*` total stays unknown.
fn partial_total(
    content_range: Option<Option<ContentRange>>,
    content_length: Option<u64>,
) -> Option<u64> {
    match content_range {
        None => content_length,
        Some(parsed) => parsed.and_then(|cr| cr.total),
    }
}

/// Send `GET` with `Range: bytes=0-` and classify the answer.
///
/// Only the headers are read; the body is dropped unread, which closes the
/// connection instead of downloading the file.
pub async fn probe(
    client: &Client,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeResult, DownloadError> {
    let request = client.get(url).header(RANGE, "bytes=0-").send();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        outcome = tokio::time::timeout(timeout, request) => match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(DownloadError::ProbeFailed(e.to_string())),
            Err(_) => return Err(DownloadError::ProbeFailed(format!("no response within {:?}", timeout))),
        },
    };

    let status = response.status();
    let result = match status {
        StatusCode::PARTIAL_CONTENT => {
            let content_range = response
                .headers()
                .get(CONTENT_RANGE)
                .map(|v| v.to_str().ok().and_then(parse_content_range));
            ProbeResult {
                supports_ranges: true,
                total_length: partial_total(content_range, response.content_length()),
            }
        }
        StatusCode::OK => ProbeResult {
            supports_ranges: false,
            total_length: response.content_length(),
        },
        other => {
            return Err(DownloadError::ProbeFailed(format!("HTTP {}", other)));
        }
    };
    drop(response);

    info!(
        url = url,
        supports_ranges = result.supports_ranges,
        total = ?result.total_length,
        "Probed origin"
    );
    debug!("Probe status {}", status);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-99/1000"),
            Some(ContentRange { start: 0, end: 99, total: Some(1000) })
        );
        assert_eq!(
            parse_content_range("bytes 5242880-10485759/*"),
            Some(ContentRange { start: 5_242_880, end: 10_485_759, total: None })
        );
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        assert_eq!(parse_content_range(""), None);
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 10-5/100"), None);
        assert_eq!(parse_content_range("bytes 0-1/abc"), None);
    }

    #[test]
    fn test_partial_total_ignores_body_length_of_a_partial_answer() {
        let unknown = parse_content_range("bytes 0-99/*");
        assert_eq!(partial_total(Some(unknown), Some(100)), None);

        let known = parse_content_range("bytes 0-99/1000");
        assert_eq!(partial_total(Some(known), Some(100)), Some(1000));

        assert_eq!(partial_total(Some(None), Some(100)), None, "garbled header");
        assert_eq!(partial_total(None, Some(1000)), Some(1000), "no Content-Range");
        assert_eq!(partial_total(None, None), None);
    }

    #[test]
    fn test_can_split() {
        let ranged = ProbeResult { supports_ranges: true, total_length: Some(10) };
        assert!(ranged.can_split());

        let unknown = ProbeResult { supports_ranges: true, total_length: None };
        assert!(!unknown.can_split());

        let empty = ProbeResult { supports_ranges: true, total_length: Some(0) };
        assert!(!empty.can_split());

        let plain = ProbeResult { supports_ranges: false, total_length: Some(10) };
        assert!(!plain.can_split());
    }
}
