//! Chunk planning: byte ranges for plain files, ordered segments for HLS

use crate::downloader::crypto::SegmentKey;
use crate::utils::error::DownloadError;
use serde::{Deserialize, Serialize};
use url::Url;

/// One planned byte range: `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub index: usize,
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// HTTP Range header value (inclusive end): `bytes=start-(end-1)`.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end().saturating_sub(1))
    }
}

/// Split `[0, total_length)` into contiguous ranges of at most `range_size`
/// bytes; the last range holds the remainder.
///
/// Returns an empty plan when either argument is 0.
pub fn plan_ranges(total_length: u64, range_size: u64) -> Vec<ByteRange> {
    if total_length == 0 || range_size == 0 {
        return Vec::new();
    }

    let count = total_length.div_ceil(range_size) as usize;
    let mut ranges = Vec::with_capacity(count);
    let mut start = 0u64;

    while start < total_length {
        let len = range_size.min(total_length - start);
        ranges.push(ByteRange {
            index: ranges.len(),
            start,
            len,
        });
        start += len;
    }

    ranges
}

/// A media segment as listed by an HLS manifest.
///
/// `uri` may be relative to the manifest URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSegment {
    pub uri: String,
    #[serde(default)]
    pub key: Option<SegmentKey>,
}

impl MediaSegment {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: SegmentKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// A segment resolved to an absolute URL, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentJob {
    pub index: usize,
    pub url: Url,
    pub key: Option<SegmentKey>,
}

/// Resolve segment URIs against the manifest URL, keeping manifest order.
///
/// A segment's own key wins over `default_key`.
pub fn plan_segments(
    manifest_url: &str,
    segments: &[MediaSegment],
    default_key: Option<&SegmentKey>,
) -> Result<Vec<SegmentJob>, DownloadError> {
    let base = Url::parse(manifest_url)
        .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", manifest_url, e)))?;

    segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            let url = base
                .join(&segment.uri)
                .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", segment.uri, e)))?;
            Ok(SegmentJob {
                index,
                url,
                key: segment.key.clone().or_else(|| default_key.cloned()),
            })
        })
        .collect()
}
