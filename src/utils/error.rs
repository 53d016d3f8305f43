//! Error handling for the download engine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for rangeloader
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Range probe failed: {0}")]
    ProbeFailed(String),

    #[error("Chunk {index} fetch failed: {reason}")]
    ChunkFetch { index: usize, reason: String },

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Segment {index} decryption failed: {reason}")]
    Decryption { index: usize, reason: String },

    #[error("Failed to create {}: {source}", path.display())]
    FileCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("Failed to finalize {}: {source}", path.display())]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DownloadError {
    /// Chunk-level transient failures that the engine retries locally.
    /// File-system errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::ChunkFetch { .. }
                | DownloadError::Http(_)
                | DownloadError::Decryption { .. }
        )
    }

    /// Attach a chunk index to a transport error so logs and `Failed` states
    /// name the chunk that gave up.
    pub(crate) fn for_chunk(self, index: usize) -> Self {
        match self {
            DownloadError::Http(e) => DownloadError::ChunkFetch {
                index,
                reason: e.to_string(),
            },
            other => other,
        }
    }
}
