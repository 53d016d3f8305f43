//! Resume markers kept in the shadow file.
//!
//! The shadow file holds a small JSON document describing the planned layout
//! and which chunks are fully on disk. An index is only recorded after its
//! bytes have been written, so a chunk is either complete or refetched.

use crate::downloader::layout;
use crate::utils::error::DownloadError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Shape of the plan the markers refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanLayout {
    /// Byte ranges over a file of known length.
    Ranges { total: u64, range_size: u64 },
    /// Ordered HLS segments.
    Segments { count: usize },
    /// Single sequential stream; never resumable.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub url: String,
    pub layout: PlanLayout,
    #[serde(default)]
    pub completed: BTreeSet<usize>,
}

impl ResumeState {
    pub fn new(url: &str, layout: PlanLayout) -> Self {
        Self {
            url: url.to_string(),
            layout,
            completed: BTreeSet::new(),
        }
    }

    /// Read markers from a shadow file. Missing, empty or unreadable files
    /// yield `None` and the download starts over.
    pub async fn load(shadow: &Path) -> Option<Self> {
        let bytes = match tokio::fs::read(shadow).await {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                debug!("Ignoring unreadable resume markers in {}: {}", shadow.display(), e);
                None
            }
        }
    }

    /// Replace the shadow file atomically: a crash leaves either the old
    /// markers or the new ones, never a half-written document.
    pub async fn save(&self, shadow: &Path) -> Result<(), DownloadError> {
        let json = serde_json::to_vec(self)?;
        let staging = layout::staging(shadow);

        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, shadow).await?;
        Ok(())
    }

    /// Markers from a previous run are only valid for the same URL and plan.
    pub fn matches(&self, url: &str, layout: &PlanLayout) -> bool {
        self.url == url && &self.layout == layout && *layout != PlanLayout::Stream
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    pub fn mark_done(&mut self, index: usize) {
        self.completed.insert(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let shadow = dir.path().join("clip.mp4.download");

        let mut state = ResumeState::new(
            "http://host/clip.mp4",
            PlanLayout::Ranges { total: 5000, range_size: 1000 },
        );
        state.mark_done(0);
        state.mark_done(3);
        state.save(&shadow).await.unwrap();

        let loaded = ResumeState::load(&shadow).await.expect("markers readable");
        assert_eq!(loaded, state);
        assert!(loaded.is_done(3));
        assert!(!loaded.is_done(1));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_markers_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let shadow = dir.path().join("clip.mp4.download");
        std::fs::write(&shadow, b"{\"url\": \"half-writ").unwrap();

        let mut state = ResumeState::new("http://host/clip.mp4", PlanLayout::Segments { count: 4 });
        state.mark_done(2);
        state.save(&shadow).await.unwrap();

        assert_eq!(ResumeState::load(&shadow).await, Some(state.clone()));
        assert!(!layout::staging(&shadow).exists(), "staging file renamed away");

        // a stale staging file from a crashed write is simply overwritten
        std::fs::write(layout::staging(&shadow), b"garbage").unwrap();
        state.mark_done(3);
        state.save(&shadow).await.unwrap();
        assert!(ResumeState::load(&shadow).await.unwrap().is_done(3));
        assert!(!layout::staging(&shadow).exists());
    }

    #[tokio::test]
    async fn test_load_tolerates_missing_empty_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let shadow = dir.path().join("clip.mp4.download");
        assert!(ResumeState::load(&shadow).await.is_none());

        std::fs::write(&shadow, b"").unwrap();
        assert!(ResumeState::load(&shadow).await.is_none());

        std::fs::write(&shadow, b"{\"url\": \"trunc").unwrap();
        assert!(ResumeState::load(&shadow).await.is_none());
    }

    #[test]
    fn test_matches_requires_same_plan() {
        let layout = PlanLayout::Ranges { total: 5000, range_size: 1000 };
        let state = ResumeState::new("http://host/a", layout);

        assert!(state.matches("http://host/a", &layout));
        assert!(!state.matches("http://host/b", &layout));
        assert!(!state.matches(
            "http://host/a",
            &PlanLayout::Ranges { total: 5000, range_size: 2000 }
        ));

        let stream = ResumeState::new("http://host/a", PlanLayout::Stream);
        assert!(!stream.matches("http://host/a", &PlanLayout::Stream));
    }
}
