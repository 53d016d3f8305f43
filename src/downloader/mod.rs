//! Download engine module

pub mod crypto;
pub mod engine;
pub mod executor;
pub mod fetcher;
pub mod layout;
pub mod merger;
pub mod probe;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod segment;
pub mod task;

// Re-export for convenience
pub use crypto::SegmentKey;
pub use engine::{DownloadConfig, DownloadEngine};
pub use progress::{Progress, ProgressSnapshot, ProgressUnit, State};
pub use retry::RetryPolicy;
pub use segment::MediaSegment;
pub use task::{DownloadParam, DownloadTask};
