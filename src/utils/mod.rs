//! Utility modules for error handling, configuration and formatting

pub mod config;
pub mod error;
pub mod format;
pub mod http;
pub mod logging;

// Re-export for convenience
pub use config::Settings;
pub use error::DownloadError;
pub use format::{format_size, percent_str, ratio_percent};
pub use logging::init_logging;
