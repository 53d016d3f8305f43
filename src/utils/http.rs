//! Shared HTTP client construction

use crate::utils::error::DownloadError;
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Build the client every task of one `TaskManager` shares.
///
/// Only a connect timeout is set: a whole-request timeout would cut off
/// large ranges on slow links.
pub fn build_client(user_agent: &str, connect_timeout: Duration) -> Result<Client, DownloadError> {
    let client = Client::builder()
        .user_agent(user_agent)
        .connect_timeout(connect_timeout)
        .build()?;
    Ok(client)
}
