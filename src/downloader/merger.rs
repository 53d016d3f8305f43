//! Ordered concatenation of HLS segment files

use crate::downloader::layout;
use crate::utils::error::DownloadError;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Concatenate `F-0.ts .. F-<count-1>.ts` into `F`, in index order.
///
/// Output is assembled in `F.tmp` and renamed into place, so `F` never holds
/// a partial merge. Any failure is a `Finalize` error and leaves the segment
/// files untouched.
pub async fn merge_segments(target: &Path, count: usize) -> Result<u64, DownloadError> {
    let finalize_err = |source| DownloadError::Finalize {
        path: target.to_path_buf(),
        source,
    };
    let staging = layout::tmp(target);

    debug!("Merging {} segments into {}", count, target.display());

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&staging)
        .await
        .map_err(finalize_err)?;

    let mut total_bytes = 0u64;
    for index in 0..count {
        let mut segment = File::open(layout::ts_file(target, index))
            .await
            .map_err(finalize_err)?;
        let copied = tokio::io::copy(&mut segment, &mut output)
            .await
            .map_err(finalize_err)?;
        total_bytes += copied;
    }

    output.flush().await.map_err(finalize_err)?;
    output.sync_all().await.map_err(finalize_err)?;
    drop(output);

    tokio::fs::rename(&staging, target)
        .await
        .map_err(finalize_err)?;

    info!(
        "Merged {} segments ({} bytes) into {}",
        count,
        total_bytes,
        target.display()
    );
    Ok(total_bytes)
}
