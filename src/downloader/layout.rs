//! On-disk layout of a download and low-level file operations.
//!
//! For a final file `F` the engine works with:
//! - `F.download`: shadow marker, present while a download is in progress or
//!   was interrupted. It also carries the resume markers.
//! - `F.download.part`: staging copy while the markers are rewritten.
//! - `F.tmp`: working file, pre-sized to the content length when known.
//! - `F-<n>.ts`: decrypted HLS segments awaiting concatenation.
//!
//! `F` itself only appears once the download finalizes.

use crate::utils::error::DownloadError;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SHADOW_SUFFIX: &str = ".download";
pub const TEMP_SUFFIX: &str = ".tmp";
pub const SEGMENT_EXT: &str = ".ts";
pub const STAGING_SUFFIX: &str = ".part";

fn with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `F.download`
pub fn shadow(target: &Path) -> PathBuf {
    with_suffix(target, SHADOW_SUFFIX)
}

/// `F.tmp`
pub fn tmp(target: &Path) -> PathBuf {
    with_suffix(target, TEMP_SUFFIX)
}

/// `F-<index>.ts`
pub fn ts_file(target: &Path, index: usize) -> PathBuf {
    with_suffix(target, &format!("-{}{}", index, SEGMENT_EXT))
}

/// Sibling that `path` is written to before being renamed over it.
pub fn staging(path: &Path) -> PathBuf {
    with_suffix(path, STAGING_SUFFIX)
}

/// True when a shadow marker exists without the final file: a partial
/// download that can be resumed or discarded.
pub fn has_interrupted(target: &Path) -> bool {
    shadow(target).exists() && !target.exists()
}

/// Delete `file` if present, create it fresh and pre-size it to `length` bytes.
pub async fn recreate(file: &Path, length: u64) -> Result<(), DownloadError> {
    remove_if_exists(file).await?;

    let create_err = |source| DownloadError::FileCreate {
        path: file.to_path_buf(),
        source,
    };
    let handle = tokio::fs::File::create(file).await.map_err(create_err)?;
    handle.set_len(length).await.map_err(create_err)?;
    handle.sync_all().await.map_err(create_err)?;

    debug!("Recreated {} ({} bytes)", file.display(), length);
    Ok(())
}

/// Remove everything belonging to `target`, including `target` itself.
///
/// Missing files are not an error, so calling this twice is harmless.
pub async fn clear(target: &Path) -> Result<(), DownloadError> {
    remove_if_exists(target).await?;
    clear_artifacts(target).await
}

/// Remove the shadow, temp and segment files of `target` but keep `target`.
pub async fn clear_artifacts(target: &Path) -> Result<(), DownloadError> {
    remove_if_exists(&shadow(target)).await?;
    remove_if_exists(&staging(&shadow(target))).await?;
    remove_if_exists(&tmp(target)).await?;
    for segment in segment_files(target).await? {
        remove_if_exists(&segment).await?;
    }
    Ok(())
}

/// All `F-<n>.ts` siblings currently on disk.
pub async fn segment_files(target: &Path) -> Result<Vec<PathBuf>, DownloadError> {
    let (dir, name) = match (target.parent(), target.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy().into_owned()),
        _ => return Ok(Vec::new()),
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let prefix = format!("{}-", name);
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let is_segment = file_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(SEGMENT_EXT))
            .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false);
        if is_segment {
            found.push(entry.path());
        }
    }
    Ok(found)
}

async fn remove_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

/// Shared read-write handle to a pre-sized working file. Chunk writers take
/// disjoint regions of it with [`RegionFile::acquire_region`].
#[derive(Clone)]
pub struct RegionFile {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
}

impl RegionFile {
    /// Open an existing, already pre-sized file without truncating it.
    pub fn open(path: &Path) -> Result<Self, DownloadError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DownloadError::FileCreate {
                path: path.to_path_buf(),
                source,
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scoped write view over `[offset, offset + size)`. The region keeps the
    /// file open until it is dropped.
    pub fn acquire_region(&self, offset: u64, size: u64) -> Result<FileRegion, DownloadError> {
        let end = offset.checked_add(size).filter(|&end| end <= self.len);
        if end.is_none() {
            return Err(DownloadError::FileIo(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "region {}+{} outside {} ({} bytes)",
                    offset,
                    size,
                    self.path.display(),
                    self.len
                ),
            )));
        }
        Ok(FileRegion {
            file: Arc::clone(&self.file),
            offset,
            size,
            written: 0,
        })
    }

    /// Flush file data to disk.
    pub fn sync(&self) -> Result<(), DownloadError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Number of live handles (this one plus outstanding regions).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.file)
    }
}

/// Write cursor confined to one byte range of a [`RegionFile`].
pub struct FileRegion {
    file: Arc<File>,
    offset: u64,
    size: u64,
    written: u64,
}

impl FileRegion {
    /// Append `data` at the cursor. Bytes beyond the end of the region are
    /// dropped; the number actually stored is returned.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, DownloadError> {
        let room = (self.size - self.written).min(data.len() as u64) as usize;
        if room == 0 {
            return Ok(0);
        }
        write_all_at(&self.file, &data[..room], self.offset + self.written)?;
        self.written += room as u64;
        Ok(room)
    }

    /// Move the cursor back to the start of the region (used between retries).
    pub fn rewind(&mut self) {
        self.written = 0;
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.written
    }

    pub fn is_full(&self) -> bool {
        self.written == self.size
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}
