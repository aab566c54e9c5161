//! Filesystem access seam for download discovery.
//!
//! Discovery and delivery only ever look at the books directory through
//! [`FileProbe`], so tests can script file appearance and growth without
//! touching the disk or sleeping in real time.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

/// Snapshot of one regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub name: String,
    pub len: u64,
    pub modified: SystemTime,
}

/// Read-mostly view of the download directory.
#[async_trait]
pub trait FileProbe: Send + Sync {
    /// Whether a regular file exists at `path`.
    async fn exists(&self, path: &Path) -> bool;

    /// Lists regular files directly inside `dir` (directories are skipped).
    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileStat>>;

    /// Stats a single file.
    async fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Reads the whole file into memory.
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Deletes the file.
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`FileProbe`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

#[async_trait]
impl FileProbe for FsProbe {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileStat>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // Entries can vanish between readdir and stat; skip them.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(FileStat {
                path: entry.path(),
                name: entry.file_name().to_string_lossy().into_owned(),
                len: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        Ok(files)
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(FileStat {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            len: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}
