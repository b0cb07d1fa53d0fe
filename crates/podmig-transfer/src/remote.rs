use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Symlink,
    File,
}

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// Filesystem operations the mirror needs from one side of a transfer.
///
/// `kind` and `read_dir` never follow symlinks. Creating a symlink or file
/// replaces a non-directory entry already at the destination.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn kind(&self, path: &Path) -> Result<EntryKind>;

    async fn read_dir(&self, path: &Path) -> Result<Vec<RemoteEntry>>;

    async fn read_link(&self, path: &Path) -> Result<PathBuf>;

    /// Creates `link` pointing at `target`.
    async fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Copies the remote file at `remote` into the local file `local`,
    /// returning the byte count.
    async fn download_file(&self, remote: &Path, local: &Path) -> Result<u64>;

    /// Copies the local file `local` to `remote`, returning the byte count.
    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<u64>;
}

/// The local filesystem seen through [`RemoteFs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    async fn copy(src: &Path, dst: &Path) -> Result<u64> {
        let mut reader = fs::File::open(src)
            .await
            .map_err(|e| TransferError::io("open", src, e))?;
        let mut writer = fs::File::create(dst)
            .await
            .map_err(|e| TransferError::io("create", dst, e))?;
        let bytes = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| TransferError::io("copy", src, e))?;
        writer
            .sync_all()
            .await
            .map_err(|e| TransferError::io("sync", dst, e))?;
        Ok(bytes)
    }
}

fn kind_of(file_type: std::fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn kind(&self, path: &Path) -> Result<EntryKind> {
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(|e| TransferError::io("lstat", path, e))?;
        Ok(kind_of(metadata.file_type()))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<RemoteEntry>> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| TransferError::io("read dir", path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| TransferError::io("read dir", path, e))?
        {
            // DirEntry::file_type does not follow symlinks
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| TransferError::io("lstat", &entry.path(), e))?;
            entries.push(RemoteEntry {
                name: entry.file_name(),
                kind: kind_of(file_type),
            });
        }
        Ok(entries)
    }

    async fn read_link(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path)
            .await
            .map_err(|e| TransferError::io("read link", path, e))
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if let Ok(existing) = fs::symlink_metadata(link).await {
            if !existing.is_dir() {
                fs::remove_file(link)
                    .await
                    .map_err(|e| TransferError::io("replace", link, e))?;
            }
        }
        #[cfg(unix)]
        {
            fs::symlink(target, link)
                .await
                .map_err(|e| TransferError::io("symlink", link, e))
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(TransferError::Unsupported(link.to_path_buf()))
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| TransferError::io("create dir", path, e))
    }

    async fn download_file(&self, remote: &Path, local: &Path) -> Result<u64> {
        Self::copy(remote, local).await
    }

    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<u64> {
        Self::copy(local, remote).await
    }
}
