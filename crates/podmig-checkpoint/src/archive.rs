//! Packs checkpoint artifacts and container layers into tar archives

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use podmig_common::MigrationError;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Source path has no file name: {0}")]
    InvalidSource(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create archive {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ArchiveError> for MigrationError {
    fn from(err: ArchiveError) -> Self {
        MigrationError::Transfer(err.to_string())
    }
}

/// Archives `source` (file or directory) into `<dest_dir>/<basename>.tar`.
///
/// Directory members are rooted under the directory's own base name.
/// Symlinks are stored as links, never followed.
pub async fn archive_path(source: &Path, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let source = source.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || archive_blocking(&source, &dest_dir)).await?
}

/// Unpacks an archive produced by [`archive_path`] into `dest_dir`.
pub async fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let archive = archive.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&archive).map_err(|source| ArchiveError::Read {
            path: archive.clone(),
            source,
        })?;
        let mut tarball = tar::Archive::new(file);
        tarball.set_preserve_permissions(true);
        tarball
            .unpack(&dest_dir)
            .map_err(|source| ArchiveError::Read {
                path: archive.clone(),
                source,
            })?;
        info!(archive = %archive.display(), dest = %dest_dir.display(), "Extracted archive");
        Ok(())
    })
    .await?
}

fn archive_blocking(source: &Path, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let base = source
        .file_name()
        .ok_or_else(|| ArchiveError::InvalidSource(source.to_path_buf()))?
        .to_os_string();
    let metadata = std::fs::symlink_metadata(source).map_err(|e| ArchiveError::Read {
        path: source.to_path_buf(),
        source: e,
    })?;

    let mut target_name = base.clone();
    target_name.push(".tar");
    let target = dest_dir.join(target_name);

    let result = write_archive(source, &target, Path::new(&base), metadata.is_dir());
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&target) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(archive = %target.display(), error = %e, "Failed to remove partial archive");
            }
        }
    }
    result?;

    info!(source = %source.display(), archive = %target.display(), "Archived");
    Ok(target)
}

fn write_archive(
    source: &Path,
    target: &Path,
    base: &Path,
    is_dir: bool,
) -> Result<(), ArchiveError> {
    let file = File::create(target).map_err(|e| ArchiveError::Create {
        path: target.to_path_buf(),
        source: e,
    })?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    if is_dir {
        for entry in WalkDir::new(source).follow_links(false) {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| ArchiveError::InvalidSource(entry.path().to_path_buf()))?;
            let name = base.join(relative);
            builder
                .append_path_with_name(entry.path(), &name)
                .map_err(|e| ArchiveError::Read {
                    path: entry.path().to_path_buf(),
                    source: e,
                })?;
        }
    } else {
        builder
            .append_path_with_name(source, base)
            .map_err(|e| ArchiveError::Read {
                path: source.to_path_buf(),
                source: e,
            })?;
    }

    let file = builder.into_inner().map_err(|e| ArchiveError::Create {
        path: target.to_path_buf(),
        source: e,
    })?;
    file.sync_all().map_err(|e| ArchiveError::Create {
        path: target.to_path_buf(),
        source: e,
    })
}
