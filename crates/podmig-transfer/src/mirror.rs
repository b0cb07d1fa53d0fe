use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::remote::{EntryKind, LocalFs, RemoteFs};
use crate::{Result, TransferError};

/// What to do when a single entry fails to transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Abort the outstanding work and return the first error.
    #[default]
    FailFast,
    /// Log, record the failure in the report and keep going.
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorOptions {
    /// Upper bound on concurrently running listings, copies and link
    /// creations across the whole tree.
    pub max_concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    pub files: u64,
    pub symlinks: u64,
    pub directories: u64,
    pub bytes: u64,
    pub failures: Vec<TransferFailure>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: TransferReport) {
        self.files += other.files;
        self.symlinks += other.symlinks;
        self.directories += other.directories;
        self.bytes += other.bytes;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Download,
    Upload,
}

struct MirrorInner {
    remote: Arc<dyn RemoteFs>,
    local: LocalFs,
    permits: Arc<Semaphore>,
    policy: FailurePolicy,
}

/// Replicates directory trees between this node and a [`RemoteFs`].
///
/// Every entry of a directory is handled by its own task and a directory
/// completes only once its whole subtree has. Symlinks are recreated with
/// the same target and never followed.
#[derive(Clone)]
pub struct DirectoryMirror {
    inner: Arc<MirrorInner>,
}

impl DirectoryMirror {
    pub fn new(remote: Arc<dyn RemoteFs>, options: MirrorOptions) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                remote,
                local: LocalFs,
                permits: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
                policy: options.failure_policy,
            }),
        }
    }

    /// Mirrors `remote` (directory, file or symlink) to `local`.
    pub async fn download(&self, remote: &Path, local: &Path) -> Result<TransferReport> {
        self.run(Direction::Download, remote, local).await
    }

    /// Mirrors `local` (directory, file or symlink) to `remote`.
    pub async fn upload(&self, local: &Path, remote: &Path) -> Result<TransferReport> {
        self.run(Direction::Upload, local, remote).await
    }

    async fn run(&self, direction: Direction, src: &Path, dst: &Path) -> Result<TransferReport> {
        let start = Instant::now();
        let kind = self.inner.source(direction).kind(src).await?;

        let result = self
            .inner
            .clone()
            .mirror_entry(direction, src.to_path_buf(), dst.to_path_buf(), kind)
            .await;
        let report = match result {
            Ok(report) => report,
            Err(e) if self.inner.policy == FailurePolicy::BestEffort => {
                let mut report = TransferReport::default();
                self.inner.record_failure(&mut report, src.to_path_buf(), e)?;
                report
            }
            Err(e) => return Err(e),
        };

        info!(
            ?direction,
            src = %src.display(),
            dst = %dst.display(),
            files = report.files,
            symlinks = report.symlinks,
            directories = report.directories,
            bytes = report.bytes,
            failures = report.failures.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Mirror completed"
        );
        Ok(report)
    }
}

impl MirrorInner {
    fn source(&self, direction: Direction) -> &dyn RemoteFs {
        match direction {
            Direction::Download => self.remote.as_ref(),
            Direction::Upload => &self.local,
        }
    }

    fn destination(&self, direction: Direction) -> &dyn RemoteFs {
        match direction {
            Direction::Download => &self.local,
            Direction::Upload => self.remote.as_ref(),
        }
    }

    async fn copy_file(&self, direction: Direction, src: &Path, dst: &Path) -> Result<u64> {
        match direction {
            Direction::Download => self.remote.download_file(src, dst).await,
            Direction::Upload => self.remote.upload_file(src, dst).await,
        }
    }

    fn record_failure(
        &self,
        report: &mut TransferReport,
        path: PathBuf,
        err: TransferError,
    ) -> Result<()> {
        match self.policy {
            FailurePolicy::FailFast => Err(err),
            FailurePolicy::BestEffort => {
                warn!(path = %path.display(), error = %err, "Entry transfer failed, continuing");
                report.failures.push(TransferFailure {
                    path,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }

    fn mirror_entry(
        self: Arc<Self>,
        direction: Direction,
        src: PathBuf,
        dst: PathBuf,
        kind: EntryKind,
    ) -> BoxFuture<'static, Result<TransferReport>> {
        async move {
            match kind {
                EntryKind::Directory => self.mirror_dir(direction, src, dst).await,
                EntryKind::Symlink => {
                    let _permit = self
                        .permits
                        .acquire()
                        .await
                        .map_err(|_| TransferError::Cancelled)?;
                    let target = self.source(direction).read_link(&src).await?;
                    self.destination(direction).symlink(&target, &dst).await?;
                    debug!(link = %dst.display(), target = %target.display(), "Recreated symlink");
                    Ok(TransferReport {
                        symlinks: 1,
                        ..Default::default()
                    })
                }
                EntryKind::File => {
                    let _permit = self
                        .permits
                        .acquire()
                        .await
                        .map_err(|_| TransferError::Cancelled)?;
                    let bytes = self.copy_file(direction, &src, &dst).await?;
                    Ok(TransferReport {
                        files: 1,
                        bytes,
                        ..Default::default()
                    })
                }
            }
        }
        .boxed()
    }

    async fn mirror_dir(
        self: Arc<Self>,
        direction: Direction,
        src: PathBuf,
        dst: PathBuf,
    ) -> Result<TransferReport> {
        // the permit covers only this level's own I/O; holding it while
        // waiting on children could starve them
        let entries = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| TransferError::Cancelled)?;
            self.destination(direction).create_dir_all(&dst).await?;
            self.source(direction).read_dir(&src).await?
        };

        let mut report = TransferReport {
            directories: 1,
            ..Default::default()
        };
        let mut tasks = JoinSet::new();
        for entry in entries {
            let child_src = src.join(&entry.name);
            let child_dst = dst.join(&entry.name);
            let inner = self.clone();
            tasks.spawn(async move {
                let result = inner
                    .mirror_entry(direction, child_src.clone(), child_dst, entry.kind)
                    .await;
                (child_src, result)
            });
        }

        // dropping the JoinSet on an early return aborts the siblings
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(child))) => report.merge(child),
                Ok((path, Err(e))) => self.record_failure(&mut report, path, e)?,
                Err(e) => self.record_failure(&mut report, src.clone(), TransferError::Join(e))?,
            }
        }
        Ok(report)
    }
}
