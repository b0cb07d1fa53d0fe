//! Moves checkpoint and layer artifacts between nodes.
//!
//! [`DirectoryMirror`] replicates a directory tree (or a single file) in
//! either direction over any [`RemoteFs`] backend. The production backend is
//! [`SftpSession`]; [`LocalFs`] serves same-host transfers and tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use podmig_common::MigrationError;
use thiserror::Error;
use tracing::info;

pub mod mirror;
pub mod remote;
pub mod sftp;

pub use mirror::{DirectoryMirror, FailurePolicy, MirrorOptions, TransferFailure, TransferReport};
pub use remote::{EntryKind, LocalFs, RemoteEntry, RemoteFs};
pub use sftp::{SftpSession, SshConfig};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("SFTP {op} {path} failed: {source}")]
    Sftp {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: ssh2::Error,
    },
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },
    #[error("Authentication failed for {user}@{host}")]
    Auth { user: String, host: String },
    #[error("Unsupported operation on {0}")]
    Unsupported(PathBuf),
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("Transfer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransferError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        TransferError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn sftp(op: &'static str, path: &Path, source: ssh2::Error) -> Self {
        TransferError::Sftp {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<TransferError> for MigrationError {
    fn from(err: TransferError) -> Self {
        MigrationError::Transfer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Connects to `ssh`, mirrors `remote` down to `local` and disconnects.
pub async fn download_checkpoint(
    ssh: &SshConfig,
    remote: &Path,
    local: &Path,
    options: MirrorOptions,
) -> Result<TransferReport> {
    let session = Arc::new(SftpSession::connect(ssh).await?);
    let mirror = DirectoryMirror::new(session.clone(), options);
    let report = mirror.download(remote, local).await;
    session.disconnect().await;

    let report = report?;
    info!(
        host = %ssh.host,
        remote = %remote.display(),
        files = report.files,
        bytes = report.bytes,
        "Checkpoint download completed"
    );
    Ok(report)
}

/// Mirrors a local dump (file or directory) up to `remote` over an open
/// session.
pub async fn upload_dump(
    session: Arc<dyn RemoteFs>,
    local: &Path,
    remote: &Path,
    options: MirrorOptions,
) -> Result<TransferReport> {
    let start = Instant::now();
    let report = DirectoryMirror::new(session, options)
        .upload(local, remote)
        .await?;
    info!(
        local = %local.display(),
        remote = %remote.display(),
        files = report.files,
        bytes = report.bytes,
        duration_ms = start.elapsed().as_millis() as u64,
        "Upload dump file completed"
    );
    Ok(report)
}
