//! Per-pod migration records and the two-phase rendezvous between the
//! request handler and the container sync path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Requested,
    Checkpointing,
    Ready,
    Completed,
    Failed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("Checkpoint failed: {0}")]
    Failed(String),
    #[error("Migration aborted by the other side")]
    Aborted,
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Ready has not been signalled")]
    NotReady,
    #[error("Already waited for release")]
    AlreadyWaited,
}

#[derive(Debug, Clone)]
pub(crate) struct MigrationRecord {
    pub id: Uuid,
    pub pod_uid: String,
    pub path: PathBuf,
    pub containers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub state: MigrationState,
}

/// Read-only view of an in-flight migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSnapshot {
    pub migration_id: Uuid,
    pub pod_uid: String,
    pub path: PathBuf,
    pub containers: Vec<String>,
    pub state: MigrationState,
    pub created_at: DateTime<Utc>,
}

impl From<&MigrationRecord> for MigrationSnapshot {
    fn from(record: &MigrationRecord) -> Self {
        Self {
            migration_id: record.id,
            pod_uid: record.pod_uid.clone(),
            path: record.path.clone(),
            containers: record.containers.clone(),
            state: record.state,
            created_at: record.created_at,
        }
    }
}

pub(crate) type RecordStore = Arc<DashMap<String, MigrationRecord>>;

/// Owns a record's lifetime: the record is evicted when the guard drops,
/// whichever path the migration leaves by. The guard is shared between the
/// response and the sync path, so the pod stays reserved until both are done.
#[derive(Debug)]
pub(crate) struct RecordGuard {
    records: RecordStore,
    pod_uid: String,
    id: Uuid,
}

impl RecordGuard {
    pub fn new(records: RecordStore, pod_uid: String, id: Uuid) -> Self {
        Self {
            records,
            pod_uid,
            id,
        }
    }

    pub fn set_state(&self, state: MigrationState) {
        if let Some(mut record) = self.records.get_mut(&self.pod_uid) {
            if record.id == self.id {
                debug!(pod_uid = %self.pod_uid, from = ?record.state, to = ?state, "Migration state change");
                record.state = state;
            }
        }
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .records
            .remove_if(&self.pod_uid, |_, record| record.id == id)
            .is_some()
        {
            debug!(pod_uid = %self.pod_uid, migration_id = %id, "Migration record evicted");
        }
    }
}

/// What the container sync path receives for one migration.
///
/// The sync path checkpoints `containers` into `checkpoint_dir`, then calls
/// [`signal_ready`](Self::signal_ready) (or
/// [`signal_failed`](Self::signal_failed)) exactly once and waits with
/// [`wait_until_finished`](Self::wait_until_finished) before touching the
/// containers again.
///
/// The coordinator cancels [`cancellation`](Self::cancellation) when it stops
/// waiting for ready. A new migration of the same pod is refused until these
/// options are dropped.
#[derive(Debug)]
pub struct MigratePodOptions {
    pub migration_id: Uuid,
    pub checkpoint_dir: PathBuf,
    pub containers: Vec<String>,
    pub keep_running: bool,
    ready: Option<oneshot::Sender<Result<(), String>>>,
    release: Option<oneshot::Receiver<()>>,
    cancel: CancellationToken,
    lease: Option<Arc<RecordGuard>>,
}

/// Handler side of the rendezvous.
#[derive(Debug)]
pub struct Rendezvous {
    ready: oneshot::Receiver<Result<(), String>>,
    release: oneshot::Sender<()>,
}

impl MigratePodOptions {
    pub fn channel(
        migration_id: Uuid,
        checkpoint_dir: PathBuf,
        containers: Vec<String>,
        keep_running: bool,
    ) -> (Self, Rendezvous) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let options = Self {
            migration_id,
            checkpoint_dir,
            containers,
            keep_running,
            ready: Some(ready_tx),
            release: Some(release_rx),
            cancel: CancellationToken::new(),
            lease: None,
        };
        let rendezvous = Rendezvous {
            ready: ready_rx,
            release: release_tx,
        };
        (options, rendezvous)
    }

    /// Keeps the pod's record alive for as long as the sync path holds these
    /// options.
    pub(crate) fn hold(mut self, lease: Arc<RecordGuard>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reports that every requested container's checkpoint is on disk.
    /// Returns false if a signal was already sent or nobody is waiting.
    pub fn signal_ready(&mut self) -> bool {
        self.ready
            .take()
            .map(|tx| tx.send(Ok(())).is_ok())
            .unwrap_or(false)
    }

    pub fn signal_failed(&mut self, cause: impl Into<String>) -> bool {
        self.ready
            .take()
            .map(|tx| tx.send(Err(cause.into())).is_ok())
            .unwrap_or(false)
    }

    /// Waits until the result has been delivered to the requesting node.
    ///
    /// `Aborted` means the response was abandoned; the source containers must
    /// keep running in that case.
    pub async fn wait_until_finished(&mut self, timeout: Duration) -> Result<(), RendezvousError> {
        if self.ready.is_some() {
            return Err(RendezvousError::NotReady);
        }
        let release = self.release.take().ok_or(RendezvousError::AlreadyWaited)?;
        match tokio::time::timeout(timeout, release).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RendezvousError::Aborted),
            Err(_) => Err(RendezvousError::TimedOut(timeout)),
        }
    }
}

impl Rendezvous {
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), RendezvousError> {
        match tokio::time::timeout(timeout, &mut self.ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(cause))) => Err(RendezvousError::Failed(cause)),
            Ok(Err(_)) => Err(RendezvousError::Aborted),
            Err(_) => Err(RendezvousError::TimedOut(timeout)),
        }
    }

    /// Lets the sync path proceed. Returns false if it stopped waiting.
    pub fn release(self) -> bool {
        self.release.send(()).is_ok()
    }

    pub(crate) fn into_release(self) -> oneshot::Sender<()> {
        self.release
    }
}
