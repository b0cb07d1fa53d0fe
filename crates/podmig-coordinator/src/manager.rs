use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use podmig_common::{MigrationResult, Pod, PodRegistry};
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::record::{
    MigratePodOptions, MigrationRecord, MigrationSnapshot, MigrationState, RecordGuard,
    RecordStore, RendezvousError,
};
use crate::{CoordinatorError, Result};

/// The node's container sync path, as seen by the coordinator.
pub trait SyncDispatcher: Send + Sync {
    /// Hands a migration over. Must return promptly; the sync path reports
    /// back through `options`.
    fn dispatch(&self, pod: Pod, options: MigratePodOptions);
}

/// A migration whose checkpoint is on disk and whose result is ready to be
/// sent. Dropping it without releasing aborts the migration.
pub struct ReadyMigration {
    pub migration_id: Uuid,
    pub result: MigrationResult,
    pub(crate) release: oneshot::Sender<()>,
    pub(crate) guard: Arc<RecordGuard>,
}

impl ReadyMigration {
    /// Marks the migration completed and lets the sync path proceed.
    pub fn release(self) -> bool {
        self.guard.set_state(MigrationState::Completed);
        self.release.send(()).is_ok()
    }
}

pub struct MigrationManager {
    records: RecordStore,
    registry: Arc<dyn PodRegistry>,
    dispatcher: Arc<dyn SyncDispatcher>,
    migration_root: PathBuf,
    ready_timeout: Duration,
    keep_running: bool,
}

impl MigrationManager {
    pub fn new(
        config: &NodeConfig,
        registry: Arc<dyn PodRegistry>,
        dispatcher: Arc<dyn SyncDispatcher>,
    ) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            registry,
            dispatcher,
            migration_root: config.migration_root(),
            ready_timeout: config.ready_timeout,
            keep_running: config.keep_running,
        }
    }

    pub fn migration_root(&self) -> &Path {
        &self.migration_root
    }

    pub fn find_migration_for_pod(&self, pod_uid: &str) -> Option<MigrationSnapshot> {
        self.records.get(pod_uid).map(|r| MigrationSnapshot::from(r.value()))
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// Validates the request, hands the pod to the sync path and waits until
    /// its checkpoint is ready. `containers` empty means every container.
    #[instrument(skip(self, containers), fields(migration_id = tracing::field::Empty))]
    pub async fn start_migration(
        &self,
        pod_uid: &str,
        containers: Vec<String>,
    ) -> Result<ReadyMigration> {
        let pod = self
            .registry
            .pod_by_uid(pod_uid)
            .ok_or_else(|| CoordinatorError::PodNotFound(pod_uid.to_string()))?;
        if !pod.is_running() {
            return Err(CoordinatorError::PodNotRunning {
                uid: pod.uid.clone(),
                phase: pod.phase.to_string(),
            });
        }
        let containers = resolve_containers(&pod, containers)?;

        let id = Uuid::new_v4();
        tracing::Span::current().record("migration_id", tracing::field::display(id));
        let path = self.migration_root.join(&pod.uid);
        let guard = Arc::new(self.insert_record(&pod.uid, id, &path, &containers)?);

        prepare_checkpoint_dir(&path).await.map_err(|e| {
            guard.set_state(MigrationState::Failed);
            CoordinatorError::Internal(format!(
                "failed to prepare checkpoint directory {}: {}",
                path.display(),
                e
            ))
        })?;

        let (options, mut rendezvous) =
            MigratePodOptions::channel(id, path.clone(), containers.clone(), self.keep_running);
        let options = options.hold(guard.clone());
        // fires on every exit short of ready, including this future being dropped
        let cancel_on_exit = options.cancellation().clone().drop_guard();
        guard.set_state(MigrationState::Checkpointing);
        info!(pod = %pod.name, namespace = %pod.namespace, ?containers, "Dispatching pod migration");
        self.dispatcher.dispatch(pod, options);

        if let Err(e) = rendezvous.wait_ready(self.ready_timeout).await {
            guard.set_state(MigrationState::Failed);
            error!(error = %e, "Migration did not become ready");
            return Err(match e {
                RendezvousError::TimedOut(after) => CoordinatorError::ReadyTimeout(after),
                RendezvousError::Failed(cause) => CoordinatorError::CheckpointFailed(cause),
                other => CoordinatorError::CheckpointFailed(other.to_string()),
            });
        }

        cancel_on_exit.disarm();
        guard.set_state(MigrationState::Ready);
        info!(path = %path.display(), "Checkpoint ready");
        Ok(ReadyMigration {
            migration_id: id,
            result: MigrationResult::for_containers(&path, &containers),
            release: rendezvous.into_release(),
            guard,
        })
    }

    fn insert_record(
        &self,
        pod_uid: &str,
        id: Uuid,
        path: &Path,
        containers: &[String],
    ) -> Result<RecordGuard> {
        match self.records.entry(pod_uid.to_string()) {
            Entry::Occupied(existing) => {
                warn!(existing = %existing.get().id, "Rejecting concurrent migration");
                Err(CoordinatorError::MigrationInProgress(pod_uid.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(MigrationRecord {
                    id,
                    pod_uid: pod_uid.to_string(),
                    path: path.to_path_buf(),
                    containers: containers.to_vec(),
                    created_at: Utc::now(),
                    state: MigrationState::Requested,
                });
                Ok(RecordGuard::new(self.records.clone(), pod_uid.to_string(), id))
            }
        }
    }
}

fn resolve_containers(pod: &Pod, requested: Vec<String>) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(pod.container_names());
    }
    let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested {
        if pod.container(&name).is_none() {
            return Err(CoordinatorError::UnknownContainer {
                pod: pod.uid.clone(),
                container: name,
            });
        }
        if !resolved.contains(&name) {
            resolved.push(name);
        }
    }
    Ok(resolved)
}

/// Starts from an empty directory; leftovers of an earlier attempt would be
/// picked up as parent images.
async fn prepare_checkpoint_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => warn!(path = %path.display(), "Removed stale checkpoint directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(path).await
}
