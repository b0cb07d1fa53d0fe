use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use podmig_checkpoint::{CheckpointError, PreDumpDriver};
use podmig_common::Pod;
use tracing::{error, info, warn, Instrument};

use crate::manager::SyncDispatcher;
use crate::record::MigratePodOptions;

/// Sync path that checkpoints each container with converging pre-dumps
/// followed by a final dump, then waits for the result to be delivered
/// before stopping the source containers.
///
/// Cancellation is only observed between iterations, and the task returns
/// once every container's chain has stopped.
#[derive(Clone)]
pub struct PreDumpSyncPath {
    driver: Arc<PreDumpDriver>,
    max_iterations: usize,
    release_timeout: Duration,
}

impl PreDumpSyncPath {
    pub fn new(driver: Arc<PreDumpDriver>, max_iterations: usize, release_timeout: Duration) -> Self {
        Self {
            driver,
            max_iterations,
            release_timeout,
        }
    }

    async fn migrate(self, pod: Pod, mut options: MigratePodOptions) {
        let start = Instant::now();
        // container names were validated against the pod by the coordinator
        let targets: Vec<(String, String)> = options
            .containers
            .iter()
            .filter_map(|name| {
                pod.container(name)
                    .map(|c| (name.clone(), c.container_id.clone()))
            })
            .collect();
        if targets.len() != options.containers.len() {
            options.signal_failed(format!("pod {} lost containers during migration", pod.uid));
            return;
        }

        // one failed container stops its siblings at their next iteration
        let stop = options.cancellation().child_token();
        let checkpoints = targets.iter().map(|(name, container_id)| {
            let root = options.checkpoint_dir.join(name);
            let driver = self.driver.clone();
            let max_iterations = self.max_iterations;
            let stop = stop.clone();
            async move {
                let result = driver
                    .checkpoint_container(max_iterations, &root, container_id, &stop)
                    .await;
                if result.is_err() {
                    stop.cancel();
                }
                result.map_err(|e| (name, e))
            }
        });

        let mut iterations = Vec::with_capacity(targets.len());
        let mut cause = None;
        for result in join_all(checkpoints).await {
            match result {
                Ok(outcome) => iterations.push(outcome.iterations),
                Err((_, CheckpointError::Cancelled { .. })) => {}
                Err((name, e)) => {
                    cause.get_or_insert_with(|| format!("container {}: {}", name, e));
                }
            }
        }

        if options.is_cancelled() {
            warn!("Migration cancelled by the coordinator, source containers keep running");
            return;
        }
        if let Some(cause) = cause {
            error!(%cause, "Checkpoint failed, source containers keep running");
            options.signal_failed(cause);
            return;
        }
        info!(
            ?iterations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "All containers checkpointed"
        );
        options.signal_ready();

        match options.wait_until_finished(self.release_timeout).await {
            Ok(()) if options.keep_running => {
                info!("Migration delivered, keeping source containers running");
            }
            Ok(()) => {
                for (name, container_id) in &targets {
                    match self.driver.tool().terminate(container_id).await {
                        Ok(()) => info!(container = %name, "Source container stopped"),
                        Err(e) => warn!(container = %name, error = %e, "Failed to stop source container"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Migration not released, source containers keep running"),
        }
    }
}

impl SyncDispatcher for PreDumpSyncPath {
    fn dispatch(&self, pod: Pod, options: MigratePodOptions) {
        let span = tracing::info_span!(
            "pre_dump_sync",
            pod_uid = %pod.uid,
            migration_id = %options.migration_id
        );
        tokio::spawn(self.clone().migrate(pod, options).instrument(span));
    }
}
