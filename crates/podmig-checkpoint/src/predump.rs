use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::convergence::{percentage_change, ConvergencePolicy};
use crate::dirty_pages::dirty_page_size_mb;
use crate::{CheckpointError, Result};

/// External checkpoint tool driven as a subprocess.
#[async_trait]
pub trait CheckpointTool: Send + Sync {
    /// Capture memory pages without stopping the container. `parent` is
    /// relative to `image_dir`.
    async fn pre_dump(
        &self,
        image_dir: &Path,
        parent: Option<&Path>,
        container_id: &str,
    ) -> Result<()>;

    /// Final checkpoint. The container is always left running; tearing it
    /// down is a separate step.
    async fn dump(&self, image_dir: &Path, parent: Option<&Path>, container_id: &str)
        -> Result<()>;

    async fn terminate(&self, container_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PreDumpOutcome {
    pub iterations: usize,
    /// Dirty megabytes per iteration, in order
    pub dirty_mb: Vec<u64>,
    pub last_image_dir: PathBuf,
}

impl PreDumpOutcome {
    /// Parent reference for a dump written directly into the container root.
    pub fn parent_for_final_dump(&self) -> PathBuf {
        PathBuf::from(iteration_dir_name(self.iterations))
    }
}

pub fn iteration_dir_name(iteration: usize) -> String {
    format!("predump-{}", iteration)
}

fn attach_iteration(err: CheckpointError, at: usize) -> CheckpointError {
    match err {
        CheckpointError::ToolFailed {
            container_id,
            stderr,
            ..
        } => CheckpointError::ToolFailed {
            container_id,
            iteration: at,
            stderr,
        },
        other => other,
    }
}

/// Checked only between iterations; a running tool call is never interrupted.
fn ensure_active(cancel: &CancellationToken, container_id: &str, iteration: usize) -> Result<()> {
    if cancel.is_cancelled() {
        info!(%container_id, iteration, "Checkpoint cancelled");
        return Err(CheckpointError::Cancelled {
            container_id: container_id.to_string(),
            iteration,
        });
    }
    Ok(())
}

pub struct PreDumpDriver {
    tool: Arc<dyn CheckpointTool>,
    policy: ConvergencePolicy,
}

impl PreDumpDriver {
    pub fn new(tool: Arc<dyn CheckpointTool>, policy: ConvergencePolicy) -> Self {
        Self { tool, policy }
    }

    pub fn tool(&self) -> &Arc<dyn CheckpointTool> {
        &self.tool
    }

    /// Runs linked pre-dump iterations under `container_root` until the
    /// convergence policy says stop or `max_iterations` is reached.
    ///
    /// Iterations are strictly sequential: each one references the image
    /// directory of the previous. Any failure aborts the whole sequence, and
    /// so does `cancel`, which is honoured before each iteration starts.
    #[instrument(skip(self, container_root, cancel), fields(root = %container_root.display()))]
    pub async fn run(
        &self,
        max_iterations: usize,
        container_root: &Path,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreDumpOutcome> {
        if max_iterations == 0 {
            return Err(CheckpointError::InvalidIterationLimit);
        }
        let start = Instant::now();

        ensure_active(cancel, container_id, 1)?;
        let first_dir = container_root.join(iteration_dir_name(1));
        tokio::fs::create_dir_all(&first_dir).await?;
        self.tool
            .pre_dump(&first_dir, None, container_id)
            .await
            .map_err(|e| attach_iteration(e, 1))?;
        let mut previous_mb = dirty_page_size_mb(&first_dir).await?;
        debug!(iteration = 1, dirty_mb = previous_mb, "Pre-dump iteration complete");

        let mut dirty_mb = vec![previous_mb];
        let mut history = Vec::new();
        let mut iterations = 1;
        let mut last_image_dir = first_dir;

        for i in 2..=max_iterations {
            ensure_active(cancel, container_id, i)?;
            let image_dir = container_root.join(iteration_dir_name(i));
            let parent = PathBuf::from("..").join(iteration_dir_name(i - 1));
            tokio::fs::create_dir_all(&image_dir).await?;
            self.tool
                .pre_dump(&image_dir, Some(&parent), container_id)
                .await
                .map_err(|e| attach_iteration(e, i))?;

            let current_mb = dirty_page_size_mb(&image_dir).await?;
            let change = percentage_change(previous_mb, current_mb);
            history.push(change);
            dirty_mb.push(current_mb);
            iterations = i;
            last_image_dir = image_dir;
            debug!(
                iteration = i,
                dirty_mb = current_mb,
                change_pct = change,
                "Pre-dump iteration complete"
            );

            if self.policy.should_stop(&history, current_mb) {
                break;
            }
            previous_mb = current_mb;
        }

        info!(
            %container_id,
            iterations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pre-dump converged"
        );
        Ok(PreDumpOutcome {
            iterations,
            dirty_mb,
            last_image_dir,
        })
    }

    /// Pre-dumps into `<container_root>/predump-*` and then writes the final
    /// checkpoint into `container_root` itself, linked to the last iteration.
    pub async fn checkpoint_container(
        &self,
        max_iterations: usize,
        container_root: &Path,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PreDumpOutcome> {
        let outcome = self
            .run(max_iterations, container_root, container_id, cancel)
            .await?;
        ensure_active(cancel, container_id, outcome.iterations + 1)?;
        let parent = outcome.parent_for_final_dump();
        self.tool
            .dump(container_root, Some(&parent), container_id)
            .await
            .map_err(|e| attach_iteration(e, outcome.iterations + 1))?;
        info!(%container_id, root = %container_root.display(), "Final checkpoint written");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const MB: u64 = 1024 * 1024;

    /// Writes one page image per call, sized from a script.
    struct ScriptedTool {
        sizes_mb: Mutex<VecDeque<u64>>,
        fail_on_call: Option<usize>,
        cancel_on_call: Option<usize>,
        cancel: CancellationToken,
        calls: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
    }

    impl ScriptedTool {
        fn new(sizes_mb: &[u64]) -> Self {
            Self {
                sizes_mb: Mutex::new(sizes_mb.iter().copied().collect()),
                fail_on_call: None,
                cancel_on_call: None,
                cancel: CancellationToken::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CheckpointTool for ScriptedTool {
        async fn pre_dump(
            &self,
            image_dir: &Path,
            parent: Option<&Path>,
            container_id: &str,
        ) -> Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((image_dir.to_path_buf(), parent.map(Path::to_path_buf)));
                calls.len()
            };
            if self.fail_on_call == Some(call) {
                return Err(CheckpointError::ToolFailed {
                    container_id: container_id.to_string(),
                    iteration: 0,
                    stderr: "boom".to_string(),
                });
            }
            if self.cancel_on_call == Some(call) {
                self.cancel.cancel();
            }
            let size = self.sizes_mb.lock().unwrap().pop_front().unwrap_or(0);
            std::fs::File::create(image_dir.join("pages-1.img"))?.set_len(size * MB)?;
            if let Some(parent) = parent {
                std::os::unix::fs::symlink(parent, image_dir.join("parent"))?;
            }
            Ok(())
        }

        async fn dump(
            &self,
            image_dir: &Path,
            parent: Option<&Path>,
            _container_id: &str,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((image_dir.to_path_buf(), parent.map(Path::to_path_buf)));
            Ok(())
        }

        async fn terminate(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_links_each_iteration_to_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedTool::new(&[100, 60, 30, 20]));
        let driver = PreDumpDriver::new(tool.clone(), ConvergencePolicy::default());

        let outcome = driver.run(4, dir.path(), "c1", &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.iterations, 4);
        assert_eq!(outcome.dirty_mb, vec![100, 60, 30, 20]);
        assert_eq!(outcome.last_image_dir, dir.path().join("predump-4"));

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls[0], (dir.path().join("predump-1"), None));
        assert_eq!(
            calls[2],
            (dir.path().join("predump-3"), Some(PathBuf::from("../predump-2")))
        );
    }

    #[tokio::test]
    async fn test_stops_when_working_set_is_negligible() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedTool::new(&[100, 40, 1, 1, 1]));
        let driver = PreDumpDriver::new(tool, ConvergencePolicy::default());

        let outcome = driver.run(10, dir.path(), "c1", &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_stops_after_stable_window() {
        let dir = tempfile::tempdir().unwrap();
        // changes: 50%, 2%, 2%, 2%, 2% -> last four stable at iteration 6
        let tool = Arc::new(ScriptedTool::new(&[200, 100, 98, 100, 98, 100, 98, 100]));
        let driver = PreDumpDriver::new(tool, ConvergencePolicy::default());

        let outcome = driver.run(10, dir.path(), "c1", &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.iterations, 6);
    }

    #[tokio::test]
    async fn test_single_iteration_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedTool::new(&[100]));
        let driver = PreDumpDriver::new(tool, ConvergencePolicy::default());

        let outcome = driver.run(1, dir.path(), "c1", &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.iterations, 1);
        assert!(matches!(
            driver.run(0, dir.path(), "c1", &CancellationToken::new()).await,
            Err(CheckpointError::InvalidIterationLimit)
        ));
    }

    #[tokio::test]
    async fn test_tool_failure_aborts_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut tool = ScriptedTool::new(&[100, 90, 80, 70]);
        tool.fail_on_call = Some(3);
        let tool = Arc::new(tool);
        let driver = PreDumpDriver::new(tool.clone(), ConvergencePolicy::default());

        let err = driver.run(8, dir.path(), "c1", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ToolFailed { iteration: 3, .. }));
        assert_eq!(tool.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let mut tool = ScriptedTool::new(&[100, 90, 80, 70]);
        // cancelled while the second pre-dump runs; that call still completes
        tool.cancel_on_call = Some(2);
        let tool = Arc::new(tool);
        let cancel = tool.cancel.clone();
        let driver = PreDumpDriver::new(tool.clone(), ConvergencePolicy::default());

        let err = driver
            .checkpoint_container(8, dir.path(), "c1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Cancelled { iteration: 3, .. }));
        assert_eq!(tool.calls.lock().unwrap().len(), 2);
        assert!(dir.path().join("predump-2/pages-1.img").is_file());
        assert!(!dir.path().join("predump-3").exists());

        // nothing runs once cancelled, not even the first iteration
        let err = driver.run(8, &dir.path().join("again"), "c1", &cancel).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Cancelled { iteration: 1, .. }));
        assert_eq!(tool.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_final_dump_references_last_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedTool::new(&[100, 1]));
        let driver = PreDumpDriver::new(tool.clone(), ConvergencePolicy::default());

        let outcome = driver
            .checkpoint_container(5, dir.path(), "c1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);

        let calls = tool.calls.lock().unwrap();
        let last = calls.last().unwrap();
        assert_eq!(last.0, dir.path());
        assert_eq!(last.1, Some(PathBuf::from("predump-2")));
    }
}
