use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info};

use crate::predump::CheckpointTool;
use crate::{CheckpointError, Result};

/// runc state root used by containerd's CRI plugin
pub const CONTAINERD_RUNC_ROOT: &str = "/run/containerd/runc/k8s.io/";

#[derive(Debug, Clone)]
pub struct RuncConfig {
    pub binary: PathBuf,
    pub root: PathBuf,
    pub timeout: Duration,
}

impl Default for RuncConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("runc"),
            root: PathBuf::from(CONTAINERD_RUNC_ROOT),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Checkpoints containers through the runc CLI (which drives CRIU).
pub struct RuncCheckpointTool {
    config: RuncConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpKind {
    PreDump,
    Final,
}

impl RuncCheckpointTool {
    pub fn new(config: RuncConfig) -> Self {
        Self { config }
    }

    fn checkpoint_command(
        &self,
        kind: DumpKind,
        image_dir: &Path,
        parent: Option<&Path>,
        container_id: &str,
    ) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.config.binary);
        // a timed-out runc must not keep dumping behind our back
        cmd.kill_on_drop(true);
        cmd.arg("--root").arg(&self.config.root).arg("checkpoint");
        if kind == DumpKind::PreDump {
            cmd.arg("--pre-dump");
        }
        cmd.arg("--image-path").arg(image_dir);
        if let Some(parent) = parent {
            cmd.arg("--parent-path").arg(parent);
        }
        if kind == DumpKind::Final {
            // teardown only happens once the target has the checkpoint
            cmd.arg("--leave-running");
        }
        cmd.arg(container_id);
        cmd
    }

    async fn run(&self, mut cmd: AsyncCommand, container_id: &str) -> Result<()> {
        debug!("runc command: {:?}", cmd);
        let start = Instant::now();

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| CheckpointError::TimedOut(self.config.timeout))?
            .map_err(CheckpointError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(%container_id, status = ?output.status, "runc failed: {}", stderr);
            return Err(CheckpointError::ToolFailed {
                container_id: container_id.to_string(),
                iteration: 0,
                stderr,
            });
        }

        debug!(%container_id, elapsed_ms = start.elapsed().as_millis() as u64, "runc finished");
        Ok(())
    }
}

#[async_trait]
impl CheckpointTool for RuncCheckpointTool {
    async fn pre_dump(
        &self,
        image_dir: &Path,
        parent: Option<&Path>,
        container_id: &str,
    ) -> Result<()> {
        let cmd = self.checkpoint_command(DumpKind::PreDump, image_dir, parent, container_id);
        self.run(cmd, container_id).await
    }

    async fn dump(
        &self,
        image_dir: &Path,
        parent: Option<&Path>,
        container_id: &str,
    ) -> Result<()> {
        let cmd = self.checkpoint_command(DumpKind::Final, image_dir, parent, container_id);
        self.run(cmd, container_id).await
    }

    async fn terminate(&self, container_id: &str) -> Result<()> {
        let mut cmd = AsyncCommand::new(&self.config.binary);
        cmd.kill_on_drop(true);
        cmd.arg("--root")
            .arg(&self.config.root)
            .arg("kill")
            .arg(container_id)
            .arg("KILL");
        self.run(cmd, container_id).await?;
        info!(%container_id, "Terminated migrated container");
        Ok(())
    }
}
