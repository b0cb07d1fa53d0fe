//! Drives a full migration over real HTTP: the node serves `/migrate` and
//! `/trigger` on a loopback socket and triggers a migration against itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podmig_checkpoint::{CheckpointTool, ConvergencePolicy, PreDumpDriver};
use podmig_common::{
    ContainerInfo, InMemoryPodRegistry, MigrationResult, Pod, PodPhase, PodRegistry,
    CLONE_SOURCE_LABEL,
};
use podmig_coordinator::{
    create_router, AppState, MigrationClient, MigrationManager, NodeConfig, PreDumpSyncPath,
    TriggerError,
};

const MB: usize = 1024 * 1024;

/// Pre-dumps shrink from 8 MB to 1 MB so the chain converges on iteration 2.
#[derive(Default)]
struct ShrinkingTool {
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl CheckpointTool for ShrinkingTool {
    async fn pre_dump(
        &self,
        image_dir: &Path,
        parent: Option<&Path>,
        container_id: &str,
    ) -> podmig_checkpoint::Result<()> {
        let size = if parent.is_none() { 8 * MB } else { MB };
        tokio::fs::write(image_dir.join("pages-1.img"), vec![0u8; size]).await?;
        self.log
            .lock()
            .unwrap()
            .push(format!("pre-dump {} {}", container_id, image_dir.display()));
        Ok(())
    }

    async fn dump(
        &self,
        image_dir: &Path,
        _parent: Option<&Path>,
        container_id: &str,
    ) -> podmig_checkpoint::Result<()> {
        tokio::fs::write(image_dir.join("inventory.img"), b"final").await?;
        self.log.lock().unwrap().push(format!("dump {}", container_id));
        Ok(())
    }

    async fn terminate(&self, container_id: &str) -> podmig_checkpoint::Result<()> {
        self.log.lock().unwrap().push(format!("kill {}", container_id));
        Ok(())
    }
}

fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        uid: format!("uid-{}", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        phase: PodPhase::Running,
        host_ip: "127.0.0.1".to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        containers: vec![ContainerInfo {
            name: "app".to_string(),
            container_id: format!("{}-app", name),
        }],
    }
}

struct Node {
    port: u16,
    tool: Arc<ShrinkingTool>,
    registry: Arc<InMemoryPodRegistry>,
    config: NodeConfig,
    _root: tempfile::TempDir,
}

async fn start_node() -> anyhow::Result<Node> {
    let root = tempfile::tempdir()?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let config = NodeConfig {
        root_dir: root.path().to_path_buf(),
        remote_scheme: "http".to_string(),
        remote_port: port,
        ready_timeout: Duration::from_secs(10),
        request_timeout: Duration::from_secs(20),
        ..Default::default()
    };

    let registry = Arc::new(InMemoryPodRegistry::new());
    registry.insert(pod("source", &[]));
    registry.insert(pod("target", &[(CLONE_SOURCE_LABEL, "source")]));

    let tool = Arc::new(ShrinkingTool::default());
    let driver = Arc::new(PreDumpDriver::new(tool.clone(), ConvergencePolicy::default()));
    let sync_path = Arc::new(PreDumpSyncPath::new(
        driver,
        config.max_pre_dump_iterations,
        config.release_timeout,
    ));
    let manager = Arc::new(MigrationManager::new(&config, registry.clone(), sync_path));
    let client = Arc::new(MigrationClient::new(&config, registry.clone())?);
    let app = create_router(AppState {
        manager,
        client,
        pods: registry.clone(),
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(Node {
        port,
        tool,
        registry,
        config,
        _root: root,
    })
}

async fn wait_for_kill(tool: &ShrinkingTool, container_id: &str) -> bool {
    let expected = format!("kill {}", container_id);
    for _ in 0..200 {
        if tool.log.lock().unwrap().contains(&expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_client_migrates_clone_source() -> anyhow::Result<()> {
    let node = start_node().await?;
    let client = MigrationClient::new(&node.config, node.registry.clone())?;
    let target = node.registry.pod_by_uid("uid-target").unwrap();

    let result = client.trigger_pod_migration(&target).await?;
    let root = node.config.migration_root().join("uid-source");
    assert_eq!(result.path, root.to_string_lossy());
    let app_dir = result.container_path("app").unwrap();
    assert!(app_dir.join("inventory.img").is_file());
    assert!(app_dir.join("predump-2/pages-1.img").is_file());
    assert!(!app_dir.join("predump-3").exists());

    assert!(wait_for_kill(&node.tool, "source-app").await);
    let log = node.tool.log.lock().unwrap().clone();
    assert_eq!(log.len(), 4);
    assert_eq!(log[2], "dump source-app");

    // the checkpoint is owned by the caller once delivered
    result.delete_checkpoint().await?;
    assert!(!root.exists());
    Ok(())
}

#[tokio::test]
async fn test_trigger_route_round_trip() -> anyhow::Result<()> {
    let node = start_node().await?;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/trigger/default/target", node.port))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let result: MigrationResult = response.json().await?;
    assert_eq!(result.containers.len(), 1);
    assert!(wait_for_kill(&node.tool, "source-app").await);

    let health: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/health", node.port))
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn test_remote_not_found_is_typed() -> anyhow::Result<()> {
    let node = start_node().await?;
    // the cluster directory points at a uid the source node does not serve
    let directory = Arc::new(InMemoryPodRegistry::new());
    directory.insert(Pod {
        uid: "uid-ghost".to_string(),
        ..pod("source", &[])
    });
    let client = MigrationClient::new(&node.config, directory)?;

    let err = client
        .trigger_pod_migration(&pod("target", &[(CLONE_SOURCE_LABEL, "source")]))
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::RemoteNotFound(ref uid) if uid == "uid-ghost"));
    Ok(())
}
