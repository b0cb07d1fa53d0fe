// Shared types for the pod migration workspace

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// Label on a target pod naming the pod it is cloned from.
pub const CLONE_SOURCE_LABEL: &str = "CloneSourcePod";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Checkpoint Error: {0}")]
    Checkpoint(String),

    #[error("Transfer Error: {0}")]
    Transfer(String),

    #[error("Timed Out: {0}")]
    Timeout(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    /// Runtime identifier handed to the checkpoint tool
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub host_ip: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub containers: Vec<ContainerInfo>,
}

impl Pod {
    pub fn container_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }

    pub fn container(&self, name: &str) -> Option<&ContainerInfo> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// Name of the pod this one should be cloned from, if labelled.
    pub fn clone_source(&self) -> Option<&str> {
        self.labels.get(CLONE_SOURCE_LABEL).map(String::as_str)
    }
}

/// Checkpoint location handed back to the node that asked for a migration.
///
/// Field names are part of the node-to-node wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Containers")]
    pub containers: BTreeMap<String, String>,
}

impl MigrationResult {
    /// Builds the result for `containers` checkpointed under `root`, one
    /// subdirectory per container.
    pub fn for_containers(root: &Path, containers: &[String]) -> Self {
        let containers = containers
            .iter()
            .map(|name| (name.clone(), root.join(name).to_string_lossy().into_owned()))
            .collect();
        Self {
            path: root.to_string_lossy().into_owned(),
            containers,
        }
    }

    pub fn container_path(&self, name: &str) -> Option<PathBuf> {
        self.containers.get(name).map(PathBuf::from)
    }

    /// Removes the checkpoint root once the artifacts have been consumed.
    pub async fn delete_checkpoint(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                info!(path = %self.path, "Deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(path = %self.path, error = %e, "Failed to delete checkpoint");
                Err(e.into())
            }
        }
    }
}

/// Node-local view of the pods this node is running.
pub trait PodRegistry: Send + Sync {
    fn pod_by_uid(&self, uid: &str) -> Option<Pod>;
}

/// Cluster-wide pod lookup used when initiating a migration.
#[async_trait]
pub trait PodDirectory: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
}

/// In-memory pod inventory backing both collaborator traits.
#[derive(Debug, Default)]
pub struct InMemoryPodRegistry {
    pods: DashMap<String, Pod>,
}

impl InMemoryPodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON array of pods.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let pods: Vec<Pod> = serde_json::from_slice(&data).map_err(|e| {
            MigrationError::InvalidRequest(format!(
                "pod inventory {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let registry = Self::new();
        for pod in pods {
            registry.insert(pod);
        }
        info!(count = registry.len(), "Loaded pod inventory");
        Ok(registry)
    }

    pub fn insert(&self, pod: Pod) {
        self.pods.insert(pod.uid.clone(), pod);
    }

    pub fn remove(&self, uid: &str) -> Option<Pod> {
        self.pods.remove(uid).map(|(_, pod)| pod)
    }

    pub fn set_phase(&self, uid: &str, phase: PodPhase) -> bool {
        match self.pods.get_mut(uid) {
            Some(mut pod) => {
                pod.phase = phase;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

impl PodRegistry for InMemoryPodRegistry {
    fn pod_by_uid(&self, uid: &str) -> Option<Pod> {
        self.pods.get(uid).map(|p| p.clone())
    }
}

#[async_trait]
impl PodDirectory for InMemoryPodRegistry {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
            .map(|p| p.clone())
            .ok_or_else(|| MigrationError::NotFound(format!("pod {}/{}", namespace, name)))
    }
}
