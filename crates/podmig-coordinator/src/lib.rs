//! Node-side migration coordinator.
//!
//! The source node serves `GET /migrate/{podUID}`: it hands the pod to the
//! container sync path, holds the HTTP request open until the checkpoint is
//! on disk, answers with the checkpoint location and only then lets the sync
//! path tear the source containers down. The target node drives the same
//! exchange from the other end through [`MigrationClient`].

use std::time::Duration;

use podmig_common::MigrationError;
use thiserror::Error;

pub mod client;
pub mod config;
pub mod handler;
pub mod manager;
pub mod record;
pub mod sync_path;

pub use client::{MigrationClient, TriggerError};
pub use config::{ClientTlsConfig, ConfigError, NodeConfig};
pub use handler::{create_router, AppState};
pub use manager::{MigrationManager, ReadyMigration, SyncDispatcher};
pub use record::{MigratePodOptions, MigrationSnapshot, MigrationState, Rendezvous, RendezvousError};
pub use sync_path::PreDumpSyncPath;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Pod {0} not found")]
    PodNotFound(String),
    #[error("Pod {uid} is {phase}, not Running")]
    PodNotRunning { uid: String, phase: String },
    #[error("Pod {pod} has no container named {container}")]
    UnknownContainer { pod: String, container: String },
    #[error("Pod {0} is already being migrated")]
    MigrationInProgress(String),
    #[error("Checkpoint not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("Checkpoint failed: {0}")]
    CheckpointFailed(String),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoordinatorError> for MigrationError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::PodNotFound(uid) => MigrationError::NotFound(format!("pod {}", uid)),
            e @ (CoordinatorError::PodNotRunning { .. } | CoordinatorError::MigrationInProgress(_)) => {
                MigrationError::Conflict(e.to_string())
            }
            e @ CoordinatorError::UnknownContainer { .. } => MigrationError::InvalidRequest(e.to_string()),
            e @ CoordinatorError::ReadyTimeout(_) => MigrationError::Timeout(e.to_string()),
            CoordinatorError::CheckpointFailed(cause) => MigrationError::Checkpoint(cause),
            CoordinatorError::Trigger(e) => e.into(),
            CoordinatorError::Internal(msg) => MigrationError::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
