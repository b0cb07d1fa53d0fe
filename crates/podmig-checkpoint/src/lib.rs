use std::path::PathBuf;

use podmig_common::MigrationError;
use thiserror::Error;

// Re-export so callers don't need the common crate for checkpoint results
pub use podmig_common as common;

pub mod archive;
pub mod convergence;
pub mod dirty_pages;
pub mod predump;
pub mod runc;

pub use archive::{archive_path, extract_archive, ArchiveError};
pub use convergence::{percentage_change, ConvergencePolicy};
pub use dirty_pages::dirty_page_size_mb;
pub use predump::{CheckpointTool, PreDumpDriver, PreDumpOutcome};
pub use runc::{RuncCheckpointTool, RuncConfig};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint iteration {path}: {source}")]
    ReadIteration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to stat page image {path}: {source}")]
    StatPage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Checkpoint of container {container_id} failed at iteration {iteration}: {stderr}")]
    ToolFailed {
        container_id: String,
        iteration: usize,
        stderr: String,
    },
    #[error("Failed to launch checkpoint tool: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Checkpoint of container {container_id} cancelled before iteration {iteration}")]
    Cancelled {
        container_id: String,
        iteration: usize,
    },
    #[error("Checkpoint tool timed out after {0:?}")]
    TimedOut(std::time::Duration),
    #[error("Pre-dump iteration limit must be at least 1")]
    InvalidIterationLimit,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CheckpointError> for MigrationError {
    fn from(err: CheckpointError) -> Self {
        MigrationError::Checkpoint(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
