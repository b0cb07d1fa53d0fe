//! Dirty-page accounting for a single pre-dump iteration

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::{CheckpointError, Result};

/// Entry linking an iteration to its predecessor; never page data.
pub const PARENT_MARKER: &str = "parent";

const BYTES_PER_MB: u64 = 1024 * 1024;

static PAGE_IMAGE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn page_image_pattern() -> &'static Regex {
    PAGE_IMAGE_PATTERN
        .get_or_init(|| Regex::new(r"^pages-(\d+)\.img$").expect("page image pattern is valid"))
}

pub fn is_page_image(name: &str) -> bool {
    name != PARENT_MARKER && page_image_pattern().is_match(name)
}

/// Size in whole megabytes of the page images written by one iteration.
///
/// Each file is converted with integer division before summing, so images
/// smaller than 1 MiB contribute nothing. The listing is not recursive.
pub async fn dirty_page_size_mb(iteration_dir: &Path) -> Result<u64> {
    let mut entries = tokio::fs::read_dir(iteration_dir)
        .await
        .map_err(|source| CheckpointError::ReadIteration {
            path: iteration_dir.to_path_buf(),
            source,
        })?;

    let mut total_mb = 0u64;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| CheckpointError::ReadIteration {
            path: iteration_dir.to_path_buf(),
            source,
        })?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_page_image(&name) {
            continue;
        }

        let path = entry.path();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| CheckpointError::StatPage {
                path: path.clone(),
                source,
            })?;
        total_mb += metadata.len() / BYTES_PER_MB;
    }

    debug!(dir = %iteration_dir.display(), total_mb, "Measured dirty pages");
    Ok(total_mb)
}
