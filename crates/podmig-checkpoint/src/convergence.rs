//! Decides when further pre-dump passes stop paying off.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergencePolicy {
    /// Below this many dirty megabytes the remaining working set is negligible.
    pub floor_mb: u64,
    /// Percentage change at or below which an iteration counts as stable.
    pub stability_threshold_pct: f64,
    /// Number of consecutive stable iterations required to stop.
    pub stability_window: usize,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            floor_mb: 2,
            stability_threshold_pct: 5.0,
            stability_window: 4,
        }
    }
}

impl ConvergencePolicy {
    /// `history` holds the percentage change between successive iterations,
    /// oldest first; `latest_mb` is the size of the most recent iteration.
    pub fn should_stop(&self, history: &[f64], latest_mb: u64) -> bool {
        if latest_mb < self.floor_mb {
            return true;
        }
        if self.stability_window == 0 || history.len() < self.stability_window {
            return false;
        }
        history[history.len() - self.stability_window..]
            .iter()
            .all(|pct| *pct <= self.stability_threshold_pct)
    }
}

/// Absolute percentage change from `previous_mb` to `current_mb`.
pub fn percentage_change(previous_mb: u64, current_mb: u64) -> f64 {
    if previous_mb == 0 {
        return if current_mb == 0 { 0.0 } else { 100.0 };
    }
    let previous = previous_mb as f64;
    (100.0 * (previous - current_mb as f64) / previous).abs()
}
