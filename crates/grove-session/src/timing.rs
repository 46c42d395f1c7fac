//! Phase timing for the launch critical path.
//!
//! Rank 0 brackets every synchronized phase with a [`Phase`] guard so
//! the launch timeline shows up in the log, and the unfurl steps are
//! measured on every rank so their per-node costs can be combined into
//! a critical-path reduction over the tree.

use std::time::Instant;

/// Scope guard that logs its wall-clock lifetime when enabled.
///
/// Disabled guards (every rank but 0) cost a branch and nothing else.
pub struct Phase {
    label: &'static str,
    start: Option<Instant>,
}

impl Phase {
    /// Start timing a phase. Pass `enabled = false` on ranks that should
    /// stay silent.
    pub fn begin(enabled: bool, label: &'static str) -> Phase {
        Phase {
            label,
            start: enabled.then(Instant::now),
        }
    }
}

impl Drop for Phase {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            let secs = start.elapsed().as_secs_f64();
            tracing::info!(phase = self.label, secs, "phase complete");
        }
    }
}

/// Nanoseconds elapsed since `start`, saturated into a `u64`.
pub fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
