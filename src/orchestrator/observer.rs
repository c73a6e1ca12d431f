use std::time::Duration;

use tracing::{debug, info};

use super::summary::RunSummary;

/// Per-record state machine. `RetryWait` loops back to `Uploading`; `Done`,
/// `Skipped` and `Failed` are terminal and committed to the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Resolving,
    Uploading,
    RetryWait { attempt: u32, wait: Duration },
    Patching,
    Done,
    Skipped,
    Failed,
}

/// Progress hooks injected into the orchestrator. All methods default to no-ops.
pub trait ProgressObserver: Send + Sync {
    fn run_started(&self, _selected: usize, _total: usize) {}

    fn record_state(&self, _record_id: &str, _state: RecordState) {}

    /// `completed` counts records finished across all runs so far.
    fn record_finished(&self, _record_id: &str, _state: RecordState, _completed: usize, _total: usize) {
    }

    fn run_finished(&self, _summary: &RunSummary) {}
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Logs a percentage line per finished record.
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn run_started(&self, selected: usize, total: usize) {
        info!(selected, total, "migration run starting");
    }

    fn record_state(&self, record_id: &str, state: RecordState) {
        debug!(record_id, ?state, "record state");
    }

    fn record_finished(&self, record_id: &str, state: RecordState, completed: usize, total: usize) {
        let pct = if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        info!(
            record_id,
            ?state,
            completed,
            total,
            "progress {:.1}%",
            pct
        );
    }

    fn run_finished(&self, summary: &RunSummary) {
        info!(
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            remaining = summary.remaining,
            eta_secs = summary.estimated_time_to_completion_secs,
            cancelled = summary.cancelled,
            "migration run finished"
        );
    }
}
