use serde::Serialize;

use crate::checkpoint::{ErrorEntry, MigrationProgress};
use crate::uploader::QuotaWindow;

/// Report emitted at the end of every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Monotonic migration total: resolvable records, records taken on by this run,
    /// and everything already processed.
    pub total: usize,
    /// Records finished by this run, whatever the outcome.
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Records with nothing to migrate.
    pub skipped: usize,
    /// Hosted copies created by this run, including ones orphaned by a rejected patch.
    pub uploads: usize,
    /// Records still needing an upload after this run.
    pub remaining: usize,
    /// Records left for a later invocation by the per-run cap.
    pub deferred: usize,
    pub pending_uploads: usize,
    pub estimated_time_to_completion_secs: u64,
    pub cancelled: bool,
    pub dry_run: bool,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Offline view of a checkpoint, for the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub uploads_in_window: usize,
    pub quota_budget: usize,
    pub quota_window_secs: u64,
    pub recent_errors: Vec<ErrorEntry>,
}

impl StatusReport {
    pub fn from_progress(
        progress: &MigrationProgress,
        quota: &QuotaWindow,
        now: i64,
        error_limit: usize,
    ) -> Self {
        Self {
            total: progress.total_records,
            processed: progress.processed_records.len(),
            errors: progress.errors.len(),
            uploads_in_window: quota.used(&progress.upload_timestamps, now),
            quota_budget: quota.budget,
            quota_window_secs: quota.window.as_secs(),
            recent_errors: progress.recent_errors(error_limit).to_vec(),
        }
    }
}
