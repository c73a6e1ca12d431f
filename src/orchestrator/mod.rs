//! Resumable migration run: list the source, select records not yet in the
//! checkpoint, drive each through resolve -> upload -> patch -> commit, and
//! report a summary. Per-record failures are recorded and skipped past; only
//! source and checkpoint failures abort the run.

mod observer;
mod summary;

pub use observer::{LogObserver, NoopObserver, ProgressObserver, RecordState};
pub use summary::{RunSummary, StatusReport};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::checkpoint::{CheckpointStore, ErrorEntry, ErrorKind, MigrationProgress, ProgressHandle};
use crate::clock::{Clock, TokioClock};
use crate::config::{EngineSettings, FieldMapping};
use crate::error::{MigrationError, SourceError, UploadError};
use crate::patcher::RecordPatcher;
use crate::resolver;
use crate::source::{self, SourceRecord, TabularSource};
use crate::uploader::{ImageHost, RateLimitedUploader};

/// Terminal result of one record within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Done { uploads: usize },
    Skipped,
    Failed { uploads: usize, errors: usize },
    /// Dry run: uploads that would have been attempted (zero for a skip).
    WouldUpload { uploads: usize },
    /// Stopped by the shutdown signal; nothing committed.
    Interrupted,
}

struct RoleTask<'a> {
    mapping: &'a FieldMapping,
    source_url: Option<String>,
}

struct WorkItem<'a> {
    record: &'a SourceRecord,
    tasks: Vec<RoleTask<'a>>,
}

impl WorkItem<'_> {
    fn upload_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.source_url.is_some()).count()
    }
}

struct RunPlan<'a> {
    work: Vec<WorkItem<'a>>,
    total: usize,
    deferred: usize,
}

impl<'a> RunPlan<'a> {
    fn build(
        records: &'a [SourceRecord],
        settings: &'a EngineSettings,
        progress: &MigrationProgress,
    ) -> Self {
        let processed = &progress.processed_records;
        let mut counted: HashSet<&str> = processed.record_ids().collect();
        let mut work = Vec::new();
        let mut deferred = 0usize;
        let mut taken = 0usize;

        for record in records {
            let all_tasks: Vec<RoleTask<'a>> = settings
                .mappings
                .iter()
                .map(|mapping| RoleTask {
                    mapping,
                    source_url: resolver::resolve(record, &mapping.attachment_field),
                })
                .collect();
            if all_tasks.iter().any(|t| t.source_url.is_some()) {
                counted.insert(record.id.as_str());
            }

            let tasks: Vec<RoleTask<'a>> = all_tasks
                .into_iter()
                .filter(|t| !processed.is_done(&record.id, &t.mapping.role))
                .collect();
            if tasks.is_empty() {
                continue;
            }
            let item = WorkItem { record, tasks };
            if item.upload_count() > 0 {
                if settings.max_uploads_per_run.is_some_and(|cap| taken >= cap) {
                    deferred += 1;
                    continue;
                }
                taken += 1;
            }
            // skip-only records become processed this run; count them up front so
            // progress never runs ahead of the total
            counted.insert(record.id.as_str());
            work.push(item);
        }

        RunPlan {
            work,
            total: counted.len(),
            deferred,
        }
    }
}

/// Records (and role uploads) still outstanding against `progress`.
fn outstanding(
    records: &[SourceRecord],
    settings: &EngineSettings,
    progress: &MigrationProgress,
) -> (usize, usize) {
    let mut remaining = 0;
    let mut pending_uploads = 0;
    for record in records {
        let pending = settings
            .mappings
            .iter()
            .filter(|m| !progress.processed_records.is_done(&record.id, &m.role))
            .filter(|m| resolver::resolve(record, &m.attachment_field).is_some())
            .count();
        if pending > 0 {
            remaining += 1;
            pending_uploads += pending;
        }
    }
    (remaining, pending_uploads)
}

#[derive(Default)]
struct Tally {
    processed: usize,
    successful: usize,
    failed: usize,
    skipped: usize,
    uploads: usize,
}

pub struct Orchestrator {
    source: Arc<dyn TabularSource>,
    host: Arc<dyn ImageHost>,
    store: Arc<dyn CheckpointStore>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ProgressObserver>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn TabularSource>,
        host: Arc<dyn ImageHost>,
        store: Arc<dyn CheckpointStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            host,
            store,
            settings,
            clock: Arc::new(TokioClock::new()),
            observer: Arc::new(LogObserver),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<RunSummary, MigrationError> {
        self.settings.validate()?;
        let progress = Arc::new(
            ProgressHandle::open(self.store.clone())
                .await?
                .with_ledger_window(self.settings.quota, self.clock.clone()),
        );

        let records = match source::fetch_all(
            self.source.as_ref(),
            &self.settings.listing_retry,
            &self.shutdown,
        )
        .await
        {
            Ok(records) => records,
            Err(SourceError::Cancelled) => {
                warn!("run cancelled while listing the source");
                let snapshot = progress.snapshot().await;
                return Ok(RunSummary {
                    total: snapshot.total_records,
                    cancelled: true,
                    dry_run: self.settings.dry_run,
                    recent_errors: snapshot
                        .recent_errors(self.settings.report_error_limit)
                        .to_vec(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let start = progress.snapshot().await;
        let plan = RunPlan::build(&records, &self.settings, &start);
        let total = if self.settings.dry_run {
            plan.total.max(start.total_records)
        } else {
            progress.raise_total(plan.total).await?
        };
        info!(
            listed = records.len(),
            selected = plan.work.len(),
            deferred = plan.deferred,
            total,
            dry_run = self.settings.dry_run,
            "run planned"
        );
        self.observer.run_started(plan.work.len(), total);
        for item in &plan.work {
            self.observer.record_state(&item.record.id, RecordState::Pending);
        }

        let ctx = RecordContext {
            settings: &self.settings,
            uploader: RateLimitedUploader::new(
                self.host.clone(),
                progress.clone(),
                self.settings.quota,
                self.settings.backoff,
                self.clock.clone(),
                self.shutdown.clone(),
            ),
            patcher: RecordPatcher::new(self.source.clone()),
            progress: progress.clone(),
            clock: self.clock.as_ref(),
            observer: self.observer.as_ref(),
            shutdown: &self.shutdown,
        };

        let mut tally = Tally::default();
        let mut completed = start.processed_records.len();
        let mut cancelled = false;
        let mut uploaded_before = false;

        for batch in plan.work.chunks(self.settings.concurrency) {
            if self.shutdown.is_cancelled() {
                cancelled = true;
                break;
            }
            let has_uploads = batch.iter().any(|item| item.upload_count() > 0);
            if has_uploads && uploaded_before && !self.settings.record_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.settings.record_delay) => {}
                }
            }
            uploaded_before |= has_uploads;

            let outcomes = join_all(batch.iter().map(|item| {
                let span = tracing::info_span!("record", record_id = %item.record.id);
                ctx.process(item).instrument(span)
            }))
            .await;

            for (item, outcome) in batch.iter().zip(outcomes) {
                let outcome = outcome?;
                let state = match outcome {
                    RecordOutcome::Done { uploads } => {
                        tally.successful += 1;
                        tally.uploads += uploads;
                        RecordState::Done
                    }
                    RecordOutcome::Failed { uploads, .. } => {
                        tally.failed += 1;
                        tally.uploads += uploads;
                        RecordState::Failed
                    }
                    RecordOutcome::Skipped => {
                        tally.skipped += 1;
                        RecordState::Skipped
                    }
                    RecordOutcome::WouldUpload { uploads } => {
                        if uploads == 0 {
                            tally.skipped += 1;
                        }
                        tally.uploads += uploads;
                        continue;
                    }
                    RecordOutcome::Interrupted => {
                        cancelled = true;
                        continue;
                    }
                };
                tally.processed += 1;
                if !start.processed_records.contains_record(&item.record.id) {
                    completed += 1;
                }
                self.observer
                    .record_finished(&item.record.id, state, completed, total);
            }
            if cancelled {
                break;
            }
        }

        let end = progress.snapshot().await;
        let (remaining, pending_uploads) = outstanding(&records, &self.settings, &end);
        let summary = RunSummary {
            total,
            processed: tally.processed,
            successful: tally.successful,
            failed: tally.failed,
            skipped: tally.skipped,
            uploads: tally.uploads,
            remaining,
            deferred: plan.deferred,
            pending_uploads,
            estimated_time_to_completion_secs: self
                .settings
                .quota
                .estimate_drain(pending_uploads)
                .as_secs(),
            cancelled,
            dry_run: self.settings.dry_run,
            recent_errors: end
                .recent_errors(self.settings.report_error_limit)
                .to_vec(),
        };
        self.observer.run_finished(&summary);
        Ok(summary)
    }
}

/// Everything one record needs while it moves through the state machine.
struct RecordContext<'r> {
    settings: &'r EngineSettings,
    uploader: RateLimitedUploader,
    patcher: RecordPatcher,
    progress: Arc<ProgressHandle>,
    clock: &'r dyn Clock,
    observer: &'r dyn ProgressObserver,
    shutdown: &'r CancellationToken,
}

impl RecordContext<'_> {
    fn failure(
        &self,
        record: &SourceRecord,
        role: &str,
        kind: ErrorKind,
        error: String,
        hosted_url: Option<String>,
    ) -> ErrorEntry {
        ErrorEntry {
            record_id: record.id.clone(),
            title: record.title(self.settings.title_field.as_deref()),
            role: Some(role.to_string()),
            kind,
            error,
            hosted_url,
            timestamp: self.clock.now_millis(),
        }
    }

    async fn process(&self, item: &WorkItem<'_>) -> Result<RecordOutcome, MigrationError> {
        let record = item.record;
        let observer = self.observer;
        observer.record_state(&record.id, RecordState::Resolving);

        if self.settings.dry_run {
            let uploads = item.upload_count();
            for task in &item.tasks {
                match &task.source_url {
                    Some(url) => info!(role = %task.mapping.role, %url, "dry run: would upload"),
                    None => debug!(role = %task.mapping.role, "dry run: nothing to migrate"),
                }
            }
            return Ok(RecordOutcome::WouldUpload { uploads });
        }

        let mut updates: BTreeMap<String, String> = BTreeMap::new();
        let mut uploaded: Vec<(&FieldMapping, String)> = Vec::new();
        let mut failures: Vec<ErrorEntry> = Vec::new();

        for task in &item.tasks {
            let role = task.mapping.role.as_str();
            let Some(url) = task.source_url.as_deref() else {
                debug!(role, "no attachment to migrate");
                continue;
            };
            observer.record_state(&record.id, RecordState::Uploading);
            let on_backoff = |attempt, wait| {
                observer.record_state(&record.id, RecordState::RetryWait { attempt, wait });
            };
            match self.uploader.upload_observed(url, on_backoff).await {
                Ok(hosted) => {
                    for field in &task.mapping.output_fields {
                        updates.insert(field.clone(), hosted.clone());
                    }
                    uploaded.push((task.mapping, hosted));
                }
                Err(UploadError::Cancelled) => return Ok(RecordOutcome::Interrupted),
                Err(UploadError::Checkpoint(e)) => return Err(e.into()),
                Err(e) => {
                    let kind = match e {
                        UploadError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
                        _ => ErrorKind::Upload,
                    };
                    warn!(role, error = %e, "upload failed; recording and moving on");
                    failures.push(self.failure(record, role, kind, e.to_string(), None));
                }
            }
        }

        let hosted_count = uploaded.len();
        if !updates.is_empty() {
            observer.record_state(&record.id, RecordState::Patching);
            let patched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(RecordOutcome::Interrupted),
                res = self.patcher.patch(record, &updates) => res,
            };
            match patched {
                Ok(()) => {}
                Err(e @ SourceError::Conflict { .. }) => {
                    for (mapping, hosted) in uploaded {
                        error!(
                            role = %mapping.role,
                            hosted_url = %hosted,
                            error = %e,
                            "record rejected update; hosted copy is orphaned"
                        );
                        failures.push(self.failure(
                            record,
                            &mapping.role,
                            ErrorKind::PatchConflict,
                            e.to_string(),
                            Some(hosted),
                        ));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let roles: Vec<String> = item.tasks.iter().map(|t| t.mapping.role.clone()).collect();
        let errors = failures.len();
        self.progress.commit_record(&record.id, &roles, failures).await?;

        let (outcome, state) = if errors > 0 {
            (
                RecordOutcome::Failed {
                    uploads: hosted_count,
                    errors,
                },
                RecordState::Failed,
            )
        } else if hosted_count > 0 {
            (RecordOutcome::Done { uploads: hosted_count }, RecordState::Done)
        } else {
            (RecordOutcome::Skipped, RecordState::Skipped)
        };
        observer.record_state(&record.id, state);
        Ok(outcome)
    }
}
