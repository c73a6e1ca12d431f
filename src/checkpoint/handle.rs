use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::{CheckpointStore, ErrorEntry, MigrationProgress};
use crate::clock::Clock;
use crate::error::CheckpointError;
use crate::uploader::QuotaWindow;

/// Poll interval when every slot in the window is held by an in-flight upload
/// and the ledger itself has nothing to expire.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Granted,
    Wait(Duration),
}

struct State {
    progress: MigrationProgress,
    in_flight: usize,
}

/// Single writer over `MigrationProgress`. Every mutation is written through to
/// the store before the lock is released, so saves are serialized no matter how
/// many records are in flight.
pub struct ProgressHandle {
    state: Mutex<State>,
    store: Arc<dyn CheckpointStore>,
    ledger_window: Option<(QuotaWindow, Arc<dyn Clock>)>,
}

impl ProgressHandle {
    pub fn new(progress: MigrationProgress, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            state: Mutex::new(State {
                progress,
                in_flight: 0,
            }),
            store,
            ledger_window: None,
        }
    }

    pub async fn open(store: Arc<dyn CheckpointStore>) -> Result<Self, CheckpointError> {
        let progress = store.load().await?;
        debug!(
            processed = progress.processed_records.len(),
            ledger = progress.upload_timestamps.len(),
            errors = progress.errors.len(),
            "checkpoint loaded"
        );
        Ok(Self::new(progress, store))
    }

    /// Keep the ledger trimmed to the trailing `quota` window: expired entries are
    /// dropped from the loaded state now and again before every save.
    pub fn with_ledger_window(mut self, quota: QuotaWindow, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        quota.prune(&mut self.state.get_mut().progress.upload_timestamps, now);
        self.ledger_window = Some((quota, clock));
        self
    }

    async fn persist(&self, state: &mut State) -> Result<(), CheckpointError> {
        if let Some((quota, clock)) = &self.ledger_window {
            quota.prune(&mut state.progress.upload_timestamps, clock.now_millis());
        }
        self.store.save(&state.progress).await
    }

    pub async fn snapshot(&self) -> MigrationProgress {
        self.state.lock().await.progress.clone()
    }

    /// Reserve one upload against the rolling quota. Expired ledger entries are
    /// pruned first; in-flight reservations count as used so concurrent workers
    /// cannot jointly overshoot the budget.
    pub async fn try_reserve_slot(&self, quota: &QuotaWindow, now: i64) -> SlotDecision {
        let mut state = self.state.lock().await;
        quota.prune(&mut state.progress.upload_timestamps, now);
        let used = state.progress.upload_timestamps.len() + state.in_flight;
        if used < quota.budget {
            state.in_flight += 1;
            return SlotDecision::Granted;
        }
        let wait = quota
            .wait_until_free(&state.progress.upload_timestamps, now)
            .unwrap_or(IN_FLIGHT_POLL);
        SlotDecision::Wait(wait)
    }

    /// Give back a reservation whose upload did not succeed.
    pub async fn release_slot(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Convert a reservation into a ledger entry and persist it.
    pub async fn commit_upload(&self, now: i64) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.progress.upload_timestamps.push(now);
        self.persist(&mut state).await
    }

    /// Raise the run total; never lowers it.
    pub async fn raise_total(&self, total: usize) -> Result<usize, CheckpointError> {
        let mut state = self.state.lock().await;
        if total > state.progress.total_records {
            state.progress.total_records = total;
            self.persist(&mut state).await?;
        }
        Ok(state.progress.total_records)
    }

    /// Mark roles finished and append any terminal failures in a single write.
    pub async fn commit_record(
        &self,
        record_id: &str,
        roles: &[String],
        failures: Vec<ErrorEntry>,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        for role in roles {
            state.progress.processed_records.mark(record_id, role);
        }
        state.progress.errors.extend(failures);
        self.persist(&mut state).await
    }

    /// Drop records from the processed set so the next run picks them up again.
    pub async fn requeue(&self, record_ids: &[String]) -> Result<usize, CheckpointError> {
        let mut state = self.state.lock().await;
        let removed = record_ids
            .iter()
            .filter(|id| state.progress.processed_records.remove(id))
            .count();
        if removed > 0 {
            self.persist(&mut state).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStore;
    use crate::clock::TokioClock;

    fn quota(budget: usize) -> QuotaWindow {
        QuotaWindow::new(budget, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn reservations_count_against_budget() {
        let store = Arc::new(MemoryStore::new());
        let handle = ProgressHandle::new(MigrationProgress::default(), store.clone());
        let q = quota(2);

        assert_eq!(handle.try_reserve_slot(&q, 1_000).await, SlotDecision::Granted);
        assert_eq!(handle.try_reserve_slot(&q, 1_000).await, SlotDecision::Granted);
        assert_eq!(
            handle.try_reserve_slot(&q, 1_000).await,
            SlotDecision::Wait(IN_FLIGHT_POLL)
        );

        handle.release_slot().await;
        assert_eq!(handle.try_reserve_slot(&q, 1_000).await, SlotDecision::Granted);
    }

    #[tokio::test]
    async fn full_ledger_waits_for_oldest_entry() {
        let store = Arc::new(MemoryStore::new());
        let handle = ProgressHandle::new(MigrationProgress::default(), store.clone());
        let q = quota(2);

        for now in [1_000, 5_000] {
            assert_eq!(handle.try_reserve_slot(&q, now).await, SlotDecision::Granted);
            handle.commit_upload(now).await.unwrap();
        }
        assert_eq!(store.save_count(), 2);
        assert_eq!(
            handle.try_reserve_slot(&q, 11_000).await,
            SlotDecision::Wait(Duration::from_millis(50_000))
        );
        assert_eq!(handle.try_reserve_slot(&q, 61_000).await, SlotDecision::Granted);
        assert_eq!(handle.snapshot().await.upload_timestamps, vec![5_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ledger_entries_are_dropped_on_load_and_save() {
        let mut seeded = MigrationProgress::default();
        seeded.upload_timestamps = vec![10_000, 95_000];
        let store = Arc::new(MemoryStore::with_progress(seeded));
        let clock = Arc::new(TokioClock::starting_at(100_000));
        let handle = ProgressHandle::open(store.clone())
            .await
            .unwrap()
            .with_ledger_window(quota(2), clock);
        assert_eq!(handle.snapshot().await.upload_timestamps, vec![95_000]);

        tokio::time::advance(Duration::from_secs(60)).await;
        handle
            .commit_record("rec1", &["Logo".into()], Vec::new())
            .await
            .unwrap();
        assert!(store.snapshot().unwrap().upload_timestamps.is_empty());
    }

    #[tokio::test]
    async fn total_only_grows() {
        let store = Arc::new(MemoryStore::new());
        let handle = ProgressHandle::new(MigrationProgress::default(), store.clone());
        assert_eq!(handle.raise_total(5).await.unwrap(), 5);
        assert_eq!(handle.raise_total(3).await.unwrap(), 5);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn commit_record_writes_roles_and_errors_once() {
        let store = Arc::new(MemoryStore::new());
        let handle = ProgressHandle::new(MigrationProgress::default(), store.clone());
        let failure = ErrorEntry {
            record_id: "rec1".into(),
            title: Some("One".into()),
            role: Some("Photo".into()),
            kind: Default::default(),
            error: "bad image".into(),
            hosted_url: None,
            timestamp: 9,
        };
        handle
            .commit_record("rec1", &["Logo".into(), "Photo".into()], vec![failure])
            .await
            .unwrap();
        assert_eq!(store.save_count(), 1);
        let saved = store.snapshot().unwrap();
        assert!(saved.processed_records.is_done("rec1", "Photo"));
        assert_eq!(saved.errors.len(), 1);

        assert_eq!(handle.requeue(&["rec1".into(), "rec9".into()]).await.unwrap(), 1);
        assert!(!store.snapshot().unwrap().processed_records.contains_record("rec1"));
    }
}
