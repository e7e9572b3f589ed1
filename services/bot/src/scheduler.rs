//! Lifecycle of staged files: register on upload, delete once expired.
//!
//! A record moves `Active -> Deleted` when a sweep at or after its expiry
//! removes the remote object (or finds it already gone). Failed deletions stay
//! Active and are retried on the next sweep, unless an attempt budget is
//! configured, in which case the record ends up `Abandoned`. Deleted records
//! are pruned from the store once they have been closed for `prune_after`.

use crate::config::{ExpiryConfig, MAX_WINDOW_SECS};
use crate::object_store::{DeleteOutcome, ObjectStore};
use crate::state_store::{RecordState, StagedFileRecord, StateStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Remote object removed
    pub deleted: usize,
    /// Remote object was already missing
    pub already_gone: usize,
    /// Deletion failed, record kept for the next sweep
    pub failed: usize,
    /// Deletion failed and the attempt budget is spent
    pub abandoned: usize,
    /// Old Deleted records dropped from the store
    pub pruned: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.deleted + self.already_gone
    }

    pub fn is_empty(&self) -> bool {
        self.closed() + self.failed + self.abandoned == 0
    }
}

/// Periodic deletion of expired staged files
pub struct ExpiryScheduler {
    state: Arc<StateStore>,
    store: Arc<dyn ObjectStore>,
    period: Duration,
    max_delete_attempts: Option<u32>,
    prune_after: chrono::Duration,
    /// One sweep at a time per scheduler
    sweep_lock: Mutex<()>,
}

impl ExpiryScheduler {
    pub fn new(state: Arc<StateStore>, store: Arc<dyn ObjectStore>, config: &ExpiryConfig) -> Self {
        Self {
            state,
            store,
            period: Duration::from_secs(config.sweep_interval_secs),
            max_delete_attempts: config.max_delete_attempts,
            prune_after: chrono::Duration::seconds(config.prune_after_secs.min(MAX_WINDOW_SECS) as i64),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Persist a new Active record; an existing record with the same id is replaced
    pub async fn register(&self, record: StagedFileRecord) -> Result<(), StoreError> {
        let record_id = record.record_id.clone();
        let expires_at = record.expires_at;
        self.state.insert_staged(record).await?;
        debug!(record_id = %record_id, expires_at = %expires_at, "Staged file registered");
        Ok(())
    }

    /// Delete every Active record due at `now`
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();

        for record in self.state.due_records(now).await {
            match self.store.delete(&record.remote_object_id).await {
                Ok(outcome) => {
                    match outcome {
                        DeleteOutcome::Deleted => report.deleted += 1,
                        DeleteOutcome::NotFound => report.already_gone += 1,
                    }
                    match self.state.mark_deleted(&record.record_id, Utc::now()).await {
                        Ok(_) => {
                            info!(
                                record_id = %record.record_id,
                                object_id = %record.remote_object_id,
                                outcome = ?outcome,
                                "Expired staged file removed"
                            );
                        }
                        Err(e) => {
                            // Still Active on disk; the next sweep sees NotFound and closes it
                            error!(error = %e, record_id = %record.record_id, "Failed to mark record deleted");
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    match self
                        .state
                        .record_delete_failure(
                            &record.record_id,
                            &message,
                            self.max_delete_attempts,
                            Utc::now(),
                        )
                        .await
                    {
                        Ok(Some(RecordState::Abandoned)) => {
                            report.abandoned += 1;
                            error!(
                                record_id = %record.record_id,
                                object_id = %record.remote_object_id,
                                attempts = record.delete_attempts + 1,
                                error = %message,
                                "Giving up on deleting staged file"
                            );
                        }
                        Ok(_) => {
                            report.failed += 1;
                            warn!(
                                record_id = %record.record_id,
                                attempts = record.delete_attempts + 1,
                                error = %message,
                                "Failed to delete staged file, will retry"
                            );
                        }
                        Err(store_err) => {
                            report.failed += 1;
                            error!(
                                error = %store_err,
                                record_id = %record.record_id,
                                "Failed to record deletion failure"
                            );
                        }
                    }
                }
            }
        }

        if let Some(cutoff) = now.checked_sub_signed(self.prune_after) {
            match self.state.prune_deleted(cutoff).await {
                Ok(pruned) => report.pruned = pruned,
                Err(e) => warn!(error = %e, "Failed to prune closed records"),
            }
        }

        metrics::counter!("bot.sweep.deleted").increment(report.closed() as u64);
        metrics::counter!("bot.sweep.failed").increment(report.failed as u64);
        metrics::counter!("bot.sweep.abandoned").increment(report.abandoned as u64);

        if report.pruned > 0 {
            debug!(pruned = report.pruned, "Closed records pruned");
        }
        if report.is_empty() {
            debug!("Sweep found nothing due");
        } else {
            info!(
                deleted = report.deleted,
                already_gone = report.already_gone,
                failed = report.failed,
                abandoned = report.abandoned,
                "Sweep completed"
            );
        }

        report
    }

    /// Run one sweep right away, then one per period until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_secs = self.period.as_secs(), "Expiry scheduler started");

            // Catch up on everything that expired while the process was down
            self.sweep(Utc::now()).await;

            let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Expiry scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MockObjectStore, ObjectStoreError};
    use crate::state_store::Owner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn owner() -> Owner {
        Owner {
            user_id: 1,
            chat_id: 10,
        }
    }

    fn record(name: &str, created_at: DateTime<Utc>) -> StagedFileRecord {
        StagedFileRecord::new(
            name,
            format!("staged/{}", name),
            format!("https://files.example.com/{}", name),
            owner(),
            80 * 1024 * 1024,
            created_at,
            chrono::Duration::hours(12),
        )
    }

    fn config(max_delete_attempts: Option<u32>) -> ExpiryConfig {
        ExpiryConfig {
            max_delete_attempts,
            ..ExpiryConfig::default()
        }
    }

    async fn scheduler_with(
        mock: MockObjectStore,
        dir: &tempfile::TempDir,
        max_delete_attempts: Option<u32>,
    ) -> (ExpiryScheduler, Arc<StateStore>) {
        let state = Arc::new(StateStore::open(dir.path().join("state.json")).await);
        let scheduler = ExpiryScheduler::new(state.clone(), Arc::new(mock), &config(max_delete_attempts));
        (scheduler, state)
    }

    #[tokio::test]
    async fn test_no_deletion_before_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete().times(0);
        let (scheduler, state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now();
        let rec = record("clip.mp4", created);
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        let report = scheduler.sweep(created + chrono::Duration::hours(11)).await;
        assert!(report.is_empty());
        assert_eq!(state.staged_record(&id).await.unwrap().state, RecordState::Active);
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete()
            .withf(|id| id == "staged/clip.mp4")
            .times(1)
            .returning(|_| Ok(DeleteOutcome::Deleted));
        let (scheduler, state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now();
        let rec = record("clip.mp4", created);
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        let at = created + chrono::Duration::hours(12) + chrono::Duration::seconds(1);
        let first = scheduler.sweep(at).await;
        assert_eq!(first.deleted, 1);

        let second = scheduler.sweep(at + chrono::Duration::minutes(30)).await;
        assert!(second.is_empty());

        let stored = state.staged_record(&id).await.unwrap();
        assert_eq!(stored.state, RecordState::Deleted);
        assert!(stored.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_remote_object_counts_as_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete()
            .times(1)
            .returning(|_| Ok(DeleteOutcome::NotFound));
        let (scheduler, state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now() - chrono::Duration::hours(13);
        let rec = record("gone.mp4", created);
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        let report = scheduler.sweep(Utc::now()).await;
        assert_eq!(report.already_gone, 1);
        assert_eq!(state.staged_record(&id).await.unwrap().state, RecordState::Deleted);
    }

    #[tokio::test]
    async fn test_failed_deletion_is_retried_next_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut mock = MockObjectStore::new();
        mock.expect_delete().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ObjectStoreError::DeletionFailed("503 Slow Down".to_string()))
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        });
        let (scheduler, state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now() - chrono::Duration::hours(13);
        let rec = record("retry.mp4", created);
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        let first = scheduler.sweep(Utc::now()).await;
        assert_eq!(first.failed, 1);
        let stored = state.staged_record(&id).await.unwrap();
        assert_eq!(stored.state, RecordState::Active);
        assert_eq!(stored.delete_attempts, 1);
        assert!(stored.last_error.unwrap().contains("503"));

        let second = scheduler.sweep(Utc::now()).await;
        assert_eq!(second.deleted, 1);
        assert_eq!(state.staged_record(&id).await.unwrap().state, RecordState::Deleted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_abandons_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete().times(2).returning(|_| {
            Err(ObjectStoreError::Timeout {
                operation: "delete",
                after: Duration::from_secs(30),
            })
        });
        let (scheduler, state) = scheduler_with(mock, &dir, Some(2)).await;

        let rec = record("stuck.mp4", Utc::now() - chrono::Duration::hours(13));
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        assert_eq!(scheduler.sweep(Utc::now()).await.failed, 1);
        assert_eq!(scheduler.sweep(Utc::now()).await.abandoned, 1);
        // Abandoned records are never retried
        assert!(scheduler.sweep(Utc::now()).await.is_empty());
        assert_eq!(state.staged_record(&id).await.unwrap().state, RecordState::Abandoned);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete().times(2).returning(|id| {
            if id.contains("bad") {
                Err(ObjectStoreError::DeletionFailed("access denied".to_string()))
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        });
        let (scheduler, _state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now() - chrono::Duration::hours(13);
        scheduler.register(record("bad.mp4", created)).await.unwrap();
        scheduler
            .register(record("good.mp4", created + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let report = scheduler.sweep(Utc::now()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_sweeps_before_first_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // Registered by a previous process, expired while it was down
        let rec = record("old.mp4", Utc::now() - chrono::Duration::days(1));
        let id = rec.record_id.clone();
        {
            let previous = StateStore::open(&path).await;
            previous.insert_staged(rec).await.unwrap();
        }

        let mut mock = MockObjectStore::new();
        mock.expect_delete()
            .withf(|object_id| object_id == "staged/old.mp4")
            .times(1)
            .returning(|_| Ok(DeleteOutcome::Deleted));

        let state = Arc::new(StateStore::open(&path).await);
        assert_eq!(state.staged_record(&id).await.unwrap().state, RecordState::Active);
        let scheduler = Arc::new(ExpiryScheduler::new(state.clone(), Arc::new(mock), &config(None)));
        let period = scheduler.period();
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let handle = scheduler.spawn(shutdown.clone());

        let mut closed = false;
        for _ in 0..500 {
            if state.staged_record(&id).await.unwrap().state == RecordState::Deleted {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);
        assert!(started.elapsed() < period);

        shutdown.cancel();
        handle.await.unwrap();

        let after_restart = StateStore::open(&path).await;
        assert_eq!(after_restart.staged_record(&id).await.unwrap().state, RecordState::Deleted);
    }

    #[tokio::test]
    async fn test_sweep_prunes_long_closed_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_delete()
            .times(1)
            .returning(|_| Ok(DeleteOutcome::Deleted));
        let (scheduler, state) = scheduler_with(mock, &dir, None).await;

        let created = Utc::now() - chrono::Duration::hours(13);
        let rec = record("clip.mp4", created);
        let id = rec.record_id.clone();
        scheduler.register(rec).await.unwrap();

        let first = scheduler.sweep(Utc::now()).await;
        assert_eq!(first.deleted, 1);
        assert_eq!(first.pruned, 0);

        // Still inside the prune window
        let soon = scheduler.sweep(Utc::now() + chrono::Duration::days(6)).await;
        assert_eq!(soon.pruned, 0);
        assert!(state.staged_record(&id).await.is_some());

        let later = scheduler.sweep(Utc::now() + chrono::Duration::days(8)).await;
        assert_eq!(later.pruned, 1);
        assert!(later.is_empty());
        assert!(state.staged_record(&id).await.is_none());
    }
}
