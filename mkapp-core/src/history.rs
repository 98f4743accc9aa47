//! Change history of a persisted application.
//!
//! Serialization of changes is done with a lease on the application record:
//! `begin_change` writes the new sequence index into `change_lease` with a
//! versioned update, so two processes racing for the same application cannot
//! both win. A lease whose change record has not been written yet is held,
//! which closes the window between taking the lease and writing the record.
//! GC keeps the newest changes by sequence index.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audit::AppAuditLogger;
use crate::change::{Change, ChangeMeta, ChangeRecord, ChangeSummary, RecordedChange};
use crate::error::{AppError, Result};
use crate::store::{self, AppKey, AppRecord, MetaStore, StoreError};

/// Result of a change garbage collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: usize,
    pub surviving: usize,
}

/// Reviews the batch of changes selected for deletion; an error vetoes it.
pub type GcReview<'a> = &'a (dyn Fn(&[ChangeRecord]) -> Result<()> + Send + Sync);

/// Accepts every GC batch.
pub fn accept_all(_: &[ChangeRecord]) -> Result<()> {
    Ok(())
}

/// Change history of one application.
pub struct ChangeHistory {
    store: Arc<dyn MetaStore>,
    key: AppKey,
    audit: AppAuditLogger,
}

impl ChangeHistory {
    pub fn new(store: Arc<dyn MetaStore>, key: AppKey, audit: AppAuditLogger) -> Self {
        Self { store, key, audit }
    }

    async fn record(&self) -> Result<AppRecord> {
        self.store
            .get_app(&self.key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("App '{}'", self.key)))
    }

    /// All changes ordered by sequence index.
    pub async fn changes(&self) -> Result<Vec<ChangeRecord>> {
        let record = self.record().await?;
        Ok(self.store.list_changes(record.id).await?)
    }

    pub async fn last_change(&self) -> Result<Option<ChangeRecord>> {
        Ok(self.changes().await?.pop())
    }

    /// Open a new in-progress change.
    pub async fn begin_change(&self, meta: ChangeMeta) -> Result<RecordedChange> {
        let mut record = self.record().await?;

        let existing = self.store.list_changes(record.id).await?;
        if let Some(stale) = existing.iter().rev().find(|c| c.is_in_progress()) {
            return Err(AppError::ChangeInProgress {
                app: self.key.to_string(),
                change: stale.name.clone(),
                started_at: stale.started_at,
            });
        }
        if let Some(lease) = record.change_lease {
            // Finalized leases are leftovers of a failed release.
            if !existing.iter().any(|c| c.seq == lease) {
                debug!(app = %self.key, lease, "Change lease held without a change record");
                return Err(AppError::ConcurrentChange {
                    app: self.key.to_string(),
                });
            }
        }

        let seq = record.next_change_seq;
        record.next_change_seq += 1;
        record.change_lease = Some(seq);
        let record = match self.store.update_app(record).await {
            Ok(updated) => updated,
            Err(StoreError::VersionMismatch { .. }) => {
                return Err(AppError::ConcurrentChange {
                    app: self.key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let change = ChangeRecord::begin(record.id, &record.name, seq, meta);
        self.store.put_change(change.clone()).await?;
        debug!(app = %self.key, change = %change.name, seq, "Began change");
        self.audit.change_began(&self.key.to_string(), &change.name);

        Ok(RecordedChange::new(
            Arc::clone(&self.store),
            self.key.clone(),
            change,
            self.audit.clone(),
        ))
    }

    /// Mark a change left in progress by a crashed run as failed.
    ///
    /// Returns the finalized record, or `None` when nothing was in progress.
    /// A lease left behind by a run that crashed before writing its change
    /// record is released as well.
    pub async fn fail_stale_change(&self) -> Result<Option<ChangeRecord>> {
        let record = self.record().await?;
        let changes = self.store.list_changes(record.id).await?;
        let Some(stale) = changes.iter().rev().find(|c| c.is_in_progress()).cloned() else {
            if let Some(lease) = record.change_lease {
                if !changes.iter().any(|c| c.seq == lease) {
                    warn!(app = %self.key, lease, "Releasing change lease without a change record");
                    store::modify_app(self.store.as_ref(), &self.key, |rec| {
                        if rec.change_lease == Some(lease) {
                            rec.change_lease = None;
                            true
                        } else {
                            false
                        }
                    })
                    .await?;
                }
            }
            return Ok(None);
        };

        warn!(app = %self.key, change = %stale.name, "Marking stale change as failed");
        let mut handle = RecordedChange::new(
            Arc::clone(&self.store),
            self.key.clone(),
            stale,
            self.audit.clone(),
        );
        handle.fail(ChangeSummary::default()).await?;
        Ok(handle.record().cloned())
    }

    /// Delete all but the `keep_latest` newest changes.
    ///
    /// `review` sees the whole batch before anything is deleted. The batch is
    /// removed with one bulk store call; if that fails the store is re-read so
    /// the reported counts match what actually happened.
    pub async fn gc_changes(&self, keep_latest: usize, review: GcReview<'_>) -> Result<GcReport> {
        let record = self.record().await?;
        let changes = self.store.list_changes(record.id).await?;
        let total = changes.len();

        if total <= keep_latest {
            return Ok(GcReport {
                deleted: 0,
                surviving: total,
            });
        }

        let doomed: Vec<ChangeRecord> = changes
            .into_iter()
            .take(total - keep_latest)
            .filter(|c| !c.is_in_progress())
            .collect();
        if doomed.is_empty() {
            return Ok(GcReport {
                deleted: 0,
                surviving: total,
            });
        }

        if let Err(e) = review(&doomed) {
            return Err(AppError::GcIncomplete {
                deleted: 0,
                surviving: total,
                source: Box::new(e),
            });
        }

        let seqs: Vec<u64> = doomed.iter().map(|c| c.seq).collect();
        match self.store.delete_changes(record.id, &seqs).await {
            Ok(deleted) => {
                let report = GcReport {
                    deleted,
                    surviving: total - deleted,
                };
                info!(
                    app = %self.key,
                    deleted = report.deleted,
                    surviving = report.surviving,
                    "Deleted old changes"
                );
                self.audit
                    .changes_collected(&self.key.to_string(), report.deleted, report.surviving);
                Ok(report)
            }
            Err(e) => {
                let surviving = self.store.list_changes(record.id).await?.len();
                let deleted = total.saturating_sub(surviving);
                warn!(app = %self.key, deleted, surviving, error = %e, "Deleting old changes failed");
                Err(AppError::GcIncomplete {
                    deleted,
                    surviving,
                    source: Box::new(e.into()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;
    use crate::change::ChangeOutcome;
    use crate::store::MemoryMetaStore;

    /// Store where another writer always wins the race for app records.
    struct RacingStore {
        inner: MemoryMetaStore,
    }

    #[async_trait]
    impl MetaStore for RacingStore {
        async fn get_app(&self, key: &AppKey) -> crate::store::Result<Option<AppRecord>> {
            self.inner.get_app(key).await
        }
        async fn list_apps(&self, ns: Option<&str>) -> crate::store::Result<Vec<AppRecord>> {
            self.inner.list_apps(ns).await
        }
        async fn create_app(&self, record: AppRecord) -> crate::store::Result<bool> {
            self.inner.create_app(record).await
        }
        async fn update_app(&self, record: AppRecord) -> crate::store::Result<AppRecord> {
            if let Some(current) = self.inner.get_app(&record.key()).await? {
                self.inner.update_app(current).await?;
            }
            self.inner.update_app(record).await
        }
        async fn rename_app(&self, from: &AppKey, to: &AppKey) -> crate::store::Result<bool> {
            self.inner.rename_app(from, to).await
        }
        async fn delete_app(&self, key: &AppKey) -> crate::store::Result<bool> {
            self.inner.delete_app(key).await
        }
        async fn list_changes(&self, app_id: Uuid) -> crate::store::Result<Vec<ChangeRecord>> {
            self.inner.list_changes(app_id).await
        }
        async fn put_change(&self, change: ChangeRecord) -> crate::store::Result<()> {
            self.inner.put_change(change).await
        }
        async fn delete_changes(&self, app_id: Uuid, seqs: &[u64]) -> crate::store::Result<usize> {
            self.inner.delete_changes(app_id, seqs).await
        }
    }

    /// Store that holds the first in-progress `put_change` until released.
    struct GatedStore {
        inner: MemoryMetaStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MetaStore for GatedStore {
        async fn get_app(&self, key: &AppKey) -> crate::store::Result<Option<AppRecord>> {
            self.inner.get_app(key).await
        }
        async fn list_apps(&self, ns: Option<&str>) -> crate::store::Result<Vec<AppRecord>> {
            self.inner.list_apps(ns).await
        }
        async fn create_app(&self, record: AppRecord) -> crate::store::Result<bool> {
            self.inner.create_app(record).await
        }
        async fn update_app(&self, record: AppRecord) -> crate::store::Result<AppRecord> {
            self.inner.update_app(record).await
        }
        async fn rename_app(&self, from: &AppKey, to: &AppKey) -> crate::store::Result<bool> {
            self.inner.rename_app(from, to).await
        }
        async fn delete_app(&self, key: &AppKey) -> crate::store::Result<bool> {
            self.inner.delete_app(key).await
        }
        async fn list_changes(&self, app_id: Uuid) -> crate::store::Result<Vec<ChangeRecord>> {
            self.inner.list_changes(app_id).await
        }
        async fn put_change(&self, change: ChangeRecord) -> crate::store::Result<()> {
            if change.is_in_progress() && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.put_change(change).await
        }
        async fn delete_changes(&self, app_id: Uuid, seqs: &[u64]) -> crate::store::Result<usize> {
            self.inner.delete_changes(app_id, seqs).await
        }
    }

    async fn setup() -> (Arc<MemoryMetaStore>, ChangeHistory) {
        let store = Arc::new(MemoryMetaStore::new());
        let key = AppKey::new("default", "web");
        store
            .create_app(AppRecord::new(&key, BTreeMap::new()))
            .await
            .unwrap();
        let history = ChangeHistory::new(store.clone(), key, AppAuditLogger::new_noop());
        (store, history)
    }

    async fn finished_change(history: &ChangeHistory) -> ChangeRecord {
        let mut change = history.begin_change(ChangeMeta::default()).await.unwrap();
        change.succeed(ChangeSummary::default()).await.unwrap();
        change.record().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sequence_strictly_increasing() {
        let (_store, history) = setup().await;
        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(finished_change(&history).await.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let changes = history.changes().await.unwrap();
        assert!(changes.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(changes.iter().all(|c| c.outcome == ChangeOutcome::Succeeded));
        assert_eq!(history.last_change().await.unwrap().unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_second_begin_rejected_while_in_progress() {
        let (_store, history) = setup().await;
        let mut first = history.begin_change(ChangeMeta::default()).await.unwrap();

        let err = history
            .begin_change(ChangeMeta::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ChangeInProgress { .. }));
        assert!(err.to_string().contains("web-change-1"));

        first.fail(ChangeSummary::default()).await.unwrap();
        let second = history.begin_change(ChangeMeta::default()).await.unwrap();
        assert_eq!(second.record().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_lost_version_race_is_concurrent_change() {
        let store = Arc::new(RacingStore {
            inner: MemoryMetaStore::new(),
        });
        let key = AppKey::new("default", "web");
        store
            .create_app(AppRecord::new(&key, BTreeMap::new()))
            .await
            .unwrap();
        let history = ChangeHistory::new(store.clone(), key.clone(), AppAuditLogger::new_noop());

        let err = history
            .begin_change(ChangeMeta::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ConcurrentChange { .. }));

        // No change record was written for the lost race.
        let record = store.get_app(&key).await.unwrap().unwrap();
        assert!(store.list_changes(record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_begin_waits_out_unwritten_change_record() {
        let store = Arc::new(GatedStore {
            inner: MemoryMetaStore::new(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let key = AppKey::new("default", "web");
        store
            .create_app(AppRecord::new(&key, BTreeMap::new()))
            .await
            .unwrap();
        let first = ChangeHistory::new(store.clone(), key.clone(), AppAuditLogger::new_noop());
        let second = ChangeHistory::new(store.clone(), key.clone(), AppAuditLogger::new_noop());

        // The second caller runs while the first holds the lease but has
        // not written its change record yet.
        let (first_result, second_result) = tokio::join!(
            first.begin_change(ChangeMeta::default()),
            async {
                store.entered.notified().await;
                let result = second.begin_change(ChangeMeta::default()).await;
                store.release.notify_one();
                result
            }
        );

        let first_change = first_result.unwrap();
        assert_eq!(first_change.name(), "web-change-1");
        assert!(matches!(
            second_result.err().unwrap(),
            AppError::ConcurrentChange { .. }
        ));

        let record = store.get_app(&key).await.unwrap().unwrap();
        let in_progress = store
            .list_changes(record.id)
            .await
            .unwrap()
            .iter()
            .filter(|c| c.is_in_progress())
            .count();
        assert_eq!(in_progress, 1);
    }

    #[tokio::test]
    async fn test_fail_stale_change_releases_orphaned_lease() {
        let (store, history) = setup().await;
        let key = AppKey::new("default", "web");

        // A run that took the lease and crashed before writing its record.
        let mut record = store.get_app(&key).await.unwrap().unwrap();
        record.change_lease = Some(record.next_change_seq);
        record.next_change_seq += 1;
        store.update_app(record).await.unwrap();

        let err = history
            .begin_change(ChangeMeta::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ConcurrentChange { .. }));

        assert!(history.fail_stale_change().await.unwrap().is_none());
        let record = store.get_app(&key).await.unwrap().unwrap();
        assert_eq!(record.change_lease, None);

        let change = history.begin_change(ChangeMeta::default()).await.unwrap();
        assert_eq!(change.record().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_finalize_twice_fails() {
        let (_store, history) = setup().await;
        let mut change = history.begin_change(ChangeMeta::default()).await.unwrap();
        change.succeed(ChangeSummary::default()).await.unwrap();
        let err = change.fail(ChangeSummary::default()).await.unwrap_err();
        assert!(matches!(err, AppError::ChangeFinalized(_)));
    }

    #[tokio::test]
    async fn test_fail_stale_change_unblocks() {
        let (_store, history) = setup().await;
        let change = history.begin_change(ChangeMeta::default()).await.unwrap();
        drop(change);

        assert!(history.begin_change(ChangeMeta::default()).await.is_err());
        let failed = history.fail_stale_change().await.unwrap().unwrap();
        assert_eq!(failed.outcome, ChangeOutcome::Failed);
        assert!(failed.finished_at.is_some());
        assert!(history.fail_stale_change().await.unwrap().is_none());
        assert!(history.begin_change(ChangeMeta::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_gc_keeps_newest() {
        let (_store, history) = setup().await;
        for _ in 0..5 {
            finished_change(&history).await;
        }

        let report = history.gc_changes(2, &accept_all).await.unwrap();
        assert_eq!(
            report,
            GcReport {
                deleted: 3,
                surviving: 2
            }
        );
        let seqs: Vec<u64> = history
            .changes()
            .await
            .unwrap()
            .iter()
            .map(|c| c.seq)
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_gc_nothing_to_do() {
        let (_store, history) = setup().await;
        finished_change(&history).await;
        let report = history.gc_changes(5, &accept_all).await.unwrap();
        assert_eq!(
            report,
            GcReport {
                deleted: 0,
                surviving: 1
            }
        );
    }

    #[tokio::test]
    async fn test_gc_review_sees_full_batch_and_can_veto() {
        let (_store, history) = setup().await;
        for _ in 0..3 {
            finished_change(&history).await;
        }

        let seen = std::sync::Mutex::new(Vec::new());
        let review = |batch: &[ChangeRecord]| -> Result<()> {
            seen.lock().unwrap().extend(batch.iter().map(|c| c.seq));
            Err(AppError::Rejected("not now".to_string()))
        };
        let err = history.gc_changes(1, &review).await.unwrap_err();
        match err {
            AppError::GcIncomplete {
                deleted, surviving, ..
            } => {
                assert_eq!(deleted, 0);
                assert_eq!(surviving, 3);
            }
            other => panic!("Unexpected error: {:?}", other),
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(history.changes().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sequence_survives_gc() {
        let (_store, history) = setup().await;
        for _ in 0..3 {
            finished_change(&history).await;
        }
        history.gc_changes(0, &accept_all).await.unwrap();
        assert!(history.changes().await.unwrap().is_empty());
        assert_eq!(finished_change(&history).await.seq, 4);
    }
}
