//! Change records and handles.
//!
//! A [`ChangeRecord`] is the durable trace of one apply attempt. The
//! [`Change`] handle returned by `begin_change` is the only way to finalize
//! it; once finalized a record never changes again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::audit::AppAuditLogger;
use crate::error::{AppError, Result};
use crate::store::{self, AppKey, MetaStore};

/// Outcome of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for ChangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeOutcome::InProgress => "in progress",
            ChangeOutcome::Succeeded => "succeeded",
            ChangeOutcome::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Scope of the operation a change describes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMeta {
    pub description: String,
    /// Namespaces touched; cluster-scoped resources are listed as `(cluster)`.
    #[serde(default)]
    pub namespaces: BTreeSet<String>,
}

/// Per-operation breakdown recorded when a change is finalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// One durable record of an apply attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub app_id: Uuid,
    /// Strictly increasing per application.
    pub seq: u64,
    pub name: String,
    pub meta: ChangeMeta,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: ChangeOutcome,
    #[serde(default)]
    pub summary: ChangeSummary,
}

impl ChangeRecord {
    pub fn begin(app_id: Uuid, app_name: &str, seq: u64, meta: ChangeMeta) -> Self {
        Self {
            app_id,
            seq,
            name: format!("{}-change-{}", app_name, seq),
            meta,
            started_at: Utc::now(),
            finished_at: None,
            outcome: ChangeOutcome::InProgress,
            summary: ChangeSummary::default(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.outcome == ChangeOutcome::InProgress
    }
}

/// Handle to an in-progress change.
#[async_trait]
pub trait Change: Send + Sync {
    /// Name of the change, empty for changes that are not recorded.
    fn name(&self) -> &str;

    /// The backing record, if the change is recorded.
    fn record(&self) -> Option<&ChangeRecord>;

    async fn succeed(&mut self, summary: ChangeSummary) -> Result<()>;

    async fn fail(&mut self, summary: ChangeSummary) -> Result<()>;
}

/// Change handed out by applications without persisted history.
#[derive(Debug, Default)]
pub struct NoopChange;

#[async_trait]
impl Change for NoopChange {
    fn name(&self) -> &str {
        ""
    }

    fn record(&self) -> Option<&ChangeRecord> {
        None
    }

    async fn succeed(&mut self, _summary: ChangeSummary) -> Result<()> {
        Ok(())
    }

    async fn fail(&mut self, _summary: ChangeSummary) -> Result<()> {
        Ok(())
    }
}

/// Change persisted through a [`MetaStore`].
pub struct RecordedChange {
    store: Arc<dyn MetaStore>,
    app: AppKey,
    record: ChangeRecord,
    audit: AppAuditLogger,
}

impl RecordedChange {
    pub(crate) fn new(
        store: Arc<dyn MetaStore>,
        app: AppKey,
        record: ChangeRecord,
        audit: AppAuditLogger,
    ) -> Self {
        Self {
            store,
            app,
            record,
            audit,
        }
    }

    async fn finish(&mut self, outcome: ChangeOutcome, summary: ChangeSummary) -> Result<()> {
        if !self.record.is_in_progress() {
            return Err(AppError::ChangeFinalized(self.record.name.clone()));
        }

        let mut finished = self.record.clone();
        finished.outcome = outcome;
        finished.finished_at = Some(Utc::now());
        finished.summary = summary;
        self.store.put_change(finished.clone()).await?;
        self.record = finished;

        // The lease is only advisory once the record is final; a failed
        // release is picked up by the next begin_change.
        let seq = self.record.seq;
        let released = store::modify_app(self.store.as_ref(), &self.app, |rec| {
            if rec.change_lease == Some(seq) {
                rec.change_lease = None;
                true
            } else {
                false
            }
        })
        .await;
        if let Err(e) = released {
            warn!(app = %self.app, change = %self.record.name, error = %e, "Failed to release change lease");
        }

        self.audit
            .change_finished(&self.app.to_string(), &self.record.name, outcome);
        Ok(())
    }
}

#[async_trait]
impl Change for RecordedChange {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn record(&self) -> Option<&ChangeRecord> {
        Some(&self.record)
    }

    async fn succeed(&mut self, summary: ChangeSummary) -> Result<()> {
        self.finish(ChangeOutcome::Succeeded, summary).await
    }

    async fn fail(&mut self, summary: ChangeSummary) -> Result<()> {
        self.finish(ChangeOutcome::Failed, summary).await
    }
}

impl Drop for RecordedChange {
    fn drop(&mut self) {
        if self.record.is_in_progress() {
            warn!(
                app = %self.app,
                change = %self.record.name,
                "Change dropped while still in progress"
            );
        }
    }
}
