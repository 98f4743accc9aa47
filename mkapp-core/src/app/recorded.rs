//! Application backed by a persisted metadata record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{App, Meta, verify_resources_gone};
use crate::audit::AppAuditLogger;
use crate::change::{Change, ChangeMeta, ChangeRecord};
use crate::error::{AppError, Result};
use crate::history::{ChangeHistory, GcReport, GcReview};
use crate::resources::{GroupKind, GroupVersion, LabelSelector, ResourceLister};
use crate::store::{self, AppKey, AppRecord, MetaStore, StoreError};

/// Label stamped on every resource that belongs to a recorded application.
pub const APP_LABEL_KEY: &str = "mkapp.dev/app";

/// Application persisted through a [`MetaStore`].
pub struct RecordedApp {
    key: RwLock<AppKey>,
    store: Arc<dyn MetaStore>,
    lister: Arc<dyn ResourceLister>,
    audit: AppAuditLogger,
}

impl RecordedApp {
    pub fn new(
        key: AppKey,
        store: Arc<dyn MetaStore>,
        lister: Arc<dyn ResourceLister>,
        audit: AppAuditLogger,
    ) -> Self {
        Self {
            key: RwLock::new(key),
            store,
            lister,
            audit,
        }
    }

    fn key(&self) -> AppKey {
        self.key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn history(&self) -> ChangeHistory {
        ChangeHistory::new(Arc::clone(&self.store), self.key(), self.audit.clone())
    }

    async fn record(&self) -> Result<AppRecord> {
        self.store
            .get_app(&self.key())
            .await?
            .ok_or_else(|| AppError::NotFound(self.description()))
    }

    /// Finalize a change left in progress by a crashed deploy as failed.
    pub async fn fail_stale_change(&self) -> Result<Option<ChangeRecord>> {
        self.history().fail_stale_change().await
    }
}

#[async_trait]
impl App for RecordedApp {
    fn name(&self) -> String {
        self.key().name
    }

    fn namespace(&self) -> String {
        self.key().namespace
    }

    fn description(&self) -> String {
        let key = self.key();
        format!("app '{}' namespace: {}", key.name, key.namespace)
    }

    async fn creation_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(Some(self.record().await?.created_at))
    }

    async fn label_selector(&self) -> Result<LabelSelector> {
        let record = self.record().await?;
        Ok(LabelSelector::new().with_equals(APP_LABEL_KEY, record.label_value))
    }

    async fn used_gvs(&self) -> Result<BTreeSet<GroupVersion>> {
        Ok(self.record().await?.used_gvs)
    }

    async fn used_gks(&self) -> Result<BTreeSet<GroupKind>> {
        Ok(self.record().await?.used_gks)
    }

    async fn update_used_gvs_and_gks(
        &self,
        gvs: &[GroupVersion],
        gks: &[GroupKind],
    ) -> Result<()> {
        let key = self.key();
        let updated = store::modify_app(self.store.as_ref(), &key, |rec| {
            let before = (rec.used_gvs.len(), rec.used_gks.len());
            rec.used_gvs.extend(gvs.iter().cloned());
            rec.used_gks.extend(gks.iter().cloned());
            before != (rec.used_gvs.len(), rec.used_gks.len())
        })
        .await?;
        updated
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(self.description()))
    }

    async fn create_or_update(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        let key = self.key();

        if self.store.get_app(&key).await?.is_none() {
            let existed = self
                .store
                .create_app(AppRecord::new(&key, labels.clone()))
                .await?;
            if !existed {
                info!(app = %key, "Created app");
                self.audit.app_created(&key.to_string());
                return Ok(true);
            }
        }

        let mut changed = false;
        let updated = store::modify_app(self.store.as_ref(), &key, |rec| {
            changed = labels
                .iter()
                .any(|(k, v)| rec.labels.get(k) != Some(v));
            if changed {
                rec.labels
                    .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            changed
        })
        .await?;
        if updated.is_none() {
            return Err(AppError::NotFound(self.description()));
        }
        if changed {
            self.audit.app_updated(&key.to_string());
        }
        Ok(false)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.store.get_app(&self.key()).await?.is_some())
    }

    async fn delete(&self) -> Result<()> {
        let label_selector = self.label_selector().await?;
        verify_resources_gone(self.lister.as_ref(), &label_selector).await?;

        let key = self.key();
        if self.store.delete_app(&key).await? {
            info!(app = %key, "Deleted app");
            self.audit.app_deleted(&key.to_string());
        }
        Ok(())
    }

    async fn rename(&self, new_name: &str, new_namespace: &str) -> Result<()> {
        let from = self.key();
        let to = AppKey::new(new_namespace, new_name);

        match self.store.rename_app(&from, &to).await {
            Ok(true) => {}
            Ok(false) => return Err(AppError::NotFound(self.description())),
            Err(StoreError::Conflict(_)) => {
                return Err(AppError::AlreadyExists(format!(
                    "app '{}' namespace: {}",
                    to.name, to.namespace
                )));
            }
            Err(e) => return Err(e.into()),
        }

        *self
            .key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = to.clone();
        info!(from = %from, to = %to, "Renamed app");
        self.audit.app_renamed(&from.to_string(), &to.to_string());
        Ok(())
    }

    async fn meta(&self) -> Result<Meta> {
        let record = self.record().await?;
        let last_change = self.store.list_changes(record.id).await?.pop();
        Ok(Meta {
            label_key: APP_LABEL_KEY.to_string(),
            label_value: record.label_value,
            labels: record.labels,
            used_gvs: record.used_gvs,
            used_gks: record.used_gks,
            last_change,
        })
    }

    async fn changes(&self) -> Result<Vec<ChangeRecord>> {
        self.history().changes().await
    }

    async fn last_change(&self) -> Result<Option<ChangeRecord>> {
        self.history().last_change().await
    }

    async fn begin_change(&self, meta: ChangeMeta) -> Result<Box<dyn Change>> {
        let change = self.history().begin_change(meta).await?;
        Ok(Box::new(change))
    }

    async fn gc_changes(&self, keep_latest: usize, review: GcReview<'_>) -> Result<GcReport> {
        self.history().gc_changes(keep_latest, review).await
    }
}
