//! Label-selected application.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{App, Meta, verify_resources_gone};
use crate::change::{Change, ChangeMeta, ChangeRecord, NoopChange};
use crate::error::{AppError, Result};
use crate::history::{GcReport, GcReview};
use crate::resources::{GroupKind, GroupVersion, LabelSelector, ResourceLister};

/// Application whose existence is defined entirely by resources carrying
/// matching labels. Nothing about it is persisted.
pub struct LabeledApp {
    label_selector: LabelSelector,
    lister: Arc<dyn ResourceLister>,
}

impl LabeledApp {
    pub fn new(label_selector: LabelSelector, lister: Arc<dyn ResourceLister>) -> Self {
        Self {
            label_selector,
            lister,
        }
    }
}

#[async_trait]
impl App for LabeledApp {
    fn name(&self) -> String {
        let s = self.label_selector.to_string();
        if s.is_empty() { "?".to_string() } else { s }
    }

    fn namespace(&self) -> String {
        String::new()
    }

    fn description(&self) -> String {
        format!("labeled app '{}'", self.name())
    }

    async fn creation_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn label_selector(&self) -> Result<LabelSelector> {
        Ok(self.label_selector.clone())
    }

    async fn used_gvs(&self) -> Result<BTreeSet<GroupVersion>> {
        Ok(BTreeSet::new())
    }

    async fn used_gks(&self) -> Result<BTreeSet<GroupKind>> {
        Ok(BTreeSet::new())
    }

    async fn update_used_gvs_and_gks(
        &self,
        _gvs: &[GroupVersion],
        _gks: &[GroupKind],
    ) -> Result<()> {
        Ok(())
    }

    async fn create_or_update(&self, _labels: &BTreeMap<String, String>) -> Result<bool> {
        Ok(false)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn delete(&self) -> Result<()> {
        let label_selector = self.label_selector().await?;
        verify_resources_gone(self.lister.as_ref(), &label_selector).await
    }

    async fn rename(&self, _new_name: &str, _new_namespace: &str) -> Result<()> {
        Err(AppError::Unsupported {
            operation: "Renaming",
            app: self.description(),
        })
    }

    async fn meta(&self) -> Result<Meta> {
        Ok(Meta::default())
    }

    async fn changes(&self) -> Result<Vec<ChangeRecord>> {
        Ok(Vec::new())
    }

    async fn last_change(&self) -> Result<Option<ChangeRecord>> {
        Ok(None)
    }

    async fn begin_change(&self, _meta: ChangeMeta) -> Result<Box<dyn Change>> {
        Ok(Box::new(NoopChange))
    }

    async fn gc_changes(&self, _keep_latest: usize, _review: GcReview<'_>) -> Result<GcReport> {
        Ok(GcReport::default())
    }
}
