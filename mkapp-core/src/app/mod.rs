//! Applications: addressable groups of cluster resources.
//!
//! Two interchangeable variants implement [`App`]:
//! - [`LabeledApp`]: virtual, identified only by a label selector
//! - [`RecordedApp`]: backed by a persisted metadata record and change history
//!
//! Both share the verify-then-destroy deletion contract: an application's
//! identity is never removed while live resources still claim it.

pub mod labeled;
pub mod recorded;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::change::{Change, ChangeMeta, ChangeRecord};
use crate::error::{AppError, Result};
use crate::history::{GcReport, GcReview};
use crate::resources::{GroupKind, GroupVersion, LabelSelector, ListOpts, ResourceLister};

pub use labeled::LabeledApp;
pub use recorded::{APP_LABEL_KEY, RecordedApp};

/// Persisted metadata of an application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub label_key: String,
    pub label_value: String,
    pub labels: BTreeMap<String, String>,
    pub used_gvs: BTreeSet<GroupVersion>,
    pub used_gks: BTreeSet<GroupKind>,
    pub last_change: Option<ChangeRecord>,
}

/// Application capability set.
#[async_trait]
pub trait App: Send + Sync {
    fn name(&self) -> String;

    fn namespace(&self) -> String;

    fn description(&self) -> String;

    /// `None` for applications without a creation concept.
    async fn creation_timestamp(&self) -> Result<Option<DateTime<Utc>>>;

    async fn label_selector(&self) -> Result<LabelSelector>;

    async fn used_gvs(&self) -> Result<BTreeSet<GroupVersion>>;

    async fn used_gks(&self) -> Result<BTreeSet<GroupKind>>;

    /// Union the given sets into the persisted ones.
    async fn update_used_gvs_and_gks(&self, gvs: &[GroupVersion], gks: &[GroupKind])
    -> Result<()>;

    /// Create the application or merge `labels` into it. Returns whether a
    /// new record was created.
    async fn create_or_update(&self, labels: &BTreeMap<String, String>) -> Result<bool>;

    async fn exists(&self) -> Result<bool>;

    /// Verify no live resources remain, then remove the application.
    async fn delete(&self) -> Result<()>;

    async fn rename(&self, new_name: &str, new_namespace: &str) -> Result<()>;

    async fn meta(&self) -> Result<Meta>;

    async fn changes(&self) -> Result<Vec<ChangeRecord>>;

    async fn last_change(&self) -> Result<Option<ChangeRecord>>;

    async fn begin_change(&self, meta: ChangeMeta) -> Result<Box<dyn Change>>;

    async fn gc_changes(&self, keep_latest: usize, review: GcReview<'_>) -> Result<GcReport>;
}

/// Relist resources matching `selector` bypassing any cached type
/// enumeration and fail if any are left.
pub(crate) async fn verify_resources_gone(
    lister: &dyn ResourceLister,
    selector: &LabelSelector,
) -> Result<()> {
    let opts = ListOpts {
        ignore_cached_res_types: true,
    };
    let resources = lister
        .list(selector, None, opts)
        .await
        .map_err(AppError::Relisting)?;

    if !resources.is_empty() {
        let survivors = resources.iter().map(|r| r.description()).collect();
        return Err(AppError::ResourcesRemain { survivors });
    }

    Ok(())
}
