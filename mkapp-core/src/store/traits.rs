//! MetaStore trait definitions.
//!
//! The persisted application variant keeps its identity record and change
//! history behind this trait, so the encoding in the backing store stays an
//! implementation detail of each backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::ChangeRecord;
use crate::resources::{GroupKind, GroupVersion};

use super::error::Result;

/// Address of a persisted application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppKey {
    pub namespace: String,
    pub name: String,
}

impl AppKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Persisted application metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    /// Stable id; change records hang off it so renames never move history.
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Bumped by every successful update (optimistic concurrency).
    pub version: u64,
    /// Value of the identity label stamped on every resource of this app.
    pub label_value: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub used_gvs: BTreeSet<GroupVersion>,
    #[serde(default)]
    pub used_gks: BTreeSet<GroupKind>,
    /// Sequence index handed to the next change.
    pub next_change_seq: u64,
    /// Sequence index of the change currently holding the lease.
    #[serde(default)]
    pub change_lease: Option<u64>,
}

impl AppRecord {
    pub fn new(key: &AppKey, labels: BTreeMap<String, String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            created_at: Utc::now(),
            version: 0,
            label_value: id.simple().to_string(),
            labels,
            used_gvs: BTreeSet::new(),
            used_gks: BTreeSet::new(),
            next_change_seq: 1,
            change_lease: None,
        }
    }

    pub fn key(&self) -> AppKey {
        AppKey::new(&self.namespace, &self.name)
    }
}

/// Store for persisted application records and their change history.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Get an application record.
    async fn get_app(&self, key: &AppKey) -> Result<Option<AppRecord>>;

    /// List application records, optionally restricted to one namespace.
    async fn list_apps(&self, namespace: Option<&str>) -> Result<Vec<AppRecord>>;

    /// Insert a new record. Returns whether a record already existed, in
    /// which case the stored record is left untouched.
    async fn create_app(&self, record: AppRecord) -> Result<bool>;

    /// Replace a record if its stored version equals `record.version`.
    ///
    /// Returns the stored record with the bumped version, or
    /// [`StoreError::VersionMismatch`](super::StoreError::VersionMismatch)
    /// when another writer got there first.
    async fn update_app(&self, record: AppRecord) -> Result<AppRecord>;

    /// Atomically move a record to a new key. Returns whether the source
    /// existed. Fails with a conflict if the target is taken.
    async fn rename_app(&self, from: &AppKey, to: &AppKey) -> Result<bool>;

    /// Delete a record together with all of its change records. Returns
    /// whether the record existed.
    async fn delete_app(&self, key: &AppKey) -> Result<bool>;

    /// Change records of an application ordered by sequence index.
    async fn list_changes(&self, app_id: Uuid) -> Result<Vec<ChangeRecord>>;

    /// Insert or replace a change record.
    async fn put_change(&self, change: ChangeRecord) -> Result<()>;

    /// Delete a batch of change records. Returns how many were removed.
    async fn delete_changes(&self, app_id: Uuid, seqs: &[u64]) -> Result<usize>;
}
