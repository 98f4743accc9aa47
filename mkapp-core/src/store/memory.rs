//! In-memory MetaStore.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::change::ChangeRecord;

use super::error::{Result, StoreError};
use super::traits::{AppKey, AppRecord, MetaStore};

#[derive(Default)]
struct Inner {
    apps: HashMap<AppKey, AppRecord>,
    changes: BTreeMap<(Uuid, u64), ChangeRecord>,
}

/// MetaStore keeping everything in process memory.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: RwLock<Inner>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_app(&self, key: &AppKey) -> Result<Option<AppRecord>> {
        Ok(self.inner.read().await.apps.get(key).cloned())
    }

    async fn list_apps(&self, namespace: Option<&str>) -> Result<Vec<AppRecord>> {
        let inner = self.inner.read().await;
        let mut apps: Vec<AppRecord> = inner
            .apps
            .values()
            .filter(|a| namespace.is_none_or(|ns| a.namespace == ns))
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(apps)
    }

    async fn create_app(&self, record: AppRecord) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = record.key();
        if inner.apps.contains_key(&key) {
            return Ok(true);
        }
        inner.apps.insert(key, record);
        Ok(false)
    }

    async fn update_app(&self, mut record: AppRecord) -> Result<AppRecord> {
        let mut inner = self.inner.write().await;
        let key = record.key();
        let current = inner
            .apps
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if current.version != record.version {
            return Err(StoreError::VersionMismatch {
                expected: record.version,
                actual: current.version,
            });
        }
        record.version += 1;
        inner.apps.insert(key, record.clone());
        Ok(record)
    }

    async fn rename_app(&self, from: &AppKey, to: &AppKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.apps.contains_key(from) {
            return Ok(false);
        }
        if inner.apps.contains_key(to) {
            return Err(StoreError::Conflict(to.to_string()));
        }
        if let Some(mut record) = inner.apps.remove(from) {
            record.namespace = to.namespace.clone();
            record.name = to.name.clone();
            record.version += 1;
            inner.apps.insert(to.clone(), record);
        }
        Ok(true)
    }

    async fn delete_app(&self, key: &AppKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.apps.remove(key) {
            Some(record) => {
                inner.changes.retain(|(app_id, _), _| *app_id != record.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_changes(&self, app_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .changes
            .range((app_id, 0)..=(app_id, u64::MAX))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn put_change(&self, change: ChangeRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.changes.insert((change.app_id, change.seq), change);
        Ok(())
    }

    async fn delete_changes(&self, app_id: Uuid, seqs: &[u64]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        Ok(seqs
            .iter()
            .filter(|seq| inner.changes.remove(&(app_id, **seq)).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeMeta;

    fn record(ns: &str, name: &str) -> AppRecord {
        AppRecord::new(&AppKey::new(ns, name), BTreeMap::new())
    }

    #[tokio::test]
    async fn test_create_reports_existing() {
        let store = MemoryMetaStore::new();
        assert!(!store.create_app(record("default", "web")).await.unwrap());
        assert!(store.create_app(record("default", "web")).await.unwrap());
        assert_eq!(store.list_apps(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = MemoryMetaStore::new();
        let rec = record("default", "web");
        store.create_app(rec.clone()).await.unwrap();

        let updated = store.update_app(rec.clone()).await.unwrap();
        assert_eq!(updated.version, 1);

        let err = store.update_app(rec).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_rename_keeps_changes() {
        let store = MemoryMetaStore::new();
        let rec = record("default", "web");
        let id = rec.id;
        store.create_app(rec).await.unwrap();
        store
            .put_change(ChangeRecord::begin(id, "web", 1, ChangeMeta::default()))
            .await
            .unwrap();

        let from = AppKey::new("default", "web");
        let to = AppKey::new("default", "frontend");
        assert!(store.rename_app(&from, &to).await.unwrap());
        assert!(store.get_app(&from).await.unwrap().is_none());

        let renamed = store.get_app(&to).await.unwrap().unwrap();
        assert_eq!(renamed.name, "frontend");
        assert_eq!(renamed.id, id);
        assert_eq!(store.list_changes(id).await.unwrap().len(), 1);

        assert!(!store.rename_app(&from, &to).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_conflict() {
        let store = MemoryMetaStore::new();
        store.create_app(record("default", "a")).await.unwrap();
        store.create_app(record("default", "b")).await.unwrap();
        let err = store
            .rename_app(&AppKey::new("default", "a"), &AppKey::new("default", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_changes() {
        let store = MemoryMetaStore::new();
        let rec = record("default", "web");
        let id = rec.id;
        store.create_app(rec).await.unwrap();
        for seq in 1..=3 {
            store
                .put_change(ChangeRecord::begin(id, "web", seq, ChangeMeta::default()))
                .await
                .unwrap();
        }

        assert!(store.delete_app(&AppKey::new("default", "web")).await.unwrap());
        assert!(store.list_changes(id).await.unwrap().is_empty());
        assert!(!store.delete_app(&AppKey::new("default", "web")).await.unwrap());
    }
}
