//! redb-backed MetaStore.
//!
//! Records are JSON encoded. Applications live in the `apps` table keyed by
//! `namespace/name`; change records live in the `changes` table keyed by
//! `(app id, sequence)` so a range scan yields them in order.

use std::path::Path;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::change::ChangeRecord;

use super::error::{Result, StoreError};
use super::traits::{AppKey, AppRecord, MetaStore};

const TABLE_APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");
const TABLE_CHANGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("changes");

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Durable MetaStore on a single redb file.
pub struct RedbMetaStore {
    db: Database,
}

impl RedbMetaStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = data_dir.as_ref().join("mkapp.redb");
        let db = Database::create(&db_path).map_err(backend)?;

        let txn = db.begin_write().map_err(backend)?;
        txn.open_table(TABLE_APPS).map_err(backend)?;
        txn.open_table(TABLE_CHANGES).map_err(backend)?;
        txn.commit().map_err(backend)?;

        Ok(Self { db })
    }
}

#[async_trait]
impl MetaStore for RedbMetaStore {
    async fn get_app(&self, key: &AppKey) -> Result<Option<AppRecord>> {
        let key = key.to_string();
        let txn = self.db.begin_read().map_err(backend)?;
        let apps = txn.open_table(TABLE_APPS).map_err(backend)?;
        match apps.get(key.as_str()).map_err(backend)? {
            Some(access) => Ok(Some(serde_json::from_slice(access.value())?)),
            None => Ok(None),
        }
    }

    async fn list_apps(&self, namespace: Option<&str>) -> Result<Vec<AppRecord>> {
        let txn = self.db.begin_read().map_err(backend)?;
        let apps = txn.open_table(TABLE_APPS).map_err(backend)?;
        let mut results = Vec::new();
        for item in apps.iter().map_err(backend)? {
            let (_, value) = item.map_err(backend)?;
            let record: AppRecord = serde_json::from_slice(value.value())?;
            if namespace.is_none_or(|ns| record.namespace == ns) {
                results.push(record);
            }
        }
        Ok(results)
    }

    async fn create_app(&self, record: AppRecord) -> Result<bool> {
        let key = record.key().to_string();
        let encoded = serde_json::to_vec(&record)?;

        let txn = self.db.begin_write().map_err(backend)?;
        let existed = {
            let mut apps = txn.open_table(TABLE_APPS).map_err(backend)?;
            let existed = apps.get(key.as_str()).map_err(backend)?.is_some();
            if !existed {
                apps.insert(key.as_str(), encoded.as_slice())
                    .map_err(backend)?;
            }
            existed
        };
        txn.commit().map_err(backend)?;
        Ok(existed)
    }

    async fn update_app(&self, mut record: AppRecord) -> Result<AppRecord> {
        let key = record.key().to_string();

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut apps = txn.open_table(TABLE_APPS).map_err(backend)?;
            let current: AppRecord = match apps.get(key.as_str()).map_err(backend)? {
                Some(access) => serde_json::from_slice(access.value())?,
                None => return Err(StoreError::NotFound(key.clone())),
            };
            if current.version != record.version {
                return Err(StoreError::VersionMismatch {
                    expected: record.version,
                    actual: current.version,
                });
            }
            record.version += 1;
            let encoded = serde_json::to_vec(&record)?;
            apps.insert(key.as_str(), encoded.as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(record)
    }

    async fn rename_app(&self, from: &AppKey, to: &AppKey) -> Result<bool> {
        let from_key = from.to_string();
        let to_key = to.to_string();

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut apps = txn.open_table(TABLE_APPS).map_err(backend)?;
            let mut record: AppRecord = match apps.get(from_key.as_str()).map_err(backend)? {
                Some(access) => serde_json::from_slice(access.value())?,
                None => return Ok(false),
            };
            if apps.get(to_key.as_str()).map_err(backend)?.is_some() {
                return Err(StoreError::Conflict(to_key.clone()));
            }
            record.namespace = to.namespace.clone();
            record.name = to.name.clone();
            record.version += 1;
            let encoded = serde_json::to_vec(&record)?;
            apps.remove(from_key.as_str()).map_err(backend)?;
            apps.insert(to_key.as_str(), encoded.as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(true)
    }

    async fn delete_app(&self, key: &AppKey) -> Result<bool> {
        let key = key.to_string();

        let txn = self.db.begin_write().map_err(backend)?;
        let existed = {
            let mut apps = txn.open_table(TABLE_APPS).map_err(backend)?;
            let removed: Option<AppRecord> = match apps.remove(key.as_str()).map_err(backend)? {
                Some(access) => Some(serde_json::from_slice(access.value())?),
                None => None,
            };
            if let Some(record) = &removed {
                let app_id = record.id.to_string();
                let mut changes = txn.open_table(TABLE_CHANGES).map_err(backend)?;
                let mut seqs = Vec::new();
                for item in changes
                    .range((app_id.as_str(), 0u64)..=(app_id.as_str(), u64::MAX))
                    .map_err(backend)?
                {
                    let (k, _) = item.map_err(backend)?;
                    let (_, seq) = k.value();
                    seqs.push(seq);
                }
                for seq in seqs {
                    changes.remove((app_id.as_str(), seq)).map_err(backend)?;
                }
            }
            removed.is_some()
        };
        txn.commit().map_err(backend)?;
        Ok(existed)
    }

    async fn list_changes(&self, app_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let app_id = app_id.to_string();
        let txn = self.db.begin_read().map_err(backend)?;
        let changes = txn.open_table(TABLE_CHANGES).map_err(backend)?;
        let mut results = Vec::new();
        for item in changes
            .range((app_id.as_str(), 0u64)..=(app_id.as_str(), u64::MAX))
            .map_err(backend)?
        {
            let (_, value) = item.map_err(backend)?;
            results.push(serde_json::from_slice(value.value())?);
        }
        Ok(results)
    }

    async fn put_change(&self, change: ChangeRecord) -> Result<()> {
        let app_id = change.app_id.to_string();
        let encoded = serde_json::to_vec(&change)?;

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut changes = txn.open_table(TABLE_CHANGES).map_err(backend)?;
            changes
                .insert((app_id.as_str(), change.seq), encoded.as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(())
    }

    async fn delete_changes(&self, app_id: Uuid, seqs: &[u64]) -> Result<usize> {
        let app_id = app_id.to_string();

        let txn = self.db.begin_write().map_err(backend)?;
        let mut removed = 0;
        {
            let mut changes = txn.open_table(TABLE_CHANGES).map_err(backend)?;
            for seq in seqs {
                if changes
                    .remove((app_id.as_str(), *seq))
                    .map_err(backend)?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(backend)?;
        Ok(removed)
    }
}
