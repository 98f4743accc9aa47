//! Persisted application metadata.
//!
//! Provides the [`MetaStore`] trait with an in-memory backend and a durable
//! redb backend.

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryMetaStore;
pub use redb_store::RedbMetaStore;
pub use traits::{AppKey, AppRecord, MetaStore};

/// How often a read-modify-write is retried after losing a version race.
const MODIFY_ATTEMPTS: usize = 5;

/// Read-modify-write an application record with optimistic concurrency.
///
/// `f` returns whether it changed the record; unchanged records are not
/// written. Returns `None` if the record does not exist.
pub(crate) async fn modify_app<F>(
    store: &dyn MetaStore,
    key: &AppKey,
    mut f: F,
) -> Result<Option<AppRecord>>
where
    F: FnMut(&mut AppRecord) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut record) = store.get_app(key).await? else {
            return Ok(None);
        };
        if !f(&mut record) {
            return Ok(Some(record));
        }
        match store.update_app(record).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(StoreError::VersionMismatch { .. }) if attempt < MODIFY_ATTEMPTS => continue,
            Err(e) => return Err(e),
        }
    }
}
