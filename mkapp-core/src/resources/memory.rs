//! In-process cluster used for local runs and tests.
//!
//! Mirrors the behaviour of a real API client closely enough to exercise the
//! core: listings go through a cached resource-type enumeration, mutations
//! classify failures, and reconciliation state can be scripted per resource.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    GroupKind, IdentifiedResource, LabelSelector, ListOpts, ResourceError, ResourceKey,
    ResourceLister, Result,
};
use crate::orchestrator::plan::{OpKind, PlannedOp};
use crate::orchestrator::{ApplyError, Mutator, ReconcileChecker, ReconcileState};

/// In-memory cluster.
#[derive(Default)]
pub struct MemoryCluster {
    objects: RwLock<BTreeMap<ResourceKey, IdentifiedResource>>,
    /// Resource types seen when the cache was last filled.
    cached_types: RwLock<Option<BTreeSet<GroupKind>>>,
    /// Scripted reconcile states; resources without an entry are ready.
    statuses: RwLock<HashMap<ResourceKey, ReconcileState>>,
    unavailable: RwLock<Option<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an object without going through a plan.
    pub async fn insert(&self, resource: IdentifiedResource) {
        self.objects.write().await.insert(resource.key(), resource);
    }

    pub async fn remove(&self, key: &ResourceKey) -> Option<IdentifiedResource> {
        self.objects.write().await.remove(key)
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<IdentifiedResource> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Script the reconcile state reported for a resource.
    pub async fn set_status(&self, key: ResourceKey, state: ReconcileState) {
        self.statuses.write().await.insert(key, state);
    }

    pub async fn clear_status(&self, key: &ResourceKey) {
        self.statuses.write().await.remove(key);
    }

    /// Make every call fail with an API error until cleared with `None`.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write().await = reason.map(str::to_string);
    }

    async fn check_available(&self) -> Result<()> {
        match self.unavailable.read().await.as_ref() {
            Some(reason) => Err(ResourceError::Api(reason.clone())),
            None => Ok(()),
        }
    }

    async fn resource_types(&self, ignore_cache: bool) -> BTreeSet<GroupKind> {
        if !ignore_cache {
            if let Some(types) = self.cached_types.read().await.as_ref() {
                return types.clone();
            }
        }

        let types: BTreeSet<GroupKind> = self
            .objects
            .read()
            .await
            .values()
            .map(|o| o.group_kind())
            .collect();
        debug!(count = types.len(), "Enumerated resource types");
        *self.cached_types.write().await = Some(types.clone());
        types
    }
}

#[async_trait]
impl ResourceLister for MemoryCluster {
    async fn list(
        &self,
        selector: &LabelSelector,
        resource_types: Option<&[GroupKind]>,
        opts: ListOpts,
    ) -> Result<Vec<IdentifiedResource>> {
        if selector.is_empty() {
            return Err(ResourceError::EmptySelector);
        }
        self.check_available().await?;

        let mut types = self.resource_types(opts.ignore_cached_res_types).await;
        if let Some(scope) = resource_types {
            types.retain(|gk| scope.contains(gk));
        }

        let objects = self.objects.read().await;
        Ok(objects
            .values()
            .filter(|o| types.contains(&o.group_kind()) && selector.matches(&o.labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Mutator for MemoryCluster {
    async fn apply(&self, op: &PlannedOp) -> std::result::Result<bool, ApplyError> {
        if let Some(reason) = self.unavailable.read().await.as_ref() {
            return Err(ApplyError::Retryable(format!("api unavailable: {}", reason)));
        }

        let key = op.resource.key();
        let mut objects = self.objects.write().await;
        match op.kind {
            OpKind::Create => {
                if objects.contains_key(&key) {
                    return Err(ApplyError::Fatal(format!(
                        "{} already exists",
                        op.resource.description()
                    )));
                }
                objects.insert(key, op.resource.clone());
                Ok(true)
            }
            OpKind::Update => match objects.get_mut(&key) {
                Some(existing) => {
                    let changed = *existing != op.resource;
                    *existing = op.resource.clone();
                    Ok(changed)
                }
                None => Err(ApplyError::Fatal(format!(
                    "{} not found",
                    op.resource.description()
                ))),
            },
            OpKind::Delete => Ok(objects.remove(&key).is_some()),
            OpKind::Exists => {
                if objects.contains_key(&key) {
                    Ok(false)
                } else {
                    Err(ApplyError::Retryable(
                        "External resource doesn't exists".to_string(),
                    ))
                }
            }
            OpKind::Noop => Ok(false),
        }
    }
}

#[async_trait]
impl ReconcileChecker for MemoryCluster {
    async fn status(&self, op: &PlannedOp) -> Result<ReconcileState> {
        self.check_available().await?;

        let key = op.resource.key();
        let present = self.objects.read().await.contains_key(&key);
        if op.kind == OpKind::Delete {
            return Ok(if present {
                ReconcileState::Pending("waiting for deletion".to_string())
            } else {
                ReconcileState::Ready
            });
        }
        if !present {
            return Ok(ReconcileState::Pending("resource not found".to_string()));
        }
        Ok(self
            .statuses
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or(ReconcileState::Ready))
    }
}
