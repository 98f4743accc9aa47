//! Test helpers for mkapp-core integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mkapp_core::store::MetaStore;
use mkapp_core::{
    AppAuditLogger, ApplyError, Apps, IdentifiedResource, MemoryCluster, MemoryMetaStore, Mutator,
    OpKind, Orchestrator, OrchestratorConfig, Plan, PlanError, PlannedOp, Planner, ResourceKey,
    RetryPolicy, WaitPolicy,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config_map(namespace: &str, name: &str) -> IdentifiedResource {
    IdentifiedResource::new("v1", "ConfigMap", Some(namespace), name)
}

pub fn namespace(name: &str) -> IdentifiedResource {
    IdentifiedResource::new("v1", "Namespace", None, name)
}

pub fn deployment(namespace: &str, name: &str) -> IdentifiedResource {
    IdentifiedResource::new("apps/v1", "Deployment", Some(namespace), name)
}

/// Short budgets so failure paths finish quickly.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        apply_retry: RetryPolicy::immediate(3),
        wait: WaitPolicy {
            timeout: Duration::from_secs(2),
            check_interval: Duration::from_millis(5),
        },
        ..OrchestratorConfig::default()
    }
}

/// Cancellation receiver nobody will ever signal.
pub fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

pub fn no_labels() -> BTreeMap<String, String> {
    BTreeMap::new()
}

pub struct Harness {
    pub store: Arc<dyn MetaStore>,
    pub cluster: Arc<MemoryCluster>,
    pub apps: Apps,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryMetaStore::new()))
    }

    pub fn with_store(store: Arc<dyn MetaStore>) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let apps = Apps::new(store.clone(), cluster.clone(), AppAuditLogger::new_noop());
        Self {
            store,
            cluster,
            apps,
        }
    }

    /// Orchestrator using the in-memory cluster for everything but planning
    /// and mutation.
    pub fn orchestrator(
        &self,
        planner: Arc<dyn Planner>,
        mutator: Arc<dyn Mutator>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            planner,
            mutator,
            self.cluster.clone(),
            self.cluster.clone(),
            config,
        )
    }

    pub fn default_orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
        self.orchestrator(Arc::new(DiffPlanner), self.cluster.clone(), config)
    }
}

/// Creates what is missing, updates what differs, deletes what is no longer
/// desired. Namespaces go first and their contents depend on them.
pub struct DiffPlanner;

#[async_trait]
impl Planner for DiffPlanner {
    async fn plan(
        &self,
        desired: &[IdentifiedResource],
        live: &[IdentifiedResource],
    ) -> Result<Plan, PlanError> {
        let live_by_key: BTreeMap<ResourceKey, &IdentifiedResource> =
            live.iter().map(|r| (r.key(), r)).collect();
        let desired_keys: BTreeSet<ResourceKey> = desired.iter().map(|r| r.key()).collect();

        let (namespaces, others): (Vec<&IdentifiedResource>, Vec<&IdentifiedResource>) =
            desired.iter().partition(|r| r.kind == "Namespace");

        let mut ops = Vec::new();
        let mut namespace_ops: HashMap<String, usize> = HashMap::new();
        for resource in namespaces.into_iter().chain(others) {
            let kind = match live_by_key.get(&resource.key()) {
                None => OpKind::Create,
                Some(existing) if *existing == resource => OpKind::Noop,
                Some(_) => OpKind::Update,
            };
            let mut op = PlannedOp::new(kind, resource.clone());
            if let Some(ns) = &resource.namespace {
                if let Some(&idx) = namespace_ops.get(ns) {
                    op = op.after(idx);
                }
            }
            if resource.kind == "Namespace" {
                namespace_ops.insert(resource.name.clone(), ops.len());
            }
            ops.push(op);
        }

        for resource in live {
            if !desired_keys.contains(&resource.key()) {
                ops.push(PlannedOp::new(OpKind::Delete, resource.clone()));
            }
        }

        Plan::new(ops)
    }
}

/// Returns the same plan regardless of input.
pub struct ScriptedPlanner(pub Plan);

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _desired: &[IdentifiedResource],
        _live: &[IdentifiedResource],
    ) -> Result<Plan, PlanError> {
        Ok(self.0.clone())
    }
}

pub struct FailingPlanner;

#[async_trait]
impl Planner for FailingPlanner {
    async fn plan(
        &self,
        _desired: &[IdentifiedResource],
        _live: &[IdentifiedResource],
    ) -> Result<Plan, PlanError> {
        Err(PlanError::Failed("ambiguous resource ownership".to_string()))
    }
}

/// Delegates to the cluster after replaying scripted errors per resource name.
/// When `external_owner` is set, the resource of an `exists` operation is
/// created by "someone else" right after the first miss.
pub struct ScriptedMutator {
    cluster: Arc<MemoryCluster>,
    script: Mutex<HashMap<String, VecDeque<ApplyError>>>,
    calls: Mutex<HashMap<String, u32>>,
    external_owner: bool,
}

impl ScriptedMutator {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self {
            cluster,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            external_owner: false,
        }
    }

    pub fn with_external_owner(mut self) -> Self {
        self.external_owner = true;
        self
    }

    pub fn fail(self, name: &str, errors: Vec<ApplyError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(name.to_string(), errors.into());
        self
    }

    pub fn calls(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Mutator for ScriptedMutator {
    async fn apply(&self, op: &PlannedOp) -> Result<bool, ApplyError> {
        let name = op.resource.name.clone();
        *self.calls.lock().unwrap().entry(name.clone()).or_insert(0) += 1;

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|errors| errors.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let result = self.cluster.apply(op).await;
        if self.external_owner && op.kind == OpKind::Exists && result.is_err() {
            self.cluster.insert(op.resource.clone()).await;
        }
        result
    }
}
