//! mkapp core library
//!
//! Change-tracked applications over a cluster of labeled resources: application
//! identity (label-selected or persisted), durable change history with
//! bounded retention, and the apply/wait orchestrator that turns a plan into
//! retried mutations and reconciliation waits.
//!
//! # Example
//! ```ignore
//! use mkapp_core::{Apps, AppRef, Orchestrator, OrchestratorConfig};
//!
//! let apps = Apps::new(store, cluster.clone(), AppAuditLogger::new());
//! let app = apps.find(&AppRef::parse("web")?, "default");
//! let orchestrator = Orchestrator::new(planner, cluster.clone(), cluster.clone(), cluster, OrchestratorConfig::default());
//! let report = orchestrator.deploy(app.as_ref(), &desired, &labels, shutdown_rx).await?;
//! ```

pub mod app;
pub mod apps;
pub mod audit;
pub mod change;
pub mod config;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod resources;
pub mod store;

pub use app::{APP_LABEL_KEY, App, LabeledApp, Meta, RecordedApp};
pub use apps::{AppRef, Apps};
pub use audit::AppAuditLogger;
pub use change::{Change, ChangeMeta, ChangeOutcome, ChangeRecord, ChangeSummary};
pub use config::{AppChangesFlags, ApplyFlags, OrchestratorConfig, WaitFlags};
pub use error::{AppError, Result};
pub use history::{ChangeHistory, GcReport, GcReview, accept_all};
pub use orchestrator::{
    ApplyError, ApplyReport, Mutator, OpKind, OpOutcome, OpReport, Orchestrator, Plan, PlanError,
    PlannedOp, Planner, ReconcileChecker, ReconcileState, RetryPolicy, WaitPolicy,
};
pub use resources::{
    GroupKind, GroupVersion, IdentifiedResource, LabelSelector, ListOpts, MemoryCluster,
    ResourceError, ResourceKey, ResourceLister,
};
pub use store::{AppKey, AppRecord, MemoryMetaStore, MetaStore, RedbMetaStore, StoreError};
