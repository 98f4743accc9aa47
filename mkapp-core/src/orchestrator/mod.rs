//! Apply/wait orchestration.
//!
//! A deploy resolves the application's selector, lists live resources, asks
//! the [`Planner`] for operations, opens one change and runs the plan in
//! waves: every operation whose dependencies reconciled is applied (with
//! retries on retryable errors), then waited on until reconciled. Operations
//! depending on one that did not reconcile are skipped. The change is always
//! finalized before returning from a run.

pub mod plan;
pub mod report;
pub mod retry;
pub mod wait;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

pub use plan::{OpKind, Plan, PlanError, PlanSummary, PlannedOp, Planner};
pub use report::{ApplyReport, OpOutcome, OpReport};
pub use retry::RetryPolicy;
pub use wait::WaitPolicy;

use crate::app::App;
use crate::change::{Change, ChangeMeta, ChangeOutcome, ChangeSummary};
use crate::config::OrchestratorConfig;
use crate::error::{AppError, Result};
use crate::history::accept_all;
use crate::resources::{
    self, GroupKind, GroupVersion, IdentifiedResource, LabelSelector, ListOpts, Requirement,
    ResourceLister,
};
use wait::{WaitOutcome, is_cancelled, sleep_or_cancel, wait_for};

/// Mutation failure, classified by the mutator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApplyError {
    /// Transient; the operation may succeed if tried again.
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Retryable(_))
    }
}

/// Performs one planned operation against the cluster.
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Returns whether the cluster actually changed.
    async fn apply(&self, op: &PlannedOp) -> std::result::Result<bool, ApplyError>;
}

/// Reconciliation state of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    Ready,
    Pending(String),
    Failed(String),
}

/// Reports whether the resource touched by an operation has reconciled.
#[async_trait]
pub trait ReconcileChecker: Send + Sync {
    async fn status(&self, op: &PlannedOp) -> resources::Result<ReconcileState>;
}

/// Store writes attempted when finalizing a change.
const FINALIZE_ATTEMPTS: u32 = 3;

enum ApplyResult {
    Applied { changed: bool },
    Failed(String),
    Cancelled,
}

struct Applied {
    attempts: u32,
    result: ApplyResult,
}

/// Drives plans against the cluster and records them as changes.
pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    mutator: Arc<dyn Mutator>,
    checker: Arc<dyn ReconcileChecker>,
    lister: Arc<dyn ResourceLister>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<dyn Planner>,
        mutator: Arc<dyn Mutator>,
        checker: Arc<dyn ReconcileChecker>,
        lister: Arc<dyn ResourceLister>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            mutator,
            checker,
            lister,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Bring the application's resources to `desired`.
    ///
    /// Desired resources are labeled with the application's selector before
    /// planning. Selector, listing and planning failures as well as a change
    /// already in progress abort before the cluster is touched. Failures of
    /// individual operations are reported in the returned [`ApplyReport`].
    pub async fn deploy(
        &self,
        app: &dyn App,
        desired: &[IdentifiedResource],
        labels: &BTreeMap<String, String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<ApplyReport> {
        app.create_or_update(labels).await?;

        let selector = app.label_selector().await?;
        let desired = with_app_labels(&selector, desired);
        let live = self.list_live(&selector).await?;
        let plan = self.planner.plan(&desired, &live).await?;
        info!(app = %app.description(), ops = plan.len(), "Planned: {}", plan.summary());

        let gvs: Vec<GroupVersion> = desired.iter().map(|r| r.group_version()).collect();
        let gks: Vec<GroupKind> = desired.iter().map(|r| r.group_kind()).collect();
        app.update_used_gvs_and_gks(&gvs, &gks).await?;

        let mut report = self.run_change(app, &plan, "update", cancel).await?;

        if let Some(keep) = self.config.changes_to_keep {
            match app.gc_changes(keep, &accept_all).await {
                Ok(gc) => report.gc = Some(gc),
                Err(e) => {
                    warn!(app = %report.app, error = %e, "Failed to delete old changes");
                    report.gc_error = Some(e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Delete every live resource of the application, then the application
    /// itself once nothing labeled with its selector remains.
    pub async fn delete(&self, app: &dyn App, cancel: watch::Receiver<bool>) -> Result<ApplyReport> {
        if !app.exists().await? {
            return Err(AppError::NotFound(app.description()));
        }

        let selector = app.label_selector().await?;
        let live = self.list_live(&selector).await?;
        let plan = self.planner.plan(&[], &live).await?;
        info!(app = %app.description(), ops = plan.len(), "Planned: {}", plan.summary());

        let mut report = self.run_change(app, &plan, "delete", cancel).await?;
        if report.succeeded() {
            app.delete().await?;
            report.app_deleted = true;
        }
        Ok(report)
    }

    /// Plans are made against a fresh type enumeration: with a stale one,
    /// deployed resources of new kinds would look absent.
    async fn list_live(&self, selector: &LabelSelector) -> Result<Vec<IdentifiedResource>> {
        let opts = ListOpts {
            ignore_cached_res_types: true,
        };
        self.lister
            .list(selector, None, opts)
            .await
            .map_err(AppError::Listing)
    }

    async fn run_change(
        &self,
        app: &dyn App,
        plan: &Plan,
        verb: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<ApplyReport> {
        let app_desc = app.description();
        let meta = ChangeMeta {
            description: format!("{}: Op: {}", verb, plan.summary()),
            namespaces: plan.namespaces(),
        };
        let mut change = app.begin_change(meta).await?;
        if !change.name().is_empty() {
            info!(app = %app_desc, change = %change.name(), "Started change");
        }

        let ops = self.run_plan(&app_desc, plan, cancel).await;
        let summary = report::summarize(&ops);
        let cancelled = ops.iter().any(|op| op.outcome == OpOutcome::Cancelled);

        let outcome = if ops.iter().all(|op| op.outcome.is_success()) {
            ChangeOutcome::Succeeded
        } else {
            ChangeOutcome::Failed
        };
        let failed = summary.failed.len();
        let skipped = summary.skipped.len();
        let finalize_error = self
            .finalize(&app_desc, change.as_mut(), outcome, summary)
            .await
            .err()
            .map(|e| e.to_string());
        match outcome {
            ChangeOutcome::Succeeded => {
                info!(app = %app_desc, change = %change.name(), ops = ops.len(), "Succeeded")
            }
            _ => {
                warn!(app = %app_desc, change = %change.name(), failed, skipped, cancelled, "Change failed")
            }
        }

        Ok(ApplyReport {
            app: app_desc,
            change: change.name().to_string(),
            outcome,
            cancelled,
            ops,
            gc: None,
            gc_error: None,
            finalize_error,
            app_deleted: false,
        })
    }

    /// Write the final outcome of a change, retrying store failures.
    ///
    /// The cluster has already been changed at this point, so a failure is
    /// reported alongside the operation breakdown instead of replacing it.
    async fn finalize(
        &self,
        app: &str,
        change: &mut dyn Change,
        outcome: ChangeOutcome,
        summary: ChangeSummary,
    ) -> Result<()> {
        let policy = &self.config.apply_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match outcome {
                ChangeOutcome::Succeeded => change.succeed(summary.clone()).await,
                _ => change.fail(summary.clone()).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(app = %app, change = %change.name(), attempt, error = %e, "Failed to finalize change, retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                Err(e) => {
                    warn!(app = %app, change = %change.name(), attempts = attempt, error = %e, "Giving up finalizing change");
                    return Err(e);
                }
            }
        }
    }

    async fn run_plan(&self, app: &str, plan: &Plan, cancel: watch::Receiver<bool>) -> Vec<OpReport> {
        let ops = plan.ops();
        let total = ops.len();
        // Outcomes default to cancelled until an operation settles.
        let mut reports: Vec<OpReport> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| OpReport::pending(i, op.kind, op.description()))
            .collect();
        let mut settled = vec![false; total];

        loop {
            // Edges point backwards, so one pass in plan order blocks
            // transitive dependents too.
            for i in 0..total {
                if settled[i] {
                    continue;
                }
                let failed_dep = ops[i]
                    .depends_on
                    .iter()
                    .copied()
                    .find(|&d| settled[d] && !reports[d].outcome.is_success());
                if let Some(dependency) = failed_dep {
                    debug!(app = %app, op = %reports[i].description, dependency, "Blocked");
                    reports[i].outcome = OpOutcome::Blocked { dependency };
                    settled[i] = true;
                }
            }

            let wave: Vec<usize> = (0..total)
                .filter(|&i| !settled[i] && ops[i].depends_on.iter().all(|&d| settled[d]))
                .collect();
            if wave.is_empty() {
                break;
            }
            if is_cancelled(&cancel) {
                warn!(app = %app, remaining = settled.iter().filter(|s| !**s).count(), "Cancelled, not starting remaining operations");
                break;
            }

            let done = settled.iter().filter(|s| **s).count();
            self.run_wave(app, ops, &wave, done, &mut reports, &cancel)
                .await;
            for i in wave {
                settled[i] = true;
            }
        }

        reports
    }

    async fn run_wave(
        &self,
        app: &str,
        ops: &[PlannedOp],
        wave: &[usize],
        done: usize,
        reports: &mut [OpReport],
        cancel: &watch::Receiver<bool>,
    ) {
        let total = ops.len();
        let (noops, to_apply): (Vec<usize>, Vec<usize>) = wave
            .iter()
            .copied()
            .partition(|&i| ops[i].kind == OpKind::Noop);
        for i in noops {
            reports[i].outcome = OpOutcome::Noop;
        }
        if to_apply.is_empty() {
            return;
        }

        info!(app = %app, "---- applying {} changes [{}/{} done] ----", to_apply.len(), done, total);
        let semaphore = Semaphore::new(self.config.apply_concurrency.max(1));
        let applied = join_all(to_apply.iter().map(|&i| {
            let semaphore = &semaphore;
            let op = &ops[i];
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                (i, self.apply_with_retry(app, op, cancel).await)
            }
        }))
        .await;

        let mut to_wait = Vec::new();
        for (i, applied) in applied {
            reports[i].attempts = applied.attempts;
            match applied.result {
                ApplyResult::Applied { changed } => {
                    reports[i].changed = changed;
                    to_wait.push(i);
                }
                ApplyResult::Failed(e) => reports[i].outcome = OpOutcome::ApplyFailed(e),
                ApplyResult::Cancelled => reports[i].outcome = OpOutcome::Cancelled,
            }
        }
        if to_wait.is_empty() {
            return;
        }

        info!(app = %app, "---- waiting on {} changes [{}/{} done] ----", to_wait.len(), done, total);
        let semaphore = Semaphore::new(self.config.wait_concurrency.max(1));
        let waited = join_all(to_wait.iter().map(|&i| {
            let semaphore = &semaphore;
            let op = &ops[i];
            let mut cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                let outcome = wait_for(self.checker.as_ref(), op, &self.config.wait, &mut cancel).await;
                (i, outcome)
            }
        }))
        .await;

        let timeout = self.config.wait.timeout;
        for (i, outcome) in waited {
            let description = reports[i].description.clone();
            reports[i].outcome = match outcome {
                WaitOutcome::Ready => {
                    info!(app = %app, "ok: reconcile {}", ops[i].resource.description());
                    OpOutcome::Reconciled
                }
                WaitOutcome::Failed(reason) => {
                    warn!(app = %app, op = %description, reason = %reason, "Reconcile failed");
                    OpOutcome::ReconcileFailed(reason)
                }
                WaitOutcome::TimedOut(last) => {
                    warn!(app = %app, op = %description, timeout_secs = timeout.as_secs(), "Timed out waiting for reconcile");
                    OpOutcome::TimedOut(match last {
                        Some(reason) => format!("after {:?}: {}", timeout, reason),
                        None => format!("after {:?}", timeout),
                    })
                }
                WaitOutcome::Cancelled => OpOutcome::Cancelled,
            };
        }
    }

    async fn apply_with_retry(
        &self,
        app: &str,
        op: &PlannedOp,
        mut cancel: watch::Receiver<bool>,
    ) -> Applied {
        let policy = &self.config.apply_retry;
        let description = op.description();
        let mut attempts = 0;

        loop {
            if is_cancelled(&cancel) {
                return Applied {
                    attempts,
                    result: ApplyResult::Cancelled,
                };
            }
            attempts += 1;

            match self.mutator.apply(op).await {
                Ok(changed) => {
                    info!(app = %app, attempts, "ok: {}", description);
                    return Applied {
                        attempts,
                        result: ApplyResult::Applied { changed },
                    };
                }
                Err(ApplyError::Fatal(e)) => {
                    warn!(app = %app, op = %description, error = %e, "Apply failed");
                    return Applied {
                        attempts,
                        result: ApplyResult::Failed(e),
                    };
                }
                Err(ApplyError::Retryable(e)) => {
                    if !policy.should_retry(attempts) {
                        warn!(app = %app, op = %description, attempts, error = %e, "Retries exhausted");
                        return Applied {
                            attempts,
                            result: ApplyResult::Failed(format!(
                                "{} (gave up after {} attempts)",
                                e, attempts
                            )),
                        };
                    }
                    let delay = policy.delay_for(attempts);
                    info!(
                        app = %app,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying {}",
                        description
                    );
                    if sleep_or_cancel(delay, &mut cancel).await {
                        return Applied {
                            attempts,
                            result: ApplyResult::Cancelled,
                        };
                    }
                }
            }
        }
    }
}

/// Copy `desired`, adding the selector's `key=value` requirements as labels.
fn with_app_labels(selector: &LabelSelector, desired: &[IdentifiedResource]) -> Vec<IdentifiedResource> {
    desired
        .iter()
        .cloned()
        .map(|mut resource| {
            for requirement in selector.requirements() {
                if let Requirement::Equals { key, value } = requirement {
                    resource.labels.insert(key.clone(), value.clone());
                }
            }
            resource
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_labels_stamped() {
        let selector = LabelSelector::new()
            .with_equals("mkapp.dev/app", "abc")
            .with_exists("tier");
        let desired = vec![
            IdentifiedResource::new("v1", "ConfigMap", Some("default"), "cfg").with_label("x", "y"),
        ];

        let labeled = with_app_labels(&selector, &desired);
        assert_eq!(labeled[0].labels.get("mkapp.dev/app").map(String::as_str), Some("abc"));
        assert_eq!(labeled[0].labels.get("x").map(String::as_str), Some("y"));
        assert!(!labeled[0].labels.contains_key("tier"));
        assert!(desired[0].labels.get("mkapp.dev/app").is_none());
    }

    #[test]
    fn test_apply_error_classification() {
        assert!(ApplyError::Retryable("conflict".to_string()).is_retryable());
        assert!(!ApplyError::Fatal("invalid".to_string()).is_retryable());
        assert_eq!(ApplyError::Fatal("invalid".to_string()).to_string(), "invalid");
    }
}
