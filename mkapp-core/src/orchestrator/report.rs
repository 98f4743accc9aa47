//! Per-invocation reports.

use std::fmt;

use crate::change::{ChangeOutcome, ChangeSummary};
use crate::history::GcReport;

use super::plan::OpKind;

/// What happened to one planned operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    /// Applied and reconciled.
    Reconciled,
    /// Nothing to do; neither applied nor waited on.
    Noop,
    ApplyFailed(String),
    ReconcileFailed(String),
    TimedOut(String),
    /// Not started because operation `dependency` did not reconcile.
    Blocked { dependency: usize },
    /// Not finished because the invocation was cancelled.
    Cancelled,
}

impl OpOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OpOutcome::Reconciled | OpOutcome::Noop)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OpOutcome::ApplyFailed(_) | OpOutcome::ReconcileFailed(_) | OpOutcome::TimedOut(_)
        )
    }
}

impl fmt::Display for OpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpOutcome::Reconciled => write!(f, "reconciled"),
            OpOutcome::Noop => write!(f, "noop"),
            OpOutcome::ApplyFailed(e) => write!(f, "apply failed: {}", e),
            OpOutcome::ReconcileFailed(e) => write!(f, "reconcile failed: {}", e),
            OpOutcome::TimedOut(e) => write!(f, "timed out: {}", e),
            OpOutcome::Blocked { dependency } => write!(f, "blocked by operation {}", dependency),
            OpOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Report for one planned operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReport {
    /// Position in the plan.
    pub index: usize,
    pub kind: OpKind,
    pub description: String,
    /// Mutator calls made, including the successful one.
    pub attempts: u32,
    /// Whether the mutator reported an actual change.
    pub changed: bool,
    pub outcome: OpOutcome,
}

impl OpReport {
    pub(crate) fn pending(index: usize, kind: OpKind, description: String) -> Self {
        Self {
            index,
            kind,
            description,
            attempts: 0,
            changed: false,
            outcome: OpOutcome::Cancelled,
        }
    }
}

/// Report for one deploy or delete invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub app: String,
    /// Name of the recorded change; empty for applications without history.
    pub change: String,
    pub outcome: ChangeOutcome,
    pub cancelled: bool,
    pub ops: Vec<OpReport>,
    /// Set when history retention ran.
    pub gc: Option<GcReport>,
    /// Set when history retention failed; the change outcome stands.
    pub gc_error: Option<String>,
    /// Set when the change record could not be finalized. The record stays
    /// in progress until `fail_stale_change` recovers it.
    pub finalize_error: Option<String>,
    /// Whether a delete invocation removed the application itself.
    pub app_deleted: bool,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ChangeOutcome::Succeeded && self.finalize_error.is_none()
    }

    pub fn op(&self, index: usize) -> Option<&OpReport> {
        self.ops.get(index)
    }

    pub fn failed(&self) -> impl Iterator<Item = &OpReport> {
        self.ops.iter().filter(|op| op.outcome.is_failure())
    }

    pub fn summary(&self) -> ChangeSummary {
        summarize(&self.ops)
    }
}

/// Breakdown persisted with the change record. Noops are left out.
pub(crate) fn summarize(ops: &[OpReport]) -> ChangeSummary {
    let mut summary = ChangeSummary::default();
    for op in ops {
        match &op.outcome {
            OpOutcome::Reconciled => summary.completed.push(op.description.clone()),
            OpOutcome::Noop => {}
            OpOutcome::Blocked { .. } | OpOutcome::Cancelled => summary
                .skipped
                .push(format!("{}: {}", op.description, op.outcome)),
            _ => summary
                .failed
                .push(format!("{}: {}", op.description, op.outcome)),
        }
    }
    summary
}
