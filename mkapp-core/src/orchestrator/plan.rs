//! Plans produced by the diff/ordering collaborator.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::IdentifiedResource;

/// What to do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Noop,
    /// Wait for a resource owned by someone else to exist.
    Exists,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Noop => "noop",
            OpKind::Exists => "exists",
        };
        write!(f, "{}", s)
    }
}

/// One planned operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    pub kind: OpKind,
    pub resource: IdentifiedResource,
    /// Indices of earlier operations that must reconcile first.
    pub depends_on: Vec<usize>,
}

impl PlannedOp {
    pub fn new(kind: OpKind, resource: IdentifiedResource) -> Self {
        Self {
            kind,
            resource,
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, index: usize) -> Self {
        if !self.depends_on.contains(&index) {
            self.depends_on.push(index);
        }
        self
    }

    /// e.g. `create configmap/kapp-config (v1) namespace: external`
    pub fn description(&self) -> String {
        format!("{} {}", self.kind, self.resource.description())
    }
}

/// Errors from planning.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("operation {op} depends on operation {depends_on}, which does not precede it")]
    InvalidDependency { op: usize, depends_on: usize },

    #[error("{0}")]
    Failed(String),
}

/// Operation counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub noop: usize,
    pub exists: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} create, {} delete, {} update, {} noop, {} exists",
            self.create, self.delete, self.update, self.noop, self.exists
        )
    }
}

/// An ordered list of operations with backward-pointing dependency edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    ops: Vec<PlannedOp>,
}

impl Plan {
    /// Build a plan, rejecting dependencies that do not point to an earlier
    /// operation (which also rules out cycles).
    pub fn new(ops: Vec<PlannedOp>) -> Result<Self, PlanError> {
        for (i, op) in ops.iter().enumerate() {
            if let Some(&dep) = op.depends_on.iter().find(|&&d| d >= i) {
                return Err(PlanError::InvalidDependency {
                    op: i,
                    depends_on: dep,
                });
            }
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[PlannedOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.ops {
            match op.kind {
                OpKind::Create => summary.create += 1,
                OpKind::Update => summary.update += 1,
                OpKind::Delete => summary.delete += 1,
                OpKind::Noop => summary.noop += 1,
                OpKind::Exists => summary.exists += 1,
            }
        }
        summary
    }

    /// Namespaces touched by the plan; cluster-scoped resources count as
    /// `(cluster)`.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.ops
            .iter()
            .map(|op| match &op.resource.namespace {
                Some(ns) if !ns.is_empty() => ns.clone(),
                _ => "(cluster)".to_string(),
            })
            .collect()
    }
}

/// Decides which operations bring the live state to the desired state.
///
/// Must be deterministic: planning the same inputs twice yields the same plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        desired: &[IdentifiedResource],
        live: &[IdentifiedResource],
    ) -> Result<Plan, PlanError>;
}
