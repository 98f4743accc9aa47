//! Cluster resources as seen by the application core.
//!
//! The core never talks to an API server directly. It consumes the
//! [`ResourceLister`] contract to find live resources that claim membership
//! in an application.

pub mod memory;
pub mod selector;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryCluster;
pub use selector::{LabelSelector, Requirement};

/// Errors returned by cluster-facing collaborators.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// Listing with an empty selector would match every resource.
    #[error("refusing to list resources with an empty label selector")]
    EmptySelector,

    #[error("invalid label selector: '{0}'")]
    InvalidSelector(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or API server failure.
    #[error("api: {0}")]
    Api(String),
}

/// Result type for resource operations.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// API group and version, e.g. `apps/v1` or core `v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }

    /// Parse an `apiVersion` string.
    pub fn parse(api_version: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version),
            None => Self::new("", api_version),
        }
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

/// API group and kind, independent of version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Unique address of a resource in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group_kind: GroupKind,
    pub namespace: String,
    pub name: String,
}

/// A live (or desired) cluster object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedResource {
    pub api_version: String,
    pub kind: String,
    /// `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl IdentifiedResource {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
            labels: BTreeMap::new(),
            body: serde_json::Value::Null,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::parse(&self.api_version)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group_version().group, self.kind.clone())
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            group_kind: self.group_kind(),
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
        }
    }

    /// Human readable identity used in diagnostics, e.g.
    /// `configmap/kapp-config (v1) namespace: external`.
    pub fn description(&self) -> String {
        let scope = match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("namespace: {}", ns),
            _ => "cluster".to_string(),
        };
        format!(
            "{}/{} ({}) {}",
            self.kind.to_lowercase(),
            self.name,
            self.api_version,
            scope
        )
    }
}

/// Options for [`ResourceLister::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOpts {
    /// Re-enumerate resource types instead of trusting a cached enumeration.
    pub ignore_cached_res_types: bool,
}

/// Lists live resources matching a selector.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    /// List resources matching `selector`, optionally restricted to `resource_types`.
    ///
    /// Implementations must reject an empty selector with
    /// [`ResourceError::EmptySelector`].
    async fn list(
        &self,
        selector: &LabelSelector,
        resource_types: Option<&[GroupKind]>,
        opts: ListOpts,
    ) -> Result<Vec<IdentifiedResource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_namespaced() {
        let res = IdentifiedResource::new("v1", "ConfigMap", Some("external"), "kapp-config");
        assert_eq!(
            res.description(),
            "configmap/kapp-config (v1) namespace: external"
        );
    }

    #[test]
    fn test_description_cluster_scoped() {
        let res = IdentifiedResource::new("v1", "Namespace", None, "external");
        assert_eq!(res.description(), "namespace/external (v1) cluster");
    }

    #[test]
    fn test_group_version_parsing() {
        assert_eq!(GroupVersion::parse("v1"), GroupVersion::new("", "v1"));
        assert_eq!(
            GroupVersion::parse("apps/v1"),
            GroupVersion::new("apps", "v1")
        );
        assert_eq!(GroupVersion::parse("apps/v1").to_string(), "apps/v1");

        let res = IdentifiedResource::new("apps/v1", "Deployment", Some("default"), "web");
        assert_eq!(res.group_kind(), GroupKind::new("apps", "Deployment"));
        assert_eq!(res.group_kind().to_string(), "Deployment.apps");
    }
}
