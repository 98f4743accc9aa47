//! Resolving application references to [`App`] implementations.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::app::{App, LabeledApp, RecordedApp};
use crate::audit::AppAuditLogger;
use crate::error::{AppError, Result};
use crate::resources::{LabelSelector, ResourceError, ResourceLister};
use crate::store::{AppKey, MetaStore};

const LABEL_PREFIX: &str = "label:";

/// How a user refers to an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRef {
    /// `label:<selector>`
    Labeled(LabelSelector),
    /// Name of a persisted application.
    Recorded(String),
}

impl AppRef {
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl FromStr for AppRef {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(raw) = s.strip_prefix(LABEL_PREFIX) {
            let selector: LabelSelector = raw.parse().map_err(AppError::Selector)?;
            if selector.is_empty() {
                return Err(AppError::Selector(ResourceError::EmptySelector));
            }
            return Ok(AppRef::Labeled(selector));
        }
        if s.is_empty() {
            return Err(AppError::NotFound("App ''".to_string()));
        }
        Ok(AppRef::Recorded(s.to_string()))
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppRef::Labeled(selector) => write!(f, "{}{}", LABEL_PREFIX, selector),
            AppRef::Recorded(name) => write!(f, "{}", name),
        }
    }
}

/// Directory of applications sharing one store and one cluster.
pub struct Apps {
    store: Arc<dyn MetaStore>,
    lister: Arc<dyn ResourceLister>,
    audit: AppAuditLogger,
}

impl Apps {
    pub fn new(
        store: Arc<dyn MetaStore>,
        lister: Arc<dyn ResourceLister>,
        audit: AppAuditLogger,
    ) -> Self {
        Self {
            store,
            lister,
            audit,
        }
    }

    /// Resolve a reference. Recorded apps are looked up in `namespace`.
    pub fn find(&self, app_ref: &AppRef, namespace: &str) -> Box<dyn App> {
        match app_ref {
            AppRef::Labeled(selector) => Box::new(LabeledApp::new(
                selector.clone(),
                Arc::clone(&self.lister),
            )),
            AppRef::Recorded(name) => Box::new(self.recorded(AppKey::new(namespace, name))),
        }
    }

    pub fn recorded(&self, key: AppKey) -> RecordedApp {
        RecordedApp::new(
            key,
            Arc::clone(&self.store),
            Arc::clone(&self.lister),
            self.audit.clone(),
        )
    }

    /// Persisted applications, optionally limited to one namespace.
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<RecordedApp>> {
        let records = self.store.list_apps(namespace).await?;
        Ok(records
            .into_iter()
            .map(|record| self.recorded(record.key()))
            .collect())
    }
}
