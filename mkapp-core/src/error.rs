//! Application-level error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::orchestrator::plan::PlanError;
use crate::resources::ResourceError;
use crate::store::StoreError;

/// Errors returned by applications, their change history and deploy runs.
#[derive(Debug, Error)]
pub enum AppError {
    /// The application's label selector could not be resolved.
    #[error("Resolving label selector: {0}")]
    Selector(#[source] ResourceError),

    /// Listing live resources while planning failed.
    #[error("Listing app resources: {0}")]
    Listing(#[source] ResourceError),

    /// Listing live resources while verifying deletion failed.
    #[error("Relisting app resources: {0}")]
    Relisting(#[source] ResourceError),

    /// Live resources still claim membership in the application.
    #[error("Expected all resources to be gone, but found: {}", .survivors.join(", "))]
    ResourcesRemain { survivors: Vec<String> },

    #[error("{operation} is not supported for {app}")]
    Unsupported {
        operation: &'static str,
        app: String,
    },

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A previous change still holds the application's change lease.
    #[error(
        "Change '{change}' of {app} started at {started_at} is still in progress; \
         if no other deploy is running, mark it as failed before starting a new one"
    )]
    ChangeInProgress {
        app: String,
        change: String,
        started_at: DateTime<Utc>,
    },

    /// Another writer took the change lease between our read and write.
    #[error("Another change was started concurrently for {app}")]
    ConcurrentChange { app: String },

    #[error("Change '{0}' is already finalized")]
    ChangeFinalized(String),

    /// Change GC stopped early; the counts reflect the store after the failure.
    #[error("Deleting old changes: deleted {deleted}, {surviving} remaining: {source}")]
    GcIncomplete {
        deleted: usize,
        surviving: usize,
        source: Box<AppError>,
    },

    /// The caller rejected a proposed action.
    #[error("{0}")]
    Rejected(String),

    #[error("Planning changes: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for application operations.
pub type Result<T> = std::result::Result<T, AppError>;
