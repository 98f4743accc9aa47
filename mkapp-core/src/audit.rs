use tracing::{Level, event};

use crate::change::ChangeOutcome;

/// Target under which audit events are emitted.
pub const AUDIT_TARGET: &str = "mkapp::audit";

/// Audit logger for application lifecycle events
#[derive(Debug, Clone)]
pub struct AppAuditLogger {
    enabled: bool,
}

impl Default for AppAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AppAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    // App events
    pub fn app_created(&self, app: &str) {
        if self.enabled {
            event!(target: AUDIT_TARGET, Level::INFO, app, "App created");
        }
    }

    pub fn app_updated(&self, app: &str) {
        if self.enabled {
            event!(target: AUDIT_TARGET, Level::INFO, app, "App updated");
        }
    }

    pub fn app_renamed(&self, from: &str, to: &str) {
        if self.enabled {
            event!(target: AUDIT_TARGET, Level::INFO, from, to, "App renamed");
        }
    }

    pub fn app_deleted(&self, app: &str) {
        if self.enabled {
            event!(target: AUDIT_TARGET, Level::INFO, app, "App deleted");
        }
    }

    // Change events
    pub fn change_began(&self, app: &str, change: &str) {
        if self.enabled {
            event!(target: AUDIT_TARGET, Level::INFO, app, change, "Change began");
        }
    }

    pub fn change_finished(&self, app: &str, change: &str, outcome: ChangeOutcome) {
        if !self.enabled {
            return;
        }
        match outcome {
            ChangeOutcome::Failed => {
                event!(target: AUDIT_TARGET, Level::WARN, app, change, %outcome, "Change finished")
            }
            _ => event!(target: AUDIT_TARGET, Level::INFO, app, change, %outcome, "Change finished"),
        }
    }

    pub fn changes_collected(&self, app: &str, deleted: usize, surviving: usize) {
        if self.enabled {
            event!(
                target: AUDIT_TARGET,
                Level::INFO,
                app,
                deleted,
                surviving,
                "Old changes deleted"
            );
        }
    }
}
