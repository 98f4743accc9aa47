//! Orchestrator configuration and the command-line flags that produce it.

use std::time::Duration;

use clap::Args;

use crate::orchestrator::{RetryPolicy, WaitPolicy};

/// Tunables of the apply/wait orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub apply_retry: RetryPolicy,
    pub apply_concurrency: usize,
    pub wait: WaitPolicy,
    pub wait_concurrency: usize,
    /// Changes to keep per application after a deploy; `None` disables GC.
    pub changes_to_keep: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            apply_retry: RetryPolicy::default(),
            apply_concurrency: 5,
            wait: WaitPolicy::default(),
            wait_concurrency: 5,
            changes_to_keep: Some(200),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_flags(apply: &ApplyFlags, wait: &WaitFlags, changes: &AppChangesFlags) -> Self {
        Self {
            apply_retry: apply.retry_policy(),
            apply_concurrency: apply.apply_concurrency.max(1),
            wait: wait.wait_policy(),
            wait_concurrency: wait.wait_concurrency.max(1),
            changes_to_keep: changes.changes_to_keep(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ApplyFlags {
    /// Maximum number of concurrent apply operations
    #[arg(long, default_value = "5")]
    pub apply_concurrency: usize,

    /// Attempts per operation on retryable errors
    #[arg(long, default_value = "10")]
    pub apply_attempts: u32,

    /// Initial retry backoff in milliseconds, doubled per attempt
    #[arg(long, default_value = "1000")]
    pub apply_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[arg(long, default_value = "10000")]
    pub apply_max_backoff_ms: u64,
}

impl ApplyFlags {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.apply_attempts,
            base_delay: Duration::from_millis(self.apply_backoff_ms),
            max_delay: Duration::from_millis(self.apply_max_backoff_ms.max(self.apply_backoff_ms)),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WaitFlags {
    /// Maximum time to wait for a resource to reconcile, in seconds
    #[arg(long, default_value = "900")]
    pub wait_timeout_secs: u64,

    /// Interval between reconcile checks in milliseconds
    #[arg(long, default_value = "1000")]
    pub wait_check_interval_ms: u64,

    /// Maximum number of concurrent wait operations
    #[arg(long, default_value = "5")]
    pub wait_concurrency: usize,
}

impl WaitFlags {
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(self.wait_timeout_secs),
            check_interval: Duration::from_millis(self.wait_check_interval_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AppChangesFlags {
    /// Maximum number of app changes to keep (0 keeps all)
    #[arg(long, default_value = "200")]
    pub app_changes_max_to_keep: usize,
}

impl AppChangesFlags {
    pub fn changes_to_keep(&self) -> Option<usize> {
        match self.app_changes_max_to_keep {
            0 => None,
            n => Some(n),
        }
    }
}
