//! Reconciliation waiting.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::plan::PlannedOp;
use super::{ReconcileChecker, ReconcileState};

/// How long and how often to poll a resource for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Result of waiting on one operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WaitOutcome {
    Ready,
    Failed(String),
    /// Last pending reason or checker error seen before the deadline.
    TimedOut(Option<String>),
    Cancelled,
}

pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Sleep for `duration` unless cancellation is signalled first. Returns
/// whether the invocation was cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if is_cancelled(cancel) {
        return true;
    }
    let deadline = Instant::now() + duration;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            changed = cancel.changed() => {
                match changed {
                    Ok(()) if *cancel.borrow_and_update() => return true,
                    Ok(()) => continue,
                    // Sender gone: nobody can cancel any more.
                    Err(_) => {
                        tokio::time::sleep_until(deadline).await;
                        return false;
                    }
                }
            }
        }
    }
}

/// Poll `checker` until the operation's resource is ready, failed, the
/// policy's timeout elapses or the invocation is cancelled.
pub(crate) async fn wait_for(
    checker: &dyn ReconcileChecker,
    op: &PlannedOp,
    policy: &WaitPolicy,
    cancel: &mut watch::Receiver<bool>,
) -> WaitOutcome {
    let deadline = Instant::now() + policy.timeout;
    let mut last_reason = None;

    loop {
        if is_cancelled(cancel) {
            return WaitOutcome::Cancelled;
        }

        match checker.status(op).await {
            Ok(ReconcileState::Ready) => return WaitOutcome::Ready,
            Ok(ReconcileState::Failed(reason)) => return WaitOutcome::Failed(reason),
            Ok(ReconcileState::Pending(reason)) => {
                debug!(resource = %op.resource.description(), reason = %reason, "Waiting");
                last_reason = Some(reason);
            }
            Err(e) => {
                debug!(resource = %op.resource.description(), error = %e, "Reconcile check failed, polling again");
                last_reason = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut(last_reason);
        }
        let pause = policy.check_interval.min(deadline - now);
        if sleep_or_cancel(pause, cancel).await {
            return WaitOutcome::Cancelled;
        }
    }
}
