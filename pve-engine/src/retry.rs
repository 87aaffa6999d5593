//! Data-driven retry policies and the executor that applies them.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorKind, PveError, Result};

/// Attempt budget for one polling or retry loop.
///
/// Total wall time is bounded by `max_attempts × interval_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_secs: u64,
    /// Error kinds worth another attempt; everything else fails at once
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::task()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval_secs: u64) -> Self {
        Self {
            max_attempts,
            interval_secs,
            retry_on: Vec::new(),
        }
    }

    pub fn retrying(mut self, kinds: &[ErrorKind]) -> Self {
        self.retry_on = kinds.to_vec();
        self
    }

    /// Short operations: power, snapshot, interface updates (30 s).
    pub fn task() -> Self {
        Self::new(6, 5)
    }

    /// Clones copy whole disks (10 min).
    pub fn deploy_task() -> Self {
        Self::new(60, 10)
    }

    /// A lock can outlive the task that took it (5 min).
    pub fn instance_lock() -> Self {
        Self::new(60, 5).retrying(&[ErrorKind::InstanceLocked])
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn budget_secs(&self) -> u64 {
        u64::from(self.max_attempts) * self.interval_secs
    }

    pub fn should_retry(&self, error: &PveError) -> bool {
        self.retry_on.contains(&error.kind())
    }
}

/// Every budget the engine uses, as configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePolicies {
    /// Task waits for power, snapshot and NIC operations
    pub task: RetryPolicy,
    /// Task waits for clones
    pub deploy_task: RetryPolicy,
    /// Retries while an instance is locked by another task
    pub instance_lock: RetryPolicy,
    /// Whole clone attempts before rollback
    pub clone_attempts: u32,
    /// Stop-and-recheck rounds before giving up on a power-off
    pub stop_attempts: u32,
}

impl Default for EnginePolicies {
    fn default() -> Self {
        Self {
            task: RetryPolicy::task(),
            deploy_task: RetryPolicy::deploy_task(),
            instance_lock: RetryPolicy::instance_lock(),
            clone_attempts: 5,
            stop_attempts: 5,
        }
    }
}

/// Fail with `Cancelled` if the token has fired.
pub fn check_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(PveError::Cancelled(operation.to_string()));
    }
    Ok(())
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken, operation: &str) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PveError::Cancelled(operation.to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `op` until it succeeds, fails with a non-retryable kind, or the
/// policy's attempts run out. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        check_cancelled(cancel, operation)?;
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && policy.should_retry(&e) => {
                debug!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Retrying after {}s",
                    policy.interval_secs
                );
                sleep_or_cancel(policy.interval(), cancel, operation).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
