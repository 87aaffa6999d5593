//! Polling of asynchronous hypervisor tasks.

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::api::PveApi;
use crate::error::{PveError, Result};
use crate::retry::{check_cancelled, sleep_or_cancel, RetryPolicy};
use crate::types::TaskHandle;

/// Waits for a task to reach a terminal state.
///
/// A task succeeded only when it stopped running *and* its exit status is
/// "OK" (any case). Cancelling stops the wait; the task itself keeps
/// running on the hypervisor.
#[derive(Clone)]
pub struct TaskWaiter {
    api: PveApi,
    cancel: CancellationToken,
}

impl TaskWaiter {
    pub fn new(api: PveApi, cancel: CancellationToken) -> Self {
        Self { api, cancel }
    }

    /// Poll `task` up to `policy.max_attempts` times, sleeping
    /// `policy.interval_secs` after each poll that still reports `running`.
    #[instrument(skip(self, policy, message), fields(node = %task.node, upid = %task.upid))]
    pub async fn wait(&self, task: &TaskHandle, policy: &RetryPolicy, message: &str) -> Result<()> {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            check_cancelled(&self.cancel, message)?;

            let status = self.api.task_status(task).await?;
            if !status.is_running() {
                if status.succeeded() {
                    debug!(attempt, "Task finished");
                    return Ok(());
                }

                let exit = status.exitstatus.unwrap_or_else(|| "no exit status".to_string());
                warn!(attempt, exit = %exit, "Task failed");
                return Err(PveError::OperationFailed(format!("{}: {}", message, exit)));
            }

            debug!(attempt, max_attempts, "Task still running");
            sleep_or_cancel(policy.interval(), &self.cancel, message).await?;
        }

        warn!(budget_secs = policy.budget_secs(), "Task did not finish in time");
        Err(PveError::OperationFailed(format!(
            "{}: still running after {} attempts x {}s ({}s)",
            message,
            max_attempts,
            policy.interval_secs,
            policy.budget_secs()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::Method;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const UPID: &str = "UPID:pve1:00001F2A:0003B9C4:65A0F1C2:qmclone:101:root@pam:";

    fn route() -> String {
        format!("nodes/pve1/tasks/{}/status", urlencoding::encode(UPID))
    }

    fn waiter(mock: &Arc<MockTransport>, cancel: CancellationToken) -> TaskWaiter {
        TaskWaiter::new(PveApi::new(mock.clone()), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_polls() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::Get, &route(), json!({"status": "running"}))
            .on(Method::Get, &route(), json!({"status": "running"}))
            .on(Method::Get, &route(), json!({"status": "stopped", "exitstatus": "OK"}));

        let start = Instant::now();
        waiter(&mock, CancellationToken::new())
            .wait(&TaskHandle::new("pve1", UPID), &RetryPolicy::task(), "clone 101")
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(mock.call_count(Method::Get, &route()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ok_exit_fails_with_message() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::Get,
            &route(),
            json!({"status": "stopped", "exitstatus": "can't lock file"}),
        );

        let err = waiter(&mock, CancellationToken::new())
            .wait(&TaskHandle::new("pve1", UPID), &RetryPolicy::task(), "Failed to clone VM web-01")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PveError::OperationFailed("Failed to clone VM web-01: can't lock file".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::Get, &route(), json!({"status": "running"}));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = waiter(&mock, cancel)
            .wait(&TaskHandle::new("pve1", UPID), &RetryPolicy::task(), "stop 105")
            .await
            .unwrap_err();

        assert!(matches!(err, PveError::Cancelled(_)));
        assert!(mock.calls().is_empty());
    }
}
