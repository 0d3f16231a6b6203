//! Waiting on asynchronous Proxmox tasks.
//!
//! Every mutating VM or storage call returns a UPID. The caller must poll
//! `/nodes/{node}/tasks/{upid}/status` until the task leaves the `running`
//! state, then check that the exit status is the literal `OK`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::client::models::TaskHandle;
use crate::client::ProxmoxApi;
use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::error::TaskError;

/// Exit status reported by a task that succeeded.
pub const EXIT_OK: &str = "OK";

/// Polls task status until a task is terminal.
#[derive(Clone)]
pub struct TaskWaiter {
    api: Arc<dyn ProxmoxApi>,
    poll_interval: Duration,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl TaskWaiter {
    /// Create a waiter with the default poll interval and no deadline.
    pub fn new(api: Arc<dyn ProxmoxApi>) -> Self {
        Self {
            api,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound every wait by `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Abort waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The client this waiter polls through.
    pub fn api(&self) -> &Arc<dyn ProxmoxApi> {
        &self.api
    }

    /// Block until `task` is terminal.
    ///
    /// Returns `Ok(())` only when the task stopped with exit status `OK`.
    /// A polling error is returned immediately; nothing is retried.
    #[instrument(skip(self), fields(upid = %task.upid, node = %task.node))]
    pub async fn wait(&self, task: &TaskHandle) -> Result<(), TaskError> {
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let status = self
                .api
                .task_status(&task.node, &task.upid)
                .await
                .map_err(TaskError::Transport)?;
            polls += 1;

            if !status.is_running() {
                let exit = status.exitstatus.ok_or(TaskError::MissingExitStatus)?;
                debug!(polls, exit = %exit, "task finished");
                if exit == EXIT_OK {
                    return Ok(());
                }
                return Err(TaskError::BadExit(exit));
            }

            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    warn!(polls, ?deadline, "task still running at deadline");
                    return Err(TaskError::DeadlineExceeded(deadline));
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = sleep(self.poll_interval) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::testing::FakeProxmox;
    use tokio_test::{assert_err, assert_ok};

    fn waiter(fake: &Arc<FakeProxmox>) -> TaskWaiter {
        TaskWaiter::new(fake.clone()).with_poll_interval(Duration::from_millis(1))
    }

    fn handle() -> TaskHandle {
        TaskHandle::new("pve", "UPID:pve:00001:qmcreate")
    }

    #[tokio::test]
    async fn test_wait_ok_after_running() {
        let fake = Arc::new(FakeProxmox::new());
        fake.script_task(&handle().upid, &["running", "running"], "OK");

        assert_ok!(waiter(&fake).wait(&handle()).await);
        assert_eq!(fake.task_polls(&handle().upid), 3);
    }

    #[tokio::test]
    async fn test_wait_bad_exit_carries_status() {
        let fake = Arc::new(FakeProxmox::new());
        fake.script_task(&handle().upid, &["running", "running"], "some error");

        match waiter(&fake).wait(&handle()).await {
            Err(TaskError::BadExit(exit)) => assert_eq!(exit, "some error"),
            other => panic!("expected BadExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_transport_error_is_immediate() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_task_status(ApiError::status(595, "no route to host"));

        let err = assert_err!(waiter(&fake).wait(&handle()).await);
        assert!(matches!(err, TaskError::Transport(_)));
        assert_eq!(fake.task_polls(&handle().upid), 1);
    }

    #[tokio::test]
    async fn test_wait_missing_exit_status() {
        let fake = Arc::new(FakeProxmox::new());
        fake.script_task_without_exit(&handle().upid);

        let err = assert_err!(waiter(&fake).wait(&handle()).await);
        assert!(matches!(err, TaskError::MissingExitStatus));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let fake = Arc::new(FakeProxmox::new());
        fake.script_task(&handle().upid, &["running"; 1000], "OK");
        let cancel = CancellationToken::new();
        let waiter = waiter(&fake)
            .with_poll_interval(Duration::from_secs(60))
            .with_cancellation(cancel.clone());

        let task = tokio::spawn(async move { waiter.wait(&handle()).await });
        tokio::task::yield_now().await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_deadline() {
        let fake = Arc::new(FakeProxmox::new());
        fake.script_task(&handle().upid, &["running"; 1000], "OK");
        let waiter = waiter(&fake).with_deadline(Some(Duration::from_millis(5)));

        let err = assert_err!(waiter.wait(&handle()).await);
        assert!(matches!(err, TaskError::DeadlineExceeded(_)));
    }
}
