//! What one dispatched unit does with its slot: prepare the sandbox, run
//! the task, or rebuild the sandbox.

use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::{SandboxError, SandboxHandle, TaskRunError, WorkerCommand};
use crate::tasks::Task;

use super::SlotId;
use super::provision::Provisioner;

/// A unit that ran its task to completion.
#[derive(Debug, Clone)]
pub struct UnitSuccess {
    pub result: serde_json::Value,
    /// Snapshot the sandbox was reverted to before the task.
    pub snapshot: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum UnitError {
    /// Preparing the sandbox failed; the task never ran.
    #[error("prepare failed: {0}")]
    Prepare(SandboxError),

    #[error("{0}")]
    Timeout(String),

    /// The task itself failed.
    #[error("task failed: {0}")]
    Task(String),

    /// The task runner died without a reply.
    #[error("task runner crashed: {0}")]
    Crashed(String),
}

impl UnitError {
    /// Whether the sandbox is left in an unknown state.
    pub fn penalizes_sandbox(&self) -> bool {
        !matches!(self, UnitError::Task(_))
    }
}

impl From<TaskRunError> for UnitError {
    fn from(e: TaskRunError) -> Self {
        match e {
            TaskRunError::Timeout(msg) => UnitError::Timeout(msg),
            TaskRunError::Failed(msg) => UnitError::Task(msg),
            TaskRunError::Crashed(msg) => UnitError::Crashed(msg),
        }
    }
}

/// The work behind each slot. The scheduler only talks to sandboxes
/// through this.
#[async_trait]
pub trait SlotExecutor: Send + Sync + 'static {
    /// Prepare `handle` and run `task` on it.
    async fn execute(
        &self,
        handle: SandboxHandle,
        task: Task,
        aux_endpoint: Option<String>,
    ) -> Result<UnitSuccess, UnitError>;

    /// Bring up a fresh sandbox for `slot`, discarding `old` if the slot
    /// still has one.
    async fn replace(
        &self,
        slot: SlotId,
        old: Option<SandboxHandle>,
    ) -> Result<SandboxHandle, SandboxError>;
}

/// Runs units against real sandboxes: revert in an isolated worker, then
/// hand the task to the task runner.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    provisioner: Provisioner,
    reverter: WorkerCommand,
    runner: WorkerCommand,
    snapshot: String,
    reset_timeout: Duration,
    task_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl SandboxExecutor {
    pub fn new(
        provisioner: Provisioner,
        reverter: WorkerCommand,
        runner: WorkerCommand,
        snapshot: impl Into<String>,
        reset_timeout: Duration,
        task_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            provisioner,
            reverter,
            runner,
            snapshot: snapshot.into(),
            reset_timeout,
            task_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl SlotExecutor for SandboxExecutor {
    async fn execute(
        &self,
        handle: SandboxHandle,
        task: Task,
        aux_endpoint: Option<String>,
    ) -> Result<UnitSuccess, UnitError> {
        handle
            .reset(
                &self.reverter,
                &self.snapshot,
                self.request_timeout,
                self.reset_timeout,
            )
            .await
            .map_err(UnitError::Prepare)?;

        let result = handle
            .run_task(
                &self.runner,
                &task.id,
                &task.payload,
                aux_endpoint.as_deref(),
                self.task_timeout,
            )
            .await?;

        Ok(UnitSuccess {
            result,
            snapshot: Some(self.snapshot.clone()),
        })
    }

    async fn replace(
        &self,
        slot: SlotId,
        old: Option<SandboxHandle>,
    ) -> Result<SandboxHandle, SandboxError> {
        self.provisioner.replace(slot, old.as_ref()).await
    }
}
