use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::SandboxError;
use super::types::*;
use super::worker::{RevertJob, TaskJob, WorkerCommand, WorkerReply, WorkerRequest};

/// One live sandbox: identity, endpoints, health and last snapshot.
///
/// Owned by the scheduler's slot table. Units get a clone of the handle
/// for the duration of one task; only the coordinator mutates the
/// original.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    name: SandboxName,
    provider: ProviderEndpoint,
    connection: ConnectionInfo,
    config: SandboxConfig,
    status: SandboxStatus,
    snapshot: Option<String>,
    created_at: DateTime<Utc>,
}

/// Why running a task on a sandbox did not produce a result.
#[derive(thiserror::Error, Debug)]
pub enum TaskRunError {
    /// The task ran past its deadline and its worker was killed.
    #[error("{0}")]
    Timeout(String),

    /// The task runner reported a failure of the task itself.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task runner died without replying.
    #[error("task runner crashed: {0}")]
    Crashed(String),
}

impl SandboxHandle {
    pub fn new(
        name: SandboxName,
        provider: ProviderEndpoint,
        connection: ConnectionInfo,
        config: SandboxConfig,
    ) -> Self {
        Self {
            name,
            provider,
            connection,
            config,
            status: SandboxStatus::Idle,
            snapshot: None,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &ProviderEndpoint {
        &self.provider
    }

    /// `host:control_port:display_port:vnc_port:aux_port`
    pub fn connection_string(&self) -> String {
        self.connection.to_string()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn status(&self) -> SandboxStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SandboxStatus) {
        self.status = status;
    }

    /// Last snapshot this sandbox was successfully reverted to.
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn record_snapshot(&mut self, snapshot: impl Into<String>) {
        self.snapshot = Some(snapshot.into());
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Revert to `snapshot` in an isolated worker, bounded by `deadline`.
    ///
    /// Returns the worker's observation of the fresh sandbox. Any error
    /// leaves the sandbox in an unknown state.
    pub async fn reset(
        &self,
        worker: &WorkerCommand,
        snapshot: &str,
        request_timeout: Option<Duration>,
        deadline: Duration,
    ) -> Result<serde_json::Value, SandboxError> {
        let request = WorkerRequest::Revert(RevertJob {
            provider: self.provider.clone(),
            container_name: self.name.clone(),
            snapshot_name: snapshot.to_string(),
            request_timeout_secs: request_timeout.map(|t| t.as_secs().max(1)),
        });

        tracing::debug!(sandbox = %self.name, snapshot = %snapshot, "resetting sandbox");

        match worker.call(&request, deadline).await? {
            WorkerReply::Ok { result } => Ok(result),
            WorkerReply::Error { error } => Err(SandboxError::Revert(error)),
        }
    }

    /// Run one task against this sandbox through the task runner,
    /// bounded by `deadline`.
    pub async fn run_task(
        &self,
        runner: &WorkerCommand,
        task_id: &str,
        payload: &serde_json::Value,
        aux_endpoint: Option<&str>,
        deadline: Duration,
    ) -> Result<serde_json::Value, TaskRunError> {
        let request = WorkerRequest::RunTask(TaskJob {
            task_id: task_id.to_string(),
            payload: payload.clone(),
            sandbox: self.name.clone(),
            connection: self.connection_string(),
            endpoints: self.connection.clone(),
            aux_endpoint: aux_endpoint.map(str::to_string),
            deadline_secs: deadline.as_secs_f64(),
        });

        match runner.call(&request, deadline).await {
            Ok(WorkerReply::Ok { result }) => Ok(result),
            Ok(WorkerReply::Error { error }) => Err(TaskRunError::Failed(error)),
            Err(SandboxError::Timeout(msg)) => Err(TaskRunError::Timeout(msg)),
            Err(e) => Err(TaskRunError::Crashed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SandboxHandle {
        SandboxHandle::new(
            "envpool-0-abc123".into(),
            ProviderEndpoint::new("127.0.0.1", 1),
            ConnectionInfo {
                host: "10.0.0.5".into(),
                control_port: 5000,
                display_port: 9222,
                vnc_port: 8006,
                aux_port: 8080,
            },
            SandboxConfig {
                name: "envpool-0-abc123".into(),
                os_type: "ubuntu".into(),
                screen_width: 1920,
                screen_height: 1080,
                disk_size: "32G".into(),
                ram_size: "4G".into(),
                cpu_cores: 4,
                headless: true,
            },
        )
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(&["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    #[test]
    fn new_handle_is_idle_without_snapshot() {
        let h = handle();
        assert_eq!(h.status(), SandboxStatus::Idle);
        assert!(h.snapshot().is_none());
        assert_eq!(h.connection_string(), "10.0.0.5:5000:9222:8006:8080");
    }

    #[test]
    fn status_and_snapshot_are_mutable() {
        let mut h = handle();
        h.set_status(SandboxStatus::Busy);
        h.record_snapshot("init_state");
        assert_eq!(h.status(), SandboxStatus::Busy);
        assert_eq!(h.snapshot(), Some("init_state"));
    }

    #[tokio::test]
    async fn reset_returns_observation() {
        let worker = sh(r#"cat > /dev/null; echo '{"status":"ok","result":{"screen":"ready"}}'"#);
        let obs = handle()
            .reset(&worker, "init_state", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(obs["screen"], "ready");
    }

    #[tokio::test]
    async fn reset_error_reply_is_revert_error() {
        let worker = sh(r#"cat > /dev/null; echo '{"status":"error","error":"revert refused"}'"#);
        let err = handle()
            .reset(&worker, "init_state", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Revert(m) if m == "revert refused"));
    }

    #[tokio::test]
    async fn reset_hang_times_out() {
        let worker = WorkerCommand::new(&["sleep".into(), "30".into()]).unwrap();
        let err = handle()
            .reset(&worker, "init_state", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timeout after 1 seconds");
    }

    #[tokio::test]
    async fn run_task_sends_connection_string_and_aux_endpoint() {
        let runner = sh(r#"read line; printf '{"status":"ok","result":%s}\n' "$line""#);
        let result = handle()
            .run_task(
                &runner,
                "task-7",
                &serde_json::json!({"instruction": "open the settings"}),
                Some("http://llm-1:8000"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result["op"], "run_task");
        assert_eq!(result["task_id"], "task-7");
        assert_eq!(result["connection"], "10.0.0.5:5000:9222:8006:8080");
        assert_eq!(result["aux_endpoint"], "http://llm-1:8000");
        assert_eq!(result["payload"]["instruction"], "open the settings");
    }

    #[tokio::test]
    async fn run_task_maps_failures() {
        let h = handle();
        let payload = serde_json::Value::Null;

        let failed = sh(r#"cat > /dev/null; echo '{"status":"error","error":"checker failed"}'"#);
        let err = h
            .run_task(&failed, "t", &payload, None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskRunError::Failed(m) if m == "checker failed"));

        let crashed = sh("cat > /dev/null; exit 9");
        let err = h
            .run_task(&crashed, "t", &payload, None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskRunError::Crashed(_)));

        let hung = WorkerCommand::new(&["sleep".into(), "30".into()]).unwrap();
        let err = h
            .run_task(&hung, "t", &payload, None, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskRunError::Timeout(_)));
    }
}
