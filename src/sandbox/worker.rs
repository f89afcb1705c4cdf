//! Out-of-process workers.
//!
//! Anything that can hang on the network (snapshot revert, task execution)
//! runs in a child process. The parent writes one JSON request to the
//! child's stdin, waits for it up to a deadline, and kills it when the
//! deadline passes. A blocked socket read cannot be interrupted from inside
//! the process; killing the process always works. Each child leads its own
//! process group, and the whole group is killed, so helpers the worker
//! started go down with it.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::control::{ControlClient, RetryPolicy};
use super::error::SandboxError;
use super::types::{ConnectionInfo, ProviderEndpoint, SandboxName};

const MAX_STDOUT_BYTES: usize = 16 * 1024 * 1024;
const MAX_STDERR_BYTES: usize = 64 * 1024;
const STDERR_TAIL_CHARS: usize = 2000;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Protocol ────────────────────────────────────────────────────────

/// Request written to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Revert(RevertJob),
    RunTask(TaskJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertJob {
    pub provider: ProviderEndpoint,
    pub container_name: SandboxName,
    pub snapshot_name: String,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Everything the task-execution collaborator gets to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskJob {
    pub task_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub sandbox: SandboxName,
    /// `host:control_port:display_port:vnc_port:aux_port`
    pub connection: String,
    pub endpoints: ConnectionInfo,
    #[serde(default)]
    pub aux_endpoint: Option<String>,
    pub deadline_secs: f64,
}

/// Reply a worker prints to stdout as its last line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        error: String,
    },
}

// ── Command ─────────────────────────────────────────────────────────

/// A program that speaks the worker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(argv: &[String]) -> Result<Self, SandboxError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Worker("empty worker command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        })
    }

    /// This binary's own `worker` subcommand.
    pub fn current_exe() -> Result<Self, SandboxError> {
        let exe = std::env::current_exe()?;
        Ok(Self {
            program: exe.display().to_string(),
            args: vec!["worker".into()],
            env: BTreeMap::new(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the worker on `request`, killing it if it outlives `deadline`.
    ///
    /// Returns `SandboxError::Timeout` on deadline expiry and
    /// `SandboxError::Worker` when the process dies without a reply.
    pub async fn call(
        &self,
        request: &WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerReply, SandboxError> {
        let mut payload = serde_json::to_vec(request)
            .map_err(|e| SandboxError::Serde(format!("failed to encode worker request: {e}")))?;
        payload.push(b'\n');

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Worker(format!("spawn {} failed: {e}", self.program)))?;
        // Fires on every early return and when the caller's future is dropped.
        let mut group = GroupKill::new(child.id());

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Worker("worker stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Worker("worker stderr not captured".into()))?;
        let stdout_task = tokio::spawn(collect_tail(stdout, MAX_STDOUT_BYTES));
        let stderr_task = tokio::spawn(collect_tail(stderr, MAX_STDERR_BYTES));

        let waited = tokio::time::timeout(deadline, async {
            if let Some(mut stdin) = stdin {
                // A worker that exits without reading its request is not an error here.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
            child.wait().await
        })
        .await;

        let exit = match waited {
            Ok(Ok(status)) => {
                group.disarm();
                status
            }
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(SandboxError::Worker(format!("wait failed: {e}")));
            }
            Err(_) => {
                group.kill();
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                tracing::warn!(
                    program = %self.program,
                    deadline_secs = deadline.as_secs_f64(),
                    "worker exceeded its deadline, killed"
                );
                return Err(SandboxError::timeout(deadline));
            }
        };

        // A grandchild may still hold the pipes open; don't wait on it forever.
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        tracing::debug!(
            program = %self.program,
            exit_code = ?exit.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker finished"
        );

        if let Some(reply) = parse_reply(&stdout) {
            return Ok(reply);
        }

        let stderr_tail = tail_chars(&String::from_utf8_lossy(&stderr), STDERR_TAIL_CHARS);
        if exit.success() {
            Err(SandboxError::Worker(format!(
                "worker exited without a reply; stderr: {stderr_tail}"
            )))
        } else {
            Err(SandboxError::Worker(format!(
                "worker exited with code {:?}; stderr: {stderr_tail}",
                exit.code()
            )))
        }
    }
}

/// Kills a worker's process group when dropped, unless disarmed.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(pgid: u32) {
    tracing::warn!(pgid, "process group kill not implemented on this platform");
}

/// Read everything, keeping at most the last `max_bytes`.
async fn collect_tail<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > max_bytes {
                    let excess = buf.len() - max_bytes;
                    buf.drain(..excess);
                }
            }
        }
    }
    buf
}

async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

/// The reply is the last stdout line that parses as one; anything the
/// worker printed before it is ignored.
fn parse_reply(stdout: &[u8]) -> Option<WorkerReply> {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<WorkerReply>(line).ok())
        .or_else(|| serde_json::from_str::<WorkerReply>(text.trim()).ok())
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.trim().to_string();
    }
    s.chars().skip(count - max).collect::<String>().trim().to_string()
}

// ── Worker side ─────────────────────────────────────────────────────

/// Body of the `worker` subcommand: read one request from stdin, execute
/// it, print the reply on stdout.
pub async fn serve_stdio() -> Result<(), SandboxError> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;

    let reply = match serde_json::from_str::<WorkerRequest>(input.trim()) {
        Ok(request) => handle_request(request).await,
        Err(e) => WorkerReply::Error {
            error: format!("invalid worker request: {e}"),
        },
    };

    let line = serde_json::to_string(&reply)
        .map_err(|e| SandboxError::Serde(format!("failed to encode worker reply: {e}")))?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn handle_request(request: WorkerRequest) -> WorkerReply {
    match request {
        WorkerRequest::Revert(job) => match revert(job).await {
            Ok(result) => WorkerReply::Ok { result },
            Err(e) => WorkerReply::Error {
                error: e.to_string(),
            },
        },
        WorkerRequest::RunTask(job) => WorkerReply::Error {
            error: format!(
                "task {} sent to the revert worker; configure runner.task_command",
                job.task_id
            ),
        },
    }
}

/// Revert, then read back the sandbox status as the fresh observation.
async fn revert(job: RevertJob) -> Result<serde_json::Value, SandboxError> {
    let client = ControlClient::new(
        job.provider.clone(),
        RetryPolicy::default(),
        job.request_timeout_secs.map(Duration::from_secs),
    )?;
    client.revert(&job.container_name, &job.snapshot_name).await?;

    let status = client.status(&job.container_name).await?;
    Ok(serde_json::json!({
        "container_name": job.container_name,
        "snapshot_name": job.snapshot_name,
        "connection": status.connection_info.map(|c| c.to_string()),
    }))
}
