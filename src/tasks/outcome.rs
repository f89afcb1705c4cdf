//! Task outcomes and their on-disk store.
//!
//! Every task gets exactly one outcome file under `<results_dir>/outcomes/`,
//! written before its slot goes back to the pool. A restarted run skips the
//! tasks that already have one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    TimedOut,
    SandboxUnhealthy,
    TaskError,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::TimedOut => "timed_out",
            OutcomeStatus::SandboxUnhealthy => "sandbox_unhealthy",
            OutcomeStatus::TaskError => "task_error",
        };
        f.write_str(s)
    }
}

/// The result of running one task. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub batch: usize,
    #[serde(default)]
    pub slot: Option<usize>,
    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub aux_endpoint: Option<String>,
    /// Dispatches it took, counting prepares that failed.
    pub attempts: u32,
    pub dispatched_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    /// An outcome for a task that never reached a sandbox.
    pub fn undispatched(
        task_id: impl Into<TaskId>,
        batch: usize,
        status: OutcomeStatus,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status,
            result: None,
            error: Some(error.into()),
            batch,
            slot: None,
            sandbox: None,
            aux_endpoint: None,
            attempts: 0,
            dispatched_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

/// Per-status counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    /// Tasks skipped because an earlier run already recorded them.
    pub skipped: usize,
    pub by_status: BTreeMap<OutcomeStatus, usize>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[TaskOutcome], skipped: usize) -> Self {
        let mut by_status = BTreeMap::new();
        for outcome in outcomes {
            *by_status.entry(outcome.status).or_insert(0) += 1;
        }
        Self {
            total: outcomes.len(),
            skipped,
            by_status,
            started_at: outcomes.iter().map(|o| o.dispatched_at).min(),
            finished_at: outcomes.iter().map(|o| o.finished_at).max(),
        }
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// JSON file per task, one directory per results dir.
#[derive(Debug, Clone)]
pub struct OutcomeStore {
    root: PathBuf,
    dir: PathBuf,
}

impl OutcomeStore {
    pub fn new(results_dir: impl AsRef<Path>) -> Self {
        let root = results_dir.as_ref().to_path_buf();
        Self {
            dir: root.join("outcomes"),
            root,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(task_id)))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.path_for(task_id).exists()
    }

    /// Persist `outcome`. Fails if the task already has one.
    pub fn record(&self, outcome: &TaskOutcome) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(&outcome.task_id);
        if path.exists() {
            bail!("outcome already recorded for task {}", outcome.task_id);
        }
        let content = serde_json::to_string_pretty(outcome)?;
        write_durable(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Every outcome on disk. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<TaskOutcome>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<TaskOutcome>(&content) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse outcome file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read outcome file");
                }
            }
        }
        outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(outcomes)
    }

    /// IDs of tasks that already have an outcome.
    pub fn completed_ids(&self) -> Result<HashSet<TaskId>> {
        Ok(self.load_all()?.into_iter().map(|o| o.task_id).collect())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.root.join("summary.json");
        write_durable(&path, serde_json::to_string_pretty(summary)?.as_bytes())?;
        Ok(path)
    }
}

/// Write `content` to a temp file next to `path`, flush it to disk, then
/// rename it into place and flush the directory entry.
fn write_durable(path: &Path, content: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
    drop(file);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {}", tmp_path.display()))?;
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("failed to sync {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Filesystem-safe, collision-free file stem for a task id.
fn file_stem(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    for byte in task_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
