//! Splits the task list into batches that never run interfering tasks
//! together.
//!
//! Exclusive groups are spread across batches, one member per batch, so
//! members of a group run one after another while everything else fills the
//! gaps. Serial-last tasks go into a trailing sequential batch.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::{Interference, Task, TaskId};

/// How many tasks of a batch may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Up to the pool size.
    Parallel,
    /// One at a time.
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub mode: BatchMode,
    pub tasks: Vec<Task>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("batch invariant violated: batches hold {actual} tasks, input has {expected}")]
    Invariant { expected: usize, actual: usize },

    #[error("batch invariant violated: missing {missing:?}, unexpected {unexpected:?}")]
    Mismatch {
        missing: Vec<TaskId>,
        unexpected: Vec<TaskId>,
    },

    #[error("duplicate task id: {0}")]
    DuplicateTaskId(TaskId),
}

/// Partition `tasks` into ordered batches.
///
/// Batch `i` holds the `i`-th member of every exclusive group plus a
/// balanced share of the safe tasks; serial-last tasks follow in one
/// sequential batch. With no exclusive groups all safe tasks share one
/// batch.
pub fn partition(tasks: &[Task]) -> Result<Vec<Batch>, PartitionError> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(PartitionError::DuplicateTaskId(task.id.clone()));
        }
    }

    let mut safe = Vec::new();
    let mut serial = Vec::new();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<Task>> = Vec::new();

    for task in tasks {
        match &task.interference {
            Interference::Safe => safe.push(task.clone()),
            Interference::SerialLast => serial.push(task.clone()),
            Interference::Exclusive { group } => {
                let idx = *group_index.entry(group.as_str()).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[idx].push(task.clone());
            }
        }
    }

    let width = groups.iter().map(Vec::len).max().unwrap_or(0);
    let mut parallel: Vec<Vec<Task>> = vec![Vec::new(); width];
    for members in groups {
        for (i, task) in members.into_iter().enumerate() {
            parallel[i].push(task);
        }
    }

    if parallel.is_empty() && !safe.is_empty() {
        parallel.push(Vec::new());
    }

    // Smallest batch first; ties go to the earliest batch, which makes this
    // a plain round robin when the batches start out level.
    for task in safe {
        if let Some(target) = parallel
            .iter_mut()
            .enumerate()
            .min_by_key(|(i, b)| (b.len(), *i))
            .map(|(_, b)| b)
        {
            target.push(task);
        }
    }

    let mut batches: Vec<Batch> = parallel
        .into_iter()
        .enumerate()
        .map(|(index, tasks)| Batch {
            index,
            mode: BatchMode::Parallel,
            tasks,
        })
        .collect();

    if !serial.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            mode: BatchMode::Sequential,
            tasks: serial,
        });
    }

    verify(tasks, &batches)?;

    tracing::info!(
        tasks = tasks.len(),
        batches = batches.len(),
        sizes = ?batches.iter().map(Batch::len).collect::<Vec<_>>(),
        "partitioned tasks into batches"
    );

    Ok(batches)
}

/// Check that `batches` hold exactly the multiset of task ids in `input`.
pub fn verify(input: &[Task], batches: &[Batch]) -> Result<(), PartitionError> {
    let actual: usize = batches.iter().map(Batch::len).sum();
    if actual != input.len() {
        return Err(PartitionError::Invariant {
            expected: input.len(),
            actual,
        });
    }

    let mut counts: HashMap<&str, i64> = HashMap::new();
    for task in input {
        *counts.entry(task.id.as_str()).or_default() += 1;
    }
    for task in batches.iter().flat_map(|b| &b.tasks) {
        *counts.entry(task.id.as_str()).or_default() -= 1;
    }

    let mut missing: Vec<TaskId> = Vec::new();
    let mut unexpected: Vec<TaskId> = Vec::new();
    for (id, count) in counts {
        if count > 0 {
            missing.push(id.to_string());
        } else if count < 0 {
            unexpected.push(id.to_string());
        }
    }
    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    missing.sort();
    unexpected.sort();
    Err(PartitionError::Mismatch {
        missing,
        unexpected,
    })
}
