pub mod outcome;
pub mod partition;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub type TaskId = String;

/// One unit of work. The payload is opaque to the scheduler and handed to
/// the task runner untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub interference: Interference,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// How a task may overlap with other tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interference {
    /// Runs alongside anything.
    #[default]
    Safe,
    /// At most one member of `group` may be active at a time.
    Exclusive { group: String },
    /// Runs alone, after everything else.
    SerialLast,
}

impl Task {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            interference: Interference::Safe,
            payload: serde_json::Value::Null,
        }
    }

    pub fn exclusive(mut self, group: impl Into<String>) -> Self {
        self.interference = Interference::Exclusive {
            group: group.into(),
        };
        self
    }

    pub fn serial_last(mut self) -> Self {
        self.interference = Interference::SerialLast;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

/// Load tasks from a `.jsonl` file (one task per line) or a JSON file
/// holding either an array or `{"tasks": [...]}`.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file: {}", path.display()))?;
    parse_tasks(&content, path.extension().is_some_and(|ext| ext == "jsonl"))
        .with_context(|| format!("failed to parse task file: {}", path.display()))
}

fn parse_tasks(content: &str, json_lines: bool) -> Result<Vec<Task>> {
    if json_lines {
        return content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<Task>(line)
                    .with_context(|| format!("invalid task on line {}", idx + 1))
            })
            .collect();
    }
    let file: TaskFile = serde_json::from_str(content)?;
    Ok(match file {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    })
}

/// Tasks that do not have an outcome yet, in input order.
pub fn pending(tasks: Vec<Task>, completed: &HashSet<TaskId>) -> Vec<Task> {
    tasks
        .into_iter()
        .filter(|t| !completed.contains(&t.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults_to_safe_with_null_payload() {
        let task: Task = serde_json::from_str(r#"{"id":"t1"}"#).unwrap();
        assert_eq!(task.interference, Interference::Safe);
        assert!(task.payload.is_null());
    }

    #[test]
    fn interference_is_tagged_by_kind() {
        let task: Task = serde_json::from_str(
            r#"{"id":"t2","interference":{"kind":"exclusive","group":"chrome-profile"},"payload":{"x":1}}"#,
        )
        .unwrap();
        assert_eq!(task, Task::new("t2").exclusive("chrome-profile").with_payload(serde_json::json!({"x": 1})));

        let serial: Task =
            serde_json::from_str(r#"{"id":"t3","interference":{"kind":"serial_last"}}"#).unwrap();
        assert_eq!(serial.interference, Interference::SerialLast);
    }

    #[test]
    fn parses_json_array_and_wrapped_forms() {
        let list = parse_tasks(r#"[{"id":"a"},{"id":"b"}]"#, false).unwrap();
        assert_eq!(list.len(), 2);
        let wrapped = parse_tasks(r#"{"tasks":[{"id":"a"}]}"#, false).unwrap();
        assert_eq!(wrapped[0].id, "a");
    }

    #[test]
    fn parses_json_lines_and_reports_bad_line() {
        let tasks = parse_tasks("{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n", true).unwrap();
        assert_eq!(tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let err = parse_tasks("{\"id\":\"a\"}\nnot json\n", true).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn load_tasks_reads_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, "{\"id\":\"x\"}\n{\"id\":\"y\"}\n").unwrap();
        let tasks = load_tasks(&path).unwrap();
        assert_eq!(tasks.len(), 2);

        assert!(load_tasks(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn pending_drops_completed_and_keeps_order() {
        let tasks = vec![Task::new("a"), Task::new("b"), Task::new("c")];
        let done: HashSet<TaskId> = ["b".to_string()].into_iter().collect();
        let left = pending(tasks, &done);
        assert_eq!(left.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["a", "c"]);
    }
}
