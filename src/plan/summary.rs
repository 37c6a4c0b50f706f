// src/plan/summary.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::task::{Task, TaskResult, TaskState};

/// One row of the post-run summary, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub target: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "start-at", skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(rename = "finish-at", skip_serializing_if = "Option::is_none")]
    pub finish_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSummary {
    pub fn of(task: &Task) -> Self {
        let finished = matches!(task.state, TaskState::Finished | TaskState::Abandoned);
        Self {
            target: task.name.clone(),
            state: task.state.to_string(),
            result: (finished && task.result != TaskResult::Unknown)
                .then(|| task.result.to_string()),
            start_at: task.start_time,
            finish_at: task.finish_time,
            error: if finished { task.error.clone() } else { None },
        }
    }
}

/// Write the summary JSON file.
pub fn write_summary(path: &Path, summary: &[TaskSummary]) -> Result<()> {
    let encoded = serde_json::to_vec(summary).context("encoding summary")?;
    fs::write(path, encoded).with_context(|| format!("writing summary {}", path.display()))
}

/// Load a previously written summary.
pub fn load_summary(path: &Path) -> Result<Vec<TaskSummary>> {
    let data =
        fs::read(path).with_context(|| format!("reading summary {}", path.display()))?;
    serde_json::from_slice(&data).context("decoding summary")
}
