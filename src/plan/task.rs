// src/plan/task.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::plan::events::WorkerMsg;
use crate::project::model::join_rel;
use crate::project::{Project, Target};

/// State of a task inside an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Waiting,
    Queued,
    Running,
    Finished,
    /// Hard-cancelled while running; the worker may still be draining.
    Abandoned,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Waiting => "Waiting",
            TaskState::Queued => "Queued",
            TaskState::Running => "Running",
            TaskState::Finished => "Finished",
            TaskState::Abandoned => "Abandoned",
        };
        f.write_str(s)
    }
}

/// Result of task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResult {
    Unknown,
    Success,
    Failure,
    Skipped,
    Aborted,
    /// Background services were brought up and left running (compose).
    Started,
}

impl TaskResult {
    /// Success, Skipped and Started all unblock dependents.
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            TaskResult::Success | TaskResult::Skipped | TaskResult::Started
        )
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskResult::Unknown => "",
            TaskResult::Success => "Success",
            TaskResult::Failure => "Failure",
            TaskResult::Skipped => "Skipped",
            TaskResult::Aborted => "Aborted",
            TaskResult::Started => "Started",
        };
        f.write_str(s)
    }
}

/// Runtime twin of a target: per-plan state owned by the coordinator.
#[derive(Debug)]
pub struct Task {
    pub name: String,
    pub state: TaskState,
    pub result: TaskResult,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,

    /// Unfinished dependencies; the task is ready when empty.
    pub(crate) depends: BTreeSet<String>,
    /// Digest computed at start, persisted as the success mark on success.
    pub(crate) current_digest: String,
    /// Set once the success mark was invalidated; defeats the skip check.
    pub(crate) always_build: bool,
    /// Some dependency ran non-skipped in this plan; transit targets must
    /// then run instead of short-circuiting on an unchanged watch-list.
    pub(crate) dep_rebuilt: bool,
}

impl Task {
    pub(crate) fn new(name: &str, depends: BTreeSet<String>) -> Self {
        Self {
            name: name.to_string(),
            state: TaskState::Waiting,
            result: TaskResult::Unknown,
            error: None,
            start_time: None,
            finish_time: None,
            depends,
            current_digest: String::new(),
            always_build: false,
            dep_rebuilt: false,
        }
    }

    pub fn is_activated(&self) -> bool {
        self.depends.is_empty()
    }
}

/// Everything a driver needs to run one target, detached from the plan's
/// mutable state.
pub struct TaskContext {
    pub name: String,
    pub target: Target,
    pub project: Arc<Project>,
    /// Plan environment plus per-task `HMAKE_TARGET` / `HMAKE_TARGET_DIR`.
    pub env: BTreeMap<String, String>,
    /// Full path to the `.hmake` work area.
    pub work_path: PathBuf,
    pub dry_run: bool,

    output: mpsc::Sender<WorkerMsg>,
}

impl TaskContext {
    pub(crate) fn new(
        target: &Target,
        project: Arc<Project>,
        plan_env: &BTreeMap<String, String>,
        work_path: &Path,
        dry_run: bool,
        output: mpsc::Sender<WorkerMsg>,
    ) -> Self {
        let mut env = plan_env.clone();
        env.insert("HMAKE_TARGET".to_string(), target.name.clone());
        env.insert(
            "HMAKE_TARGET_DIR".to_string(),
            join_rel(&project.base_dir, &target.working_dir())
                .to_string_lossy()
                .into_owned(),
        );
        Self {
            name: target.name.clone(),
            target: target.clone(),
            project,
            env,
            work_path: work_path.to_path_buf(),
            dry_run,
            output,
        }
    }

    /// Build a standalone context not wired to a running plan; output writes
    /// are dropped. Useful for inspecting driver behaviour (signatures,
    /// script synthesis) outside an execution.
    pub fn detached(
        target: &Target,
        project: Arc<Project>,
        env: &BTreeMap<String, String>,
        work_path: &Path,
    ) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(target, project, env, work_path, false, tx)
    }

    /// Publish process output; each call becomes one `TaskOutput` event.
    pub async fn write_output(&self, data: Vec<u8>) {
        let _ = self
            .output
            .send(WorkerMsg::Output {
                target: self.name.clone(),
                data,
            })
            .await;
    }

    /// Absolute working directory for executing the target.
    pub fn working_dir(&self) -> PathBuf {
        join_rel(&self.project.base_dir, &self.target.working_dir())
    }

    pub fn script_file(&self) -> PathBuf {
        self.work_path.join(format!("{}.script", self.name))
    }

    pub fn log_file(&self) -> PathBuf {
        self.work_path.join(format!("{}.log", self.name))
    }

    pub fn cid_file(&self) -> PathBuf {
        self.work_path.join(format!("{}.cid", self.name))
    }

    /// The script to execute: the target's raw `script`, or one synthesized
    /// from `cmds`. Empty when the target defines neither.
    pub fn build_script(&self) -> String {
        let target = &self.target;
        if !target.script.is_empty() {
            return target.script.clone();
        }
        let lines: Vec<&str> = target.cmds.iter().filter_map(|c| c.shell()).collect();
        if lines.is_empty() {
            return String::new();
        }
        format!("#!/bin/sh\nset -e\n{}\n", lines.join("\n"))
    }

    /// Generate and write the script file at mode 0755. Returns the script.
    pub fn write_script_file(&self) -> Result<String> {
        let script = self.build_script();
        let path = self.script_file();
        fs::write(&path, &script)
            .with_context(|| format!("writing script file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("setting mode on {}", path.display()))?;
        }
        Ok(script)
    }
}

/// Path of the success-mark file for a target.
pub fn success_mark_file(work_path: &Path, name: &str) -> PathBuf {
    work_path.join(format!("{name}.success"))
}

/// Digest of the last successful run, if recorded.
pub fn read_success_mark(work_path: &Path, name: &str) -> Option<String> {
    match fs::read_to_string(success_mark_file(work_path, name)) {
        Ok(content) => {
            let digest = content.trim().to_string();
            (!digest.is_empty()).then_some(digest)
        }
        Err(_) => None,
    }
}

/// Persist the digest of a successful run.
pub fn write_success_mark(work_path: &Path, name: &str, digest: &str) -> io::Result<()> {
    fs::write(success_mark_file(work_path, name), digest)
}

/// Remove the success mark; missing files are fine.
pub fn clear_success_mark(work_path: &Path, name: &str) {
    let _ = fs::remove_file(success_mark_file(work_path, name));
}
