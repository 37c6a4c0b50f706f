// src/plan/mod.rs

//! Execution plans.
//!
//! A plan mirrors the required slice of the target DAG as [`Task`]s and runs
//! it with bounded parallelism. Construction is incremental (`require` adds
//! targets and their dependencies); execution is driven by
//! [`ExecPlan::execute`] in `scheduler.rs`.

pub mod events;
pub mod scheduler;
pub mod summary;
pub mod task;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::sync::mpsc;

use crate::driver::{DriverRegistry, Runner};
use crate::errors::{Errors, HmakeError};
use crate::project::{Project, WORK_FOLDER};

pub use events::{EventHandler, ExecEvent};
pub use summary::TaskSummary;
pub use task::{Task, TaskContext, TaskResult, TaskState};

/// Execution plan over a finalized project.
pub struct ExecPlan {
    pub project: Arc<Project>,
    /// Environment exported to every task (`HMAKE_*`).
    pub env: BTreeMap<String, String>,
    /// Full path to the work area (`<project>/.hmake`).
    pub work_path: PathBuf,
    /// `<0` unlimited, `0` CPU count, `>0` exact.
    pub max_concurrency: i32,
    /// Rebuild everything regardless of success marks.
    pub rebuild_all: bool,
    /// Write `.hmake/hmake.debug.log`.
    pub debug_log: bool,
    /// Skip real execution; every started task reports success.
    pub dry_run: bool,

    pub(crate) rebuild_targets: HashSet<String>,
    pub(crate) skipped_targets: HashSet<String>,
    pub(crate) required_targets: Vec<String>,
    pub(crate) tasks: HashMap<String, Task>,
    pub(crate) waiting: HashSet<String>,
    pub(crate) queued: VecDeque<String>,
    pub(crate) running: HashSet<String>,
    pub(crate) finished: Vec<String>,
    pub(crate) registry: Arc<DriverRegistry>,
    pub(crate) cancel_senders: HashMap<String, mpsc::Sender<i32>>,
    pub(crate) handler: Option<EventHandler>,
    pub(crate) background: Vec<(String, Box<dyn Runner>)>,
    pub(crate) summary: Vec<TaskSummary>,
    pub(crate) logger: DebugLog,
}

impl ExecPlan {
    pub fn new(project: Arc<Project>, registry: Arc<DriverRegistry>) -> Self {
        let work_path = project.work_path();
        let mut env = BTreeMap::new();
        env.insert(
            "HMAKE_VERSION".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        env.insert("HMAKE_PROJECT_NAME".to_string(), project.name.clone());
        env.insert(
            "HMAKE_PROJECT_DIR".to_string(),
            project.base_dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "HMAKE_PROJECT_FILE".to_string(),
            project.master_file.source.clone(),
        );
        env.insert(
            "HMAKE_WORK_DIR".to_string(),
            work_path.to_string_lossy().into_owned(),
        );
        env.insert(
            "HMAKE_LAUNCH_PATH".to_string(),
            project.launch_path.clone(),
        );
        env.insert("HMAKE_OS".to_string(), std::env::consts::OS.to_string());
        env.insert("HMAKE_ARCH".to_string(), std::env::consts::ARCH.to_string());

        Self {
            project,
            env,
            work_path,
            max_concurrency: 0,
            rebuild_all: false,
            debug_log: false,
            dry_run: false,
            rebuild_targets: HashSet::new(),
            skipped_targets: HashSet::new(),
            required_targets: Vec::new(),
            tasks: HashMap::new(),
            waiting: HashSet::new(),
            queued: VecDeque::new(),
            running: HashSet::new(),
            finished: Vec::new(),
            registry,
            cancel_senders: HashMap::new(),
            handler: None,
            background: Vec::new(),
            summary: Vec::new(),
            logger: DebugLog::disabled(),
        }
    }

    /// Subscribe to execution events.
    pub fn on_event(&mut self, handler: EventHandler) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    /// Force specific targets to rebuild regardless of success marks.
    pub fn rebuild(&mut self, targets: &[String]) -> &mut Self {
        self.rebuild_targets.extend(targets.iter().cloned());
        self
    }

    /// Force specific targets to be treated as skipped.
    pub fn skip(&mut self, targets: &[String]) -> &mut Self {
        self.skipped_targets.extend(targets.iter().cloned());
        self
    }

    /// Add targets (and, recursively, their dependencies) to the plan.
    pub fn require(&mut self, targets: &[String]) -> Result<()> {
        let mut errs = Errors::new();
        for name in targets {
            if !self.project.targets.contains_key(name) {
                errs.add(HmakeError::TargetNotDefined(name.clone()));
                continue;
            }
            if self.add_target(name) {
                self.required_targets.push(name.clone());
            }
        }
        errs.aggregate()
    }

    /// Idempotently add one target; returns true when newly added.
    fn add_target(&mut self, name: &str) -> bool {
        if self.tasks.contains_key(name) {
            return false;
        }
        let depends = self.project.graph.depends_of(name).clone();
        for dep in &depends {
            self.add_target(dep);
        }
        let mut t = Task::new(name, depends);
        if t.is_activated() {
            t.state = TaskState::Queued;
            self.queued.push_back(name.to_string());
        } else {
            self.waiting.insert(name.to_string());
        }
        self.tasks.insert(name.to_string(), t);
        true
    }

    /// Look up a task.
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Names of explicitly required targets, in require order.
    pub fn required(&self) -> &[String] {
        &self.required_targets
    }

    /// The post-run summary. Populated once execution finished.
    pub fn summary(&self) -> &[TaskSummary] {
        &self.summary
    }

    /// Stop background runners left over from `Started` results
    /// (compose-style services), latest first.
    pub async fn stop_background(&mut self) {
        while let Some((name, runner)) = self.background.pop() {
            if let Err(err) = runner.stop().await {
                self.logger.logf(format_args!("Stop {name} error: {err:#}"));
            }
        }
    }

    pub(crate) fn emit(&mut self, event: &ExecEvent) {
        if let Some(handler) = self.handler.as_mut() {
            handler(event);
        }
    }

    pub(crate) fn open_debug_log(&mut self) {
        if self.debug_log && !self.dry_run {
            self.logger = DebugLog::open(&self.project.debug_log_file());
        }
    }
}

/// Line-oriented debug log under the work area. Disabled unless requested;
/// all writes are best-effort.
pub(crate) struct DebugLog {
    file: Option<fs::File>,
}

impl DebugLog {
    fn disabled() -> Self {
        Self { file: None }
    }

    fn open(path: &std::path::Path) -> Self {
        Self {
            file: fs::File::create(path).ok(),
        }
    }

    pub(crate) fn logf(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(f) = self.file.as_mut() {
            let _ = writeln!(f, "hmake: {} {}", Local::now().format("%H:%M:%S"), args);
        }
    }
}

/// Shorthand used by the scheduler internals.
macro_rules! plan_log {
    ($plan:expr, $($arg:tt)*) => {
        $plan.logger.logf(format_args!($($arg)*))
    };
}
pub(crate) use plan_log;

/// Resolve the effective concurrency: `<0` unlimited, `0` CPU count.
pub(crate) fn effective_concurrency(max: i32) -> Option<usize> {
    match max {
        n if n < 0 => None,
        0 => Some(num_cpus::get()),
        n => Some(n as usize),
    }
}

/// Ensure the work area exists. This is the only fatal filesystem condition.
pub(crate) fn ensure_work_dir(work_path: &std::path::Path) -> Result<()> {
    fs::create_dir_all(work_path).map_err(|e| {
        anyhow::anyhow!(
            "cannot create work dir {} ({}): {e}",
            work_path.display(),
            WORK_FOLDER
        )
    })
}
