// src/plan/scheduler.rs

//! The execution loop.
//!
//! A single coordinator drives the plan: it dequeues ready tasks up to the
//! concurrency bound, spawns one worker per task and then blocks on either a
//! worker message or the caller's cancel channel. Cancellation is two-stage:
//! the first signal is forwarded to running tasks and stops further
//! dispatch; a second signal (or channel close) abandons the run.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::driver::Runner;
use crate::errors::{Errors, HmakeError};
use crate::plan::events::{ExecEvent, WorkerMsg};
use crate::plan::task::{
    clear_success_mark, read_success_mark, write_success_mark, TaskContext, TaskResult, TaskState,
};
use crate::plan::{effective_concurrency, ensure_work_dir, plan_log, ExecPlan};
use crate::project::watch::{build_watch_list, sha1_hex};
use crate::project::Target;

impl ExecPlan {
    /// Run the plan until the DAG is drained or the run is abandoned.
    ///
    /// `cancel` carries host signal numbers: the first value requests a
    /// graceful abort, a second value or a closed channel abandons the run
    /// immediately.
    pub async fn execute(&mut self, mut cancel: mpsc::Receiver<i32>) -> Result<()> {
        self.env.insert(
            "HMAKE_REQUIRED_TARGETS".to_string(),
            self.required_targets.join(" "),
        );

        if !self.dry_run {
            ensure_work_dir(&self.work_path)?;
        }
        self.open_debug_log();
        plan_log!(self, "RebuildAll = {}", self.rebuild_all);
        plan_log!(self, "Rebuild = {:?}", self.rebuild_targets);

        let concurrency = effective_concurrency(self.max_concurrency);
        plan_log!(self, "Concurrency = {concurrency:?}");

        let (msg_tx, mut msg_rx) = mpsc::channel::<WorkerMsg>(64);

        for name in self.queued.iter().cloned().collect::<Vec<_>>() {
            plan_log!(self, "Activate {name}");
            self.emit(&ExecEvent::TaskActivated { target: name });
        }

        let mut aborting = false;
        let mut abandon = false;

        loop {
            if !aborting {
                let room = match concurrency {
                    None => self.queued.len(),
                    Some(c) => c.saturating_sub(self.running.len()).min(self.queued.len()),
                };
                if room > 0 {
                    let batch: Vec<String> = self.queued.drain(..room).collect();
                    let before = self.running.len();
                    for name in &batch {
                        self.start_task(name, &msg_tx);
                    }
                    if self.running.len() < before + batch.len() {
                        // Some tasks finished immediately (skipped or failed
                        // to start); their completion may have queued more.
                        continue;
                    }
                }
            }

            if self.running.is_empty() {
                break;
            }

            tokio::select! {
                msg = msg_rx.recv() => {
                    match msg {
                        Some(WorkerMsg::Output { target, data }) => {
                            self.emit(&ExecEvent::TaskOutput { target, output: data });
                        }
                        Some(WorkerMsg::Done { target, result, error, runner }) => {
                            let (result, error) = if aborting && result == TaskResult::Failure {
                                (TaskResult::Aborted, error)
                            } else {
                                (result, error)
                            };
                            self.finish_task(&target, result, error, runner);
                        }
                        None => break,
                    }
                }
                sig = cancel.recv() => {
                    let signal = sig.unwrap_or(0);
                    if sig.is_some() && !aborting {
                        aborting = true;
                        plan_log!(self, "Abort requested, signal {signal}");
                        let running: Vec<String> = self.running.iter().cloned().collect();
                        for name in &running {
                            if let Some(tx) = self.cancel_senders.get(name) {
                                let _ = tx.try_send(signal);
                            }
                            self.emit(&ExecEvent::TaskAbort {
                                target: name.clone(),
                                signal,
                                abandon: false,
                            });
                        }
                        self.emit(&ExecEvent::AbortRequested { tasks: running, abandon: false });
                    } else {
                        abandon = true;
                        plan_log!(self, "Abandoning, signal {signal}");
                        let running: Vec<String> = self.running.iter().cloned().collect();
                        for name in &running {
                            if let Some(tx) = self.cancel_senders.get(name) {
                                let _ = tx.try_send(signal);
                            }
                            self.emit(&ExecEvent::TaskAbort {
                                target: name.clone(),
                                signal,
                                abandon: true,
                            });
                            if let Some(t) = self.tasks.get_mut(name) {
                                t.state = TaskState::Abandoned;
                                t.result = TaskResult::Aborted;
                                t.error = Some("abandoned".to_string());
                                t.finish_time = Some(Utc::now());
                            }
                        }
                        self.emit(&ExecEvent::AbortRequested { tasks: running, abandon: true });
                        break;
                    }
                }
            }
        }

        if abandon {
            // Hard cancel also tears down anything we left running in the
            // background (compose services).
            self.stop_background().await;
        }

        self.generate_summary();
        self.aggregate_errors(abandon)
    }

    /// Transition a queued task to running and either finish it immediately
    /// (skip, transit, setup failure) or hand it to a worker.
    fn start_task(&mut self, name: &str, msg_tx: &mpsc::Sender<WorkerMsg>) {
        let Some(target) = self.project.targets.get(name).cloned() else {
            return;
        };
        if let Some(t) = self.tasks.get_mut(name) {
            t.state = TaskState::Running;
            t.start_time = Some(Utc::now());
        }
        self.running.insert(name.to_string());
        plan_log!(self, "Start {name}");
        self.emit(&ExecEvent::TaskStart {
            target: name.to_string(),
        });

        let wl = build_watch_list(&self.project, &target);
        plan_log!(self, "{name} WatchList:\n{}", wl.text());

        if target.is_transit() {
            let digest = wl.digest();
            let skippable = self.decide_skippable(name, &target, &digest);
            if let Some(t) = self.tasks.get_mut(name) {
                t.current_digest = digest;
            }
            let result = if skippable {
                TaskResult::Skipped
            } else {
                TaskResult::Success
            };
            self.finish_task(name, result, None, None);
            return;
        }

        let ctx = Arc::new(TaskContext::new(
            &target,
            self.project.clone(),
            &self.env,
            &self.work_path,
            self.dry_run,
            msg_tx.clone(),
        ));
        let runner = match self.registry.create(ctx.clone()) {
            Ok(r) => r,
            Err(e) => {
                self.finish_task(name, TaskResult::Failure, Some(format!("{e:#}")), None);
                return;
            }
        };

        // Fold the driver signature into the skip digest so config changes
        // the watch-list cannot see still invalidate the cache.
        let signature = runner.signature();
        let digest = if signature.is_empty() {
            wl.digest()
        } else {
            sha1_hex(format!("{}{signature}", wl.text()).as_bytes())
        };
        let skippable = self.decide_skippable(name, &target, &digest);
        if let Some(t) = self.tasks.get_mut(name) {
            t.current_digest = digest;
        }

        if skippable {
            self.finish_task(name, TaskResult::Skipped, None, None);
            return;
        }

        let forced =
            self.rebuild_all || self.rebuild_targets.contains(name);
        if !self.dry_run {
            clear_success_mark(&self.work_path, name);
        }
        if let Some(t) = self.tasks.get_mut(name) {
            t.always_build = true;
        }
        if forced {
            self.invalidate_downstream(name);
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<i32>(2);
        self.cancel_senders.insert(name.to_string(), cancel_tx);

        let dry_run = self.dry_run;
        let tx = msg_tx.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            let mut error = None;
            let mut result = if dry_run {
                TaskResult::Success
            } else {
                match runner.run(cancel_rx).await {
                    Ok(r) => r,
                    Err(e) => {
                        error = Some(format!("{e:#}"));
                        TaskResult::Failure
                    }
                }
            };

            if result == TaskResult::Success && !dry_run {
                let ok = runner.validate_artifacts().await && artifact_globs_ok(&ctx);
                if !ok {
                    result = TaskResult::Failure;
                    error = Some(
                        HmakeError::ArtifactsMissing {
                            target: task_name.clone(),
                        }
                        .to_string(),
                    );
                }
            }

            let runner = (result == TaskResult::Started).then_some(runner);
            let _ = tx
                .send(WorkerMsg::Done {
                    target: task_name,
                    result,
                    error,
                    runner,
                })
                .await;
        });
    }

    /// The skip decision for one task given its current digest.
    ///
    /// An explicit skip request wins over everything, including
    /// `always: true`.
    fn decide_skippable(&self, name: &str, target: &Target, digest: &str) -> bool {
        let task = match self.tasks.get(name) {
            Some(t) => t,
            None => return false,
        };
        let stored = read_success_mark(&self.work_path, name);
        let mut skippable = stored.as_deref() == Some(digest) && !task.always_build;
        if target.is_transit() && task.dep_rebuilt {
            skippable = false;
        }
        if target.always {
            skippable = false;
        }
        if self.rebuild_all || self.rebuild_targets.contains(name) {
            skippable = false;
        }
        if self.skipped_targets.contains(name) {
            skippable = true;
        }
        skippable
    }

    /// Invalidate the success marks of every activating descendant. Used for
    /// explicit rebuilds, which must force downstream targets to run even if
    /// their own watch-lists are unchanged.
    fn invalidate_downstream(&mut self, name: &str) {
        let mut stack: Vec<String> = self
            .project
            .graph
            .activates_of(name)
            .iter()
            .cloned()
            .collect();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(n) = stack.pop() {
            if !visited.insert(n.clone()) {
                continue;
            }
            if !self.dry_run {
                clear_success_mark(&self.work_path, &n);
            }
            if let Some(t) = self.tasks.get_mut(&n) {
                t.always_build = true;
            }
            stack.extend(self.project.graph.activates_of(&n).iter().cloned());
        }
    }

    /// Record a task's terminal result, persist the success mark and promote
    /// newly activated dependents.
    fn finish_task(
        &mut self,
        name: &str,
        result: TaskResult,
        error: Option<String>,
        runner: Option<Box<dyn Runner>>,
    ) {
        if !self.running.remove(name) {
            // Completion from an abandoned worker; state was already settled.
            plan_log!(self, "OUT-OF-DATE {name} Result = {result}");
            return;
        }

        let digest = match self.tasks.get_mut(name) {
            Some(t) => {
                t.state = TaskState::Finished;
                t.result = result;
                t.error = error.clone();
                t.finish_time = if result == TaskResult::Skipped {
                    t.start_time.or_else(|| Some(Utc::now()))
                } else {
                    Some(Utc::now())
                };
                t.current_digest.clone()
            }
            None => return,
        };
        self.finished.push(name.to_string());
        self.cancel_senders.remove(name);
        plan_log!(self, "Finish {name} Result = {result}, Err = {error:?}");

        if result == TaskResult::Success && !self.dry_run && !digest.is_empty() {
            if let Err(e) = write_success_mark(&self.work_path, name, &digest) {
                plan_log!(self, "IGNORED: {name} write success mark error: {e}");
            }
        }

        if let Some(r) = runner {
            self.background.push((name.to_string(), r));
        }

        self.emit(&ExecEvent::TaskFinish {
            target: name.to_string(),
            result,
            error,
        });

        if !result.is_ok() {
            // Dependents stay waiting; the plan reports them as incomplete.
            return;
        }

        let activates: Vec<String> = self
            .project
            .graph
            .activates_of(name)
            .iter()
            .cloned()
            .collect();
        for act in activates {
            let mut ready = false;
            if let Some(t) = self.tasks.get_mut(&act) {
                t.depends.remove(name);
                if result != TaskResult::Skipped {
                    t.dep_rebuilt = true;
                }
                ready = t.is_activated();
            }
            if ready && self.waiting.remove(&act) {
                if let Some(t) = self.tasks.get_mut(&act) {
                    t.state = TaskState::Queued;
                }
                self.queued.push_back(act.clone());
                plan_log!(self, "Activate {act}");
                self.emit(&ExecEvent::TaskActivated { target: act });
            }
        }
    }

    /// Build and persist the summary covering every task in the plan.
    fn generate_summary(&mut self) {
        let mut summary = Vec::with_capacity(self.tasks.len());
        for name in &self.finished {
            if let Some(t) = self.tasks.get(name) {
                summary.push(crate::plan::TaskSummary::of(t));
            }
        }
        let mut rest: Vec<&String> = self.running.iter().collect();
        rest.sort();
        for name in rest {
            if let Some(t) = self.tasks.get(name) {
                summary.push(crate::plan::TaskSummary::of(t));
            }
        }
        for name in &self.queued {
            if let Some(t) = self.tasks.get(name) {
                summary.push(crate::plan::TaskSummary::of(t));
            }
        }
        let mut waiting: Vec<&String> = self.waiting.iter().collect();
        waiting.sort();
        for name in waiting {
            if let Some(t) = self.tasks.get(name) {
                summary.push(crate::plan::TaskSummary::of(t));
            }
        }
        self.summary = summary;

        if !self.dry_run {
            if let Err(e) =
                crate::plan::summary::write_summary(&self.project.summary_file(), &self.summary)
            {
                debug!(error = %e, "writing summary failed");
                plan_log!(self, "Write summary failed: {e:#}");
            }
        }
    }

    /// Aggregate per-task failures plus abandoned/incomplete conditions into
    /// the plan's single error.
    fn aggregate_errors(&self, abandon: bool) -> Result<()> {
        let mut errs = Errors::new();
        for name in &self.finished {
            let Some(t) = self.tasks.get(name) else {
                continue;
            };
            match t.result {
                TaskResult::Failure => match &t.error {
                    Some(e) => errs.add(anyhow::anyhow!("{name}: {e}")),
                    None => errs.add(anyhow::anyhow!("{name}: failed")),
                },
                TaskResult::Aborted => errs.add(HmakeError::Aborted {
                    target: name.clone(),
                }),
                _ => {}
            }
        }
        if abandon {
            let mut left: Vec<&String> = self.running.iter().collect();
            left.sort();
            for name in left {
                errs.add(HmakeError::Abandoned {
                    target: name.clone(),
                });
            }
        }
        if !self.queued.is_empty() || !self.waiting.is_empty() {
            let mut names: Vec<String> = self
                .queued
                .iter()
                .chain(self.waiting.iter())
                .cloned()
                .collect();
            names.sort();
            errs.add(HmakeError::Incomplete(names.join(",")));
        }
        errs.aggregate()
    }
}

/// Every artifact glob of the target must match at least one existing path.
fn artifact_globs_ok(ctx: &TaskContext) -> bool {
    for pattern in &ctx.target.artifacts {
        let rooted = ctx.target.project_path(pattern);
        match ctx.project.glob(&rooted) {
            Ok(paths) if !paths.is_empty() => {}
            _ => return false,
        }
    }
    true
}
