// src/lib.rs

pub mod cli;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod plan;
pub mod project;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_yaml::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::driver::DriverRegistry;
use crate::errors::Errors;
use crate::plan::{ExecEvent, ExecPlan, TaskResult};
use crate::project::{Project, ROOT_FILE};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - project location and loading (root file, rc overlays, includes)
/// - command-line property/include overrides
/// - plan construction (targets, rebuild/skip policy, parallelism)
/// - host signal handling feeding the two-stage cancel channel
///
/// Returns the process exit code: 0 on success, 1 on failure, 130 when the
/// run was aborted by a signal.
pub async fn run(args: CliArgs) -> Result<i32> {
    let start_dir = match &args.chdir {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let root_file = args.file.clone().unwrap_or_else(|| ROOT_FILE.to_string());

    let mut project = Project::locate_from(&start_dir, &root_file)?;
    project.load_rc_files()?;

    for pattern in &args.include {
        if !project.master_file.includes.contains(pattern) {
            project.master_file.includes.push(pattern.clone());
        }
    }
    project.resolve()?;
    project.merge_settings_flat(&parse_properties(&args.property)?);

    let exec_mode = args.exec || args.exec_with.is_some();
    let mut required: Vec<String> = Vec::new();
    if exec_mode {
        let name = exec_target_name(&project, &args)?;
        let target = project
            .master_file
            .targets
            .get_mut(&name)
            .ok_or_else(|| anyhow!("exec target {name} not defined"))?;
        target.exec = true;
        target.args = args.targets.clone();
        required.push(name);
    }

    project.finalize()?;
    let project = Arc::new(project);

    if args.show_summary {
        let summary = plan::summary::load_summary(&project.summary_file())?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(0);
    }

    if !exec_mode {
        required = resolve_required(&project, &args.targets)?;
    }
    if required.is_empty() {
        bail!(
            "no targets; available: {}",
            project.target_names().join(", ")
        );
    }

    let registry = Arc::new(DriverRegistry::builtin());
    let mut plan = ExecPlan::new(project.clone(), registry);
    plan.max_concurrency = args.parallel;
    plan.rebuild_all = args.rebuild_all;
    plan.dry_run = args.dryrun;
    plan.debug_log = args.debug_log;
    plan.require(&required)?;
    if args.rebuild {
        plan.rebuild(&required);
    }
    plan.rebuild(&complete_all(&project, &args.rebuild_target)?);
    plan.skip(&complete_all(&project, &args.skip)?);

    plan.on_event(renderer(args.verbose, project.work_path()));

    let cancel_rx = spawn_signal_relay();

    info!(targets = ?plan.required(), "executing plan");
    let result = plan.execute(cancel_rx).await;

    match result {
        Ok(()) => Ok(0),
        Err(err) => {
            eprintln!("{err:#}");
            if plan_aborted(&plan) {
                Ok(130)
            } else {
                Ok(1)
            }
        }
    }
}

/// Resolve CLI target references (patterns allowed) or fall back to the
/// project's `default-targets` setting.
fn resolve_required(project: &Project, targets: &[String]) -> Result<Vec<String>> {
    if !targets.is_empty() {
        return complete_all(project, targets);
    }
    let common = project.common_settings()?;
    Ok(common.default_targets)
}

fn complete_all(project: &Project, patterns: &[String]) -> Result<Vec<String>> {
    let mut errs = Errors::new();
    let mut out = Vec::new();
    for pattern in patterns {
        match project.target_names_match(pattern) {
            Ok(mut names) => out.append(&mut names),
            Err(e) => errs.add(e),
        }
    }
    errs.aggregate()?;
    let mut seen = std::collections::HashSet::new();
    out.retain(|name| seen.insert(name.clone()));
    Ok(out)
}

/// The target providing the container context for `--exec`.
fn exec_target_name(project: &Project, args: &CliArgs) -> Result<String> {
    if let Some(name) = &args.exec_with {
        return Ok(name.clone());
    }
    let common = project.common_settings()?;
    if !common.exec_target.is_empty() {
        return Ok(common.exec_target);
    }
    bail!("no exec-target defined for --exec")
}

/// Parse `-P dotted.key=value` pairs; values are parsed as YAML so numbers
/// and booleans keep their types.
fn parse_properties(props: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut flat = BTreeMap::new();
    for prop in props {
        let (key, value) = prop
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid property (expected key=value): {prop}"))?;
        let parsed: Value =
            serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        flat.insert(key.to_string(), parsed);
    }
    Ok(flat)
}

/// A minimal event renderer: one line per start/finish, output streamed when
/// verbose, and the task log replayed to stderr on failure otherwise.
fn renderer(verbose: bool, work_path: PathBuf) -> plan::EventHandler {
    Box::new(move |event: &ExecEvent| match event {
        ExecEvent::TaskStart { target } => {
            println!("=> {target}");
        }
        ExecEvent::TaskOutput { output, .. } => {
            if verbose {
                let _ = std::io::stdout().write_all(output);
            }
        }
        ExecEvent::TaskFinish {
            target,
            result,
            error,
        } => {
            println!("{} {target} [{result}]", result_mark(*result));
            if let Some(err) = error {
                eprintln!("{target}: {err}");
            }
            if !verbose && *result == TaskResult::Failure {
                replay_log(&work_path, target);
            }
        }
        ExecEvent::TaskActivated { target } => {
            debug!(target = %target, "task activated");
        }
        ExecEvent::TaskAbort {
            target,
            signal,
            abandon,
        } => {
            eprintln!(
                "{} {target} (signal {signal})",
                if *abandon { "abandoning" } else { "aborting" }
            );
        }
        ExecEvent::AbortRequested { tasks, abandon } => {
            eprintln!(
                "abort requested ({}): {}",
                if *abandon { "abandon" } else { "graceful" },
                tasks.join(", ")
            );
        }
    })
}

fn result_mark(result: TaskResult) -> &'static str {
    match result {
        TaskResult::Success | TaskResult::Started => "OK",
        TaskResult::Skipped => "--",
        TaskResult::Failure => "!!",
        TaskResult::Aborted => "><",
        TaskResult::Unknown => "??",
    }
}

fn replay_log(work_path: &std::path::Path, target: &str) {
    let path = work_path.join(format!("{target}.log"));
    if let Ok(content) = std::fs::read(&path) {
        let _ = std::io::stderr().write_all(&content);
    }
}

/// Relay host SIGINT/SIGTERM into the plan's cancel channel. The channel is
/// buffered at depth 2: first signal aborts gracefully, second abandons.
fn spawn_signal_relay() -> mpsc::Receiver<i32> {
    let (tx, rx) = mpsc::channel::<i32>(2);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(err) => {
                    eprintln!("failed to listen for SIGINT: {err}");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    eprintln!("failed to listen for SIGTERM: {err}");
                    return;
                }
            };
            loop {
                let sig = tokio::select! {
                    _ = interrupt.recv() => 2,
                    _ = terminate.recv() => 15,
                };
                if tx.send(sig).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if tx.send(2).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

fn plan_aborted(plan: &ExecPlan) -> bool {
    plan.summary()
        .iter()
        .any(|s| s.result.as_deref() == Some("Aborted"))
}
