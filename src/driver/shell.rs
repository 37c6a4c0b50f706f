// src/driver/shell.rs

//! The shell exec-driver.
//!
//! Builds a script from the target's `script`/`cmds`, writes it into the
//! work area and runs it as a child process with stdout/stderr teed to the
//! task log and the event stream. Cancellation forwards the host signal to
//! the child and waits for it to exit on its own.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{Runner, SignalReceiver};
use crate::plan::task::{TaskContext, TaskResult};

pub const DRIVER_NAME: &str = "shell";

/// Shell-specific keys from the target's extension bag.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellExt {
    /// Attach the child directly to the terminal instead of teeing output.
    #[serde(default)]
    pub console: bool,
    /// Extra environment entries.
    #[serde(default)]
    pub env: Vec<String>,
}

pub struct ShellRunner {
    ctx: Arc<TaskContext>,
}

pub fn factory(ctx: Arc<TaskContext>) -> Result<Box<dyn Runner>> {
    Ok(Box::new(ShellRunner { ctx }))
}

impl Runner for ShellRunner {
    fn run(&self, mut cancel: SignalReceiver) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let script = self.ctx.write_script_file()?;
            if script.is_empty() {
                // Nothing to execute.
                return Ok(TaskResult::Success);
            }
            let script_file = self.ctx.script_file();
            let status = Executor::new(&self.ctx, &script_file.to_string_lossy(), &[])
                .run(Some(&mut cancel))
                .await?;
            if status.success() {
                Ok(TaskResult::Success)
            } else {
                Err(anyhow!(
                    "{}: exited with {status}",
                    self.ctx.name
                ))
            }
        })
    }

    fn signature(&self) -> String {
        self.ctx.build_script()
    }
}

/// How child output is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// Tee stdout+stderr to the task log and the event stream.
    Tee,
    /// Discard stdout, keep stderr teed. Used where stdout carries data a
    /// caller consumes elsewhere (container ids).
    MuteStdout,
    /// Discard both streams.
    Mute,
}

/// Wraps a child process invocation for a task: environment assembly,
/// working directory, output tee and cooperative cancellation.
pub struct Executor {
    command: Command,
    ctx_name: String,
    console: bool,
    mode: OutputMode,
    log_path: std::path::PathBuf,
    output: OutputSink,
}

/// Clonable handle publishing output chunks as task events.
#[derive(Clone)]
pub(crate) struct OutputSink {
    ctx: Arc<TaskContext>,
}

impl OutputSink {
    async fn publish(&self, line: String) {
        let mut data = line.into_bytes();
        data.push(b'\n');
        self.ctx.write_output(data).await;
    }
}

impl Executor {
    /// Build an executor with the task's full environment: host environment,
    /// target env entries, shell ext env and the plan's `HMAKE_*` variables.
    /// The working directory is the target's.
    pub fn new(ctx: &Arc<TaskContext>, program: &str, args: &[String]) -> Self {
        let ext: ShellExt = ctx.target_shell_ext();
        let mut command = Command::new(program);
        command.args(args);
        for env in ctx.target.envs.iter().chain(ext.env.iter()) {
            if let Some((name, value)) = env.split_once('=') {
                command.env(name, value);
            }
        }
        for (name, value) in &ctx.env {
            command.env(name, value);
        }
        command.current_dir(ctx.working_dir());
        command.kill_on_drop(false);
        Self {
            command,
            ctx_name: ctx.name.clone(),
            console: ext.console,
            mode: OutputMode::Tee,
            log_path: ctx.log_file(),
            output: OutputSink { ctx: ctx.clone() },
        }
    }

    /// Replace the task environment with the plain host environment. Used by
    /// container clients which receive task env through `-e` flags instead.
    pub fn host_env(mut self) -> Self {
        self.command.env_clear();
        for (name, value) in std::env::vars() {
            self.command.env(name, value);
        }
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.command.current_dir(dir);
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    /// Discard all output.
    pub fn mute(mut self) -> Self {
        self.mode = OutputMode::Mute;
        self
    }

    /// Discard stdout only.
    pub fn mute_stdout(mut self) -> Self {
        self.mode = OutputMode::MuteStdout;
        self
    }

    /// Run to completion, forwarding cancellation signals to the child.
    pub async fn run(self, cancel: Option<&mut SignalReceiver>) -> Result<std::process::ExitStatus> {
        let name = self.ctx_name.clone();
        self.run_with_signal(cancel, move |child, sig| {
            debug!(task = %name, signal = sig, "forwarding signal to child");
            send_signal(child, sig);
        })
        .await
    }

    /// Run to completion with a custom signal handler; `on_signal` receives
    /// the child and the host signal number.
    pub async fn run_with_signal<F>(
        mut self,
        cancel: Option<&mut SignalReceiver>,
        mut on_signal: F,
    ) -> Result<std::process::ExitStatus>
    where
        F: FnMut(&Child, i32),
    {
        let mut readers: Vec<JoinHandle<()>> = Vec::new();

        if self.console {
            self.command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            self.command.stdin(Stdio::null());
            match self.mode {
                OutputMode::Tee => {
                    self.command.stdout(Stdio::piped()).stderr(Stdio::piped());
                }
                OutputMode::MuteStdout => {
                    self.command.stdout(Stdio::null()).stderr(Stdio::piped());
                }
                OutputMode::Mute => {
                    self.command.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }
        }

        let mut child = self
            .command
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", self.ctx_name))?;

        if !self.console && self.mode != OutputMode::Mute {
            let log = std::fs::File::create(&self.log_path)
                .with_context(|| format!("opening log file {}", self.log_path.display()))?;
            let log = Arc::new(Mutex::new(log));

            if let Some(stdout) = child.stdout.take() {
                readers.push(spawn_reader(stdout, log.clone(), self.output.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(spawn_reader(stderr, log.clone(), self.output.clone()));
            }
        }

        let status = match cancel {
            None => child.wait().await,
            Some(rx) => {
                let mut rx_open = true;
                loop {
                    if !rx_open {
                        break child.wait().await;
                    }
                    tokio::select! {
                        status = child.wait() => break status,
                        sig = rx.recv() => match sig {
                            Some(s) => on_signal(&child, s),
                            None => rx_open = false,
                        },
                    }
                }
            }
        }
        .with_context(|| format!("waiting for process of task '{}'", self.ctx_name))?;

        // Drain output before reporting completion so every TaskOutput
        // precedes TaskFinish.
        for handle in readers {
            let _ = handle.await;
        }

        Ok(status)
    }
}

fn spawn_reader<R>(stream: R, log: Arc<Mutex<std::fs::File>>, output: OutputSink) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use std::io::Write;
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut f) = log.lock() {
                let _ = writeln!(f, "{line}");
            }
            output.publish(line).await;
        }
    })
}

/// Deliver a host signal to the child process.
#[cfg(unix)]
pub fn send_signal(child: &Child, sig: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let Some(pid) = child.id() else { return };
    let signal = Signal::try_from(sig).unwrap_or(Signal::SIGTERM);
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, signal = sig, error = %err, "failed to signal child");
    }
}

#[cfg(not(unix))]
pub fn send_signal(child: &Child, _sig: i32) {
    if let Some(pid) = child.id() {
        debug!(pid, "signal delivery unsupported on this platform");
    }
}

impl TaskContext {
    /// Shell view of the extension bag; invalid shapes fall back to default.
    pub(crate) fn target_shell_ext(&self) -> ShellExt {
        self.project
            .target_settings_with_ext(&self.target, "shell")
            .unwrap_or_default()
    }
}
