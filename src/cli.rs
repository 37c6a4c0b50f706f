// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `hmake`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "hmake",
    version,
    about = "Build inside containers: run a DAG of targets from a HyperMake project.",
    long_about = None
)]
pub struct CliArgs {
    /// Targets to run (name, glob, or /regex/). With --exec these are the
    /// command and its arguments instead.
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Change to this directory before locating the project.
    #[arg(long, short = 'C', value_name = "DIR")]
    pub chdir: Option<String>,

    /// Root file name to locate (default: HyperMake).
    #[arg(long, value_name = "FILE")]
    pub file: Option<String>,

    /// Maximum concurrent targets: negative = unlimited, 0 = CPU count.
    #[arg(long, short = 'p', value_name = "N", default_value_t = 0)]
    pub parallel: i32,

    /// Rebuild the required targets regardless of success marks.
    #[arg(long, short = 'R')]
    pub rebuild: bool,

    /// Rebuild a specific target regardless of success marks.
    #[arg(long = "rebuild-target", short = 'r', value_name = "NAME")]
    pub rebuild_target: Vec<String>,

    /// Rebuild everything regardless of success marks.
    #[arg(long = "rebuild-all", short = 'b')]
    pub rebuild_all: bool,

    /// Mark a target as skipped.
    #[arg(long, short = 's', value_name = "NAME")]
    pub skip: Vec<String>,

    /// Additional include pattern, as if listed in the root file.
    #[arg(long, short = 'I', value_name = "PATTERN")]
    pub include: Vec<String>,

    /// Define a property: dotted.key=value (value parsed as YAML).
    #[arg(long, short = 'P', value_name = "KEY=VALUE")]
    pub property: Vec<String>,

    /// Run an ad-hoc command in the exec-target's container context.
    #[arg(long)]
    pub exec: bool,

    /// Like --exec, against a specific target.
    #[arg(long = "exec-with", value_name = "NAME")]
    pub exec_with: Option<String>,

    /// Don't execute anything, mark started targets successful.
    #[arg(long)]
    pub dryrun: bool,

    /// Print the summary of the last run and exit.
    #[arg(long = "show-summary")]
    pub show_summary: bool,

    /// Stream target output to the terminal.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Write .hmake/hmake.debug.log during execution.
    #[arg(long = "debug-log")]
    pub debug_log: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `HMAKE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
