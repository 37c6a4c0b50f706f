// src/errors.rs

//! Crate-wide error types.
//!
//! Most plumbing uses `anyhow` with context, matching the rest of the code.
//! `HmakeError` carries the conditions callers match on (exit codes, summary
//! rendering); `Errors` collects per-item failures from the loader, composer
//! and scheduler into a single aggregate.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HmakeError {
    #[error("{file}: unsupported format: {format}")]
    UnsupportedFormat { file: String, format: String },

    #[error("{file}: illegal target name '{name}': {reason}")]
    IllegalName {
        file: String,
        name: String,
        reason: String,
    },

    #[error("image name missing after #hmake-wrapper")]
    WrapperImageMissing,

    #[error("target already exists: {0}")]
    DuplicateExpandedTarget(String),

    #[error("duplicated target {name} defined in {source1} and {source2}")]
    DuplicateTarget {
        name: String,
        source1: String,
        source2: String,
    },

    #[error("{target}({source_file}): {relation} {name} which is not defined")]
    UnknownDependency {
        target: String,
        source_file: String,
        relation: String,
        name: String,
    },

    #[error("{target}({source_file}): cyclic dependency")]
    CyclicDependency { target: String, source_file: String },

    #[error("target {0} not defined")]
    TargetNotDefined(String),

    #[error("{target}: missing property {property}")]
    MissingProperty { target: String, property: String },

    #[error("invalid exec-driver: {0}")]
    InvalidExecDriver(String),

    #[error("{target}: artifacts missing")]
    ArtifactsMissing { target: String },

    #[error("{target}: aborted")]
    Aborted { target: String },

    #[error("{target}: abandoned")]
    Abandoned { target: String },

    #[error("execution incomplete: tasks not activated: {0}")]
    Incomplete(String),

    #[error("project path not supported for container mounts: {0}")]
    ProjectPathUnsupported(String),

    #[error("project name is required")]
    ProjectNameMissing,
}

/// Collects multiple errors and reports them as one.
///
/// The loader and composer keep going after individual files fail so the user
/// sees every problem at once; the scheduler does the same across tasks.
#[derive(Debug, Default)]
pub struct Errors {
    list: Vec<anyhow::Error>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, err: impl Into<anyhow::Error>) {
        self.list.push(err.into());
    }

    /// Record the error of a result, if any. Returns true when an error was
    /// recorded, which callers use to `continue` a loop.
    pub fn add_result<T>(&mut self, res: Result<T, impl Into<anyhow::Error>>) -> bool {
        match res {
            Ok(_) => false,
            Err(e) => {
                self.add(e);
                true
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Consume the collection, yielding `Ok(())` when nothing was recorded.
    pub fn aggregate(self) -> anyhow::Result<()> {
        if self.list.is_empty() {
            Ok(())
        } else {
            Err(anyhow::Error::new(self))
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, err) in self.list.iter().enumerate() {
            if n > 0 {
                writeln!(f)?;
            }
            write!(f, "{err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}
