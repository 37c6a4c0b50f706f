// src/driver/mod.rs

//! Pluggable exec-drivers.
//!
//! A [`Runner`] is the capability set a driver exposes for one task. Drivers
//! are registered in a [`DriverRegistry`] built at the composition root; a
//! target selects its driver through the `exec-driver` field, the
//! `exec-driver` setting, or the registry default.

pub mod docker;
pub mod ids;
pub mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::errors::HmakeError;
use crate::plan::task::{TaskContext, TaskResult};

/// Receives host signal numbers forwarded by the scheduler on cancellation.
/// Buffered at depth 2 so a worker always observes the latest stage.
pub type SignalReceiver = mpsc::Receiver<i32>;

/// Capability set of a driver bound to one task.
pub trait Runner: Send + Sync {
    /// Execute the task. Cancellation signals arrive on `cancel`; the runner
    /// forwards them to whatever it is running.
    fn run(&self, cancel: SignalReceiver) -> BoxFuture<'_, Result<TaskResult>>;

    /// Driver contribution to the skip digest: a deterministic encoding of
    /// every driver-relevant piece of target config. Empty means the driver
    /// adds nothing beyond the watch-list.
    fn signature(&self) -> String {
        String::new()
    }

    /// Check that everything the task promised to produce exists.
    fn validate_artifacts(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }

    /// Tear down background work left over from a `Started` result.
    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Creates a [`Runner`] for a task.
pub type RunnerFactory = Arc<dyn Fn(Arc<TaskContext>) -> Result<Box<dyn Runner>> + Send + Sync>;

/// Name of the settings key selecting a driver.
pub const SETTING_EXEC_DRIVER: &str = "exec-driver";

/// Maps driver names to factories.
pub struct DriverRegistry {
    factories: HashMap<String, RunnerFactory>,
    default_driver: String,
}

impl DriverRegistry {
    /// An empty registry with no default.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_driver: String::new(),
        }
    }

    /// The standard registry: shell and docker drivers, docker as default.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(shell::DRIVER_NAME, Arc::new(shell::factory));
        reg.register(docker::DRIVER_NAME, Arc::new(docker::factory));
        reg.set_default(docker::DRIVER_NAME);
        reg
    }

    pub fn register(&mut self, name: &str, factory: RunnerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn set_default(&mut self, name: &str) {
        self.default_driver = name.to_string();
    }

    /// Resolve the driver for the task and create its runner.
    pub fn create(&self, ctx: Arc<TaskContext>) -> Result<Box<dyn Runner>> {
        let mut driver = ctx.target.exec_driver.clone();
        if driver.is_empty() {
            driver = ctx
                .project
                .target_settings_as::<String>(&ctx.target, SETTING_EXEC_DRIVER)?;
        }
        if driver.is_empty() {
            driver = self.default_driver.clone();
        }
        let factory = self
            .factories
            .get(&driver)
            .ok_or(HmakeError::InvalidExecDriver(driver))?;
        factory(ctx)
    }
}
