// src/plan/events.rs

use crate::driver::Runner;
use crate::plan::task::TaskResult;

/// Events emitted during plan execution.
///
/// Delivery is serialized: the coordinator invokes the handler for its own
/// events and for task output relayed from workers, so a handler never sees
/// concurrent calls.
#[derive(Debug)]
pub enum ExecEvent {
    /// A task entered the running state.
    TaskStart { target: String },
    /// A task reached a terminal result.
    TaskFinish {
        target: String,
        result: TaskResult,
        error: Option<String>,
    },
    /// A task moved from waiting to queued.
    TaskActivated { target: String },
    /// Output bytes from a task's process.
    TaskOutput { target: String, output: Vec<u8> },
    /// A running task was told to abort.
    TaskAbort {
        target: String,
        signal: i32,
        abandon: bool,
    },
    /// Cancellation was requested for the whole plan.
    AbortRequested { tasks: Vec<String>, abandon: bool },
}

/// Receives execution events; called only from the coordinator.
pub type EventHandler = Box<dyn FnMut(&ExecEvent) + Send>;

/// Messages workers post back to the coordinator.
pub(crate) enum WorkerMsg {
    Output {
        target: String,
        data: Vec<u8>,
    },
    Done {
        target: String,
        result: TaskResult,
        error: Option<String>,
        /// Returned for `Started` results so the plan can stop the runner
        /// later.
        runner: Option<Box<dyn Runner>>,
    },
}
