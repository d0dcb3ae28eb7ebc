//! Worker Runner - run execution and cancellation
//!
//! This crate launches pipeline runs as isolated worker units (child
//! processes or runtime tasks), finalizes them when the worker exits, and
//! resolves cancellation requests that race with natural completion.

mod cancel;
mod error;
mod executor;
mod launcher;
mod process;
mod report;
mod task;

pub use cancel::{CancelFailure, CancelOutcome, CancellationCoordinator};
pub use error::{ExecutorError, Result};
pub use executor::{ExecutionManager, ExecutorConfig};
pub use launcher::{LaunchRequest, WorkerLauncher, DEFAULT_MODE};
pub use process::{
    PipelineCommand, ProcessLauncher, ProcessWorker, ENV_MODE, ENV_PIPELINE, ENV_RUN_CONFIG,
    ENV_RUN_ID, ENV_SOLID_SUBSET,
};
pub use report::{StartExecutionResult, TerminateExecutionResult};
pub use task::{Pipeline, PipelineContext, TaskLauncher, TaskWorker};
