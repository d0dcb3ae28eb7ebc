//! Worker handle interface
//!
//! A worker is the isolated unit (OS process, runtime task, ...) that
//! executes one run. Execution backends implement [`WorkerHandle`]; the
//! registry and the cancellation path only ever see the trait object.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// How a worker unit exited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Pipeline completed without error
    Succeeded,
    /// Pipeline failed or the unit exited abnormally
    Failed { reason: String },
    /// Unit exited after an accepted `terminate()`
    Terminated,
}

/// Invoked once when the worker unit exits
pub type CompletionCallback = Box<dyn FnOnce(WorkerOutcome) + Send + 'static>;

/// Capability set over one live worker unit
#[async_trait]
pub trait WorkerHandle: Send + Sync + fmt::Debug {
    /// Backend-specific identifier (pid, task label), once started
    fn worker_id(&self) -> Option<String>;

    /// Start the unit. Returns once it has been handed off; `on_complete`
    /// fires later from the backend's supervisor.
    async fn start(&self, on_complete: CompletionCallback) -> Result<()>;

    /// Whether the unit is still running
    fn is_alive(&self) -> bool;

    /// Stop the unit. Returns `true` only if it actually stopped because of
    /// this request; a unit that finished on its own reports `false`.
    async fn terminate(&self) -> bool;
}
