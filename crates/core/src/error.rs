//! Error types for the core library

use thiserror::Error;

use crate::run::RunStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already registered: {0}")]
    DuplicateRun(String),

    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Worker error: {0}")]
    Worker(String),
}
