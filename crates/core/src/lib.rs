//! Core library for dagrun
//!
//! This crate contains the run-lifecycle primitives shared by the
//! executor and the API server:
//! - Run records and their state machine
//! - The run registry with its compare-and-transition primitive
//! - The worker handle interface implemented by execution backends

pub mod error;
pub mod run;
pub mod worker;

pub use error::Error;
pub use run::{
    PipelineSelector, RunEvent, RunEventType, RunId, RunLookup, RunRecord, RunRegistry, RunStatus,
};
pub use worker::{CompletionCallback, WorkerHandle, WorkerOutcome};

pub type Result<T> = std::result::Result<T, Error>;
