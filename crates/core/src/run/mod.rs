pub mod event;
mod registry;
mod run_model;

pub use event::{RunEvent, RunEventType};
pub use registry::{RunLookup, RunRegistry};
pub use run_model::{PipelineSelector, RunId, RunRecord, RunStatus};
