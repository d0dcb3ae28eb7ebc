//! Launcher seam between the execution manager and worker backends

use std::sync::Arc;

use dagrun_core::{PipelineSelector, RunId, WorkerHandle};

use crate::error::{ExecutorError, Result};

/// Mode used when a pipeline declares none
pub const DEFAULT_MODE: &str = "default";

/// Everything a backend needs to build the worker for one run
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_id: RunId,
    pub selector: PipelineSelector,
    pub mode: String,
    pub config: serde_json::Value,
}

/// Builds worker handles for launch requests
///
/// `prepare` resolves the selector and validates the request without
/// starting anything; the execution manager registers the run first and
/// only then starts the returned handle.
pub trait WorkerLauncher: Send + Sync {
    fn prepare(&self, request: &LaunchRequest) -> Result<Arc<dyn WorkerHandle>>;
}

pub(crate) fn default_modes() -> Vec<String> {
    vec![DEFAULT_MODE.to_string()]
}

pub(crate) fn check_mode(pipeline: &str, modes: &[String], mode: &str) -> Result<()> {
    if modes.iter().any(|m| m == mode) {
        Ok(())
    } else {
        Err(ExecutorError::InvalidMode {
            pipeline: pipeline.to_string(),
            mode: mode.to_string(),
        })
    }
}

/// Run config must be a JSON object (or absent)
pub(crate) fn check_config(config: &serde_json::Value) -> Result<()> {
    match config {
        serde_json::Value::Object(_) | serde_json::Value::Null => Ok(()),
        other => Err(ExecutorError::invalid_config(format!(
            "expected an object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
