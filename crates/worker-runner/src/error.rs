//! Error types for worker-runner

use thiserror::Error;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while launching or cancelling runs
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Registry rejected an operation
    #[error("Registry error: {0}")]
    Registry(#[from] dagrun_core::Error),

    /// No pipeline registered under the selector's name
    #[error("Pipeline not found: {name}")]
    PipelineNotFound { name: String },

    /// Pipeline does not support the requested mode
    #[error("Pipeline {pipeline} has no mode {mode}")]
    InvalidMode { pipeline: String, mode: String },

    /// Run configuration cannot be passed to the worker
    #[error("Invalid run config: {message}")]
    InvalidConfig { message: String },

    /// Registry state contradicts an earlier observation
    #[error("Registry corrupted for run {run_id}: {message}")]
    RegistryCorrupted { run_id: String, message: String },

    /// Cancellation task did not complete
    #[error("Cancellation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether the launch request itself was invalid
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound { .. } | Self::InvalidMode { .. } | Self::InvalidConfig { .. }
        )
    }
}
