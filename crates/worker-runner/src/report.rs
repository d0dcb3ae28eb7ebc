//! Result shapes handed to the API boundary

use serde::{Deserialize, Serialize};

use dagrun_core::RunId;

use crate::cancel::CancelOutcome;
use crate::error::Result;

/// Response to a start-execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StartExecutionResult {
    #[serde(rename_all = "camelCase")]
    Success { run_id: RunId },
    ValidationError { message: String },
}

impl StartExecutionResult {
    /// Map a launch result; errors that are not validation errors pass through
    pub fn from_launch(result: Result<RunId>) -> Result<Self> {
        match result {
            Ok(run_id) => Ok(Self::Success { run_id }),
            Err(e) if e.is_validation() => Ok(Self::ValidationError {
                message: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

/// Response to a terminate-execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TerminateExecutionResult {
    #[serde(rename_all = "camelCase")]
    Success { run_id: RunId },
    #[serde(rename_all = "camelCase")]
    Failure { run_id: RunId, message: String },
    #[serde(rename_all = "camelCase")]
    NotFound { run_id: RunId },
}

impl TerminateExecutionResult {
    pub fn from_outcome(run_id: RunId, outcome: &CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::NotFound => Self::NotFound { run_id },
            CancelOutcome::Success => Self::Success { run_id },
            CancelOutcome::Failure(failure) => Self::Failure {
                message: failure.message(&run_id),
                run_id,
            },
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Success { run_id } | Self::Failure { run_id, .. } | Self::NotFound { run_id } => {
                run_id
            }
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failure { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelFailure;
    use crate::error::ExecutorError;
    use dagrun_core::RunStatus;
    use serde_json::json;

    #[test]
    fn test_terminate_result_shapes() {
        let run_id = RunId::from("run-7");

        let success = TerminateExecutionResult::from_outcome(run_id.clone(), &CancelOutcome::Success);
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({"kind": "Success", "runId": "run-7"})
        );

        let not_found =
            TerminateExecutionResult::from_outcome(run_id.clone(), &CancelOutcome::NotFound);
        assert_eq!(
            serde_json::to_value(&not_found).unwrap(),
            json!({"kind": "NotFound", "runId": "run-7"})
        );

        let failure = TerminateExecutionResult::from_outcome(
            run_id,
            &CancelOutcome::Failure(CancelFailure::AlreadyTerminal {
                status: RunStatus::Canceled,
            }),
        );
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({
                "kind": "Failure",
                "runId": "run-7",
                "message": "Run run-7 is not in a started state. Current status is CANCELED."
            })
        );
        assert_eq!(failure.run_id().as_str(), "run-7");
    }

    #[test]
    fn test_start_result_from_launch() {
        let ok = StartExecutionResult::from_launch(Ok(RunId::from("run-1"))).unwrap();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"kind": "Success", "runId": "run-1"})
        );

        let invalid = StartExecutionResult::from_launch(Err(ExecutorError::PipelineNotFound {
            name: "missing".to_string(),
        }))
        .unwrap();
        assert_eq!(
            invalid,
            StartExecutionResult::ValidationError {
                message: "Pipeline not found: missing".to_string()
            }
        );

        let corrupted = ExecutorError::RegistryCorrupted {
            run_id: "run-1".to_string(),
            message: "record vanished".to_string(),
        };
        assert!(StartExecutionResult::from_launch(Err(corrupted)).is_err());
    }
}
