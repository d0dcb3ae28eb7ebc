use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier
///
/// Generated ids are UUID v4 strings, but lookups accept any string and
/// match it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Worker is executing
    Started,
    /// Worker finished successfully
    Success,
    /// Worker finished with an error
    Failure,
    /// Run was terminated by a cancellation request
    Canceled,
}

impl RunStatus {
    /// Check if the status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }

    /// Check whether `self -> next` is a permitted transition
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, Self::Started) && next.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies which pipeline definition a run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSelector {
    /// Pipeline name
    pub name: String,

    /// Optional subset of steps to execute, passed through to the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solid_subset: Option<Vec<String>>,
}

impl PipelineSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            solid_subset: None,
        }
    }

    pub fn with_solid_subset(mut self, subset: Vec<String>) -> Self {
        self.solid_subset = Some(subset);
        self
    }
}

/// Snapshot of a single run's lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Unique run ID
    pub run_id: RunId,

    /// Pipeline this run executes
    pub selector: PipelineSelector,

    /// Execution mode
    pub mode: String,

    /// Execution configuration, opaque to the registry
    #[serde(default)]
    pub config: serde_json::Value,

    /// Current status
    pub status: RunStatus,

    /// When the run was launched
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,

    /// Duration in milliseconds
    pub duration_ms: Option<u64>,
}

impl RunRecord {
    /// Create a new record in the `STARTED` state
    pub fn new(
        run_id: RunId,
        selector: PipelineSelector,
        mode: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            selector,
            mode: mode.into(),
            config,
            status: RunStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status. Callers must have checked the transition.
    pub(crate) fn finish(&mut self, status: RunStatus, finished_at: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(finished_at);
        let duration = finished_at.signed_duration_since(self.started_at);
        self.duration_ms = Some(duration.num_milliseconds().max(0) as u64);
    }
}
