//! Run lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run_model::{RunId, RunStatus};

/// Lifecycle event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Run this event belongs to
    pub run_id: RunId,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// The event payload
    #[serde(flatten)]
    pub event: RunEventType,
}

/// Type of lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum RunEventType {
    /// Record registered and worker handed off
    RunStarted { pipeline: String, mode: String },

    /// Record reached a terminal status
    RunFinished { status: RunStatus },

    /// A cancellation request signalled the worker
    TerminationRequested,

    /// The worker could not be signalled
    TerminationRefused,
}

impl RunEvent {
    pub fn new(run_id: RunId, event: RunEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn run_started(run_id: RunId, pipeline: String, mode: String) -> Self {
        Self::new(run_id, RunEventType::RunStarted { pipeline, mode })
    }

    pub fn run_finished(run_id: RunId, status: RunStatus) -> Self {
        Self::new(run_id, RunEventType::RunFinished { status })
    }

    pub fn termination_requested(run_id: RunId) -> Self {
        Self::new(run_id, RunEventType::TerminationRequested)
    }

    pub fn termination_refused(run_id: RunId) -> Self {
        Self::new(run_id, RunEventType::TerminationRefused)
    }
}
