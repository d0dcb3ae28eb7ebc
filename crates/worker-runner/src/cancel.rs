//! Cancellation coordinator
//!
//! Resolves a termination request against the registry. The terminate
//! signal is sent outside the record lock; whether the run ends up
//! `CANCELED` is decided only by `compare_and_transition`, so a worker
//! that finishes on its own in the meantime wins cleanly.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dagrun_core::{RunEvent, RunId, RunLookup, RunRegistry, RunStatus, WorkerHandle};

use crate::error::{ExecutorError, Result};

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No run with this id
    NotFound,
    /// Worker signalled and run moved to `CANCELED`
    Success,
    /// Run could not be cancelled
    Failure(CancelFailure),
}

/// Why a cancellation did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelFailure {
    /// Run was already final when the request arrived
    AlreadyTerminal { status: RunStatus },
    /// Worker could not be signalled; the run is still `STARTED`
    TerminationRefused,
    /// Worker was signalled but finalized the run first
    RaceLost { status: RunStatus },
}

impl CancelFailure {
    pub fn message(&self, run_id: &RunId) -> String {
        match self {
            Self::AlreadyTerminal { status } | Self::RaceLost { status } => format!(
                "Run {} is not in a started state. Current status is {}.",
                run_id, status
            ),
            Self::TerminationRefused => format!("Unable to terminate run {}", run_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancellationCoordinator {
    registry: Arc<RunRegistry>,
    events: broadcast::Sender<RunEvent>,
}

impl CancellationCoordinator {
    pub fn new(registry: Arc<RunRegistry>, events: broadcast::Sender<RunEvent>) -> Self {
        Self { registry, events }
    }

    /// Cancel a run
    ///
    /// Every race resolves to an outcome; `Err` is returned only when the
    /// registry contradicts itself.
    pub async fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome> {
        let handle = match self.registry.lookup(run_id) {
            RunLookup::Missing => {
                debug!("Cancel requested for unknown run {}", run_id);
                return Ok(CancelOutcome::NotFound);
            }
            RunLookup::Terminal(status) => {
                debug!("Cancel requested for run {} which is {}", run_id, status);
                return Ok(CancelOutcome::Failure(CancelFailure::AlreadyTerminal {
                    status,
                }));
            }
            RunLookup::Active(handle) => handle,
        };

        // Detached so a dropped caller cannot leave a signalled run STARTED.
        let task = tokio::spawn(terminate_and_finalize(
            Arc::clone(&self.registry),
            self.events.clone(),
            run_id.clone(),
            handle,
        ));
        task.await?
    }
}

async fn terminate_and_finalize(
    registry: Arc<RunRegistry>,
    events: broadcast::Sender<RunEvent>,
    run_id: RunId,
    handle: Arc<dyn WorkerHandle>,
) -> Result<CancelOutcome> {
    info!(
        "Terminating run {} (worker {})",
        run_id,
        handle.worker_id().unwrap_or_else(|| "unstarted".to_string())
    );
    let accepted = handle.terminate().await;
    drop(handle);

    if !accepted {
        return match registry.status(&run_id) {
            Some(RunStatus::Started) => {
                warn!("Unable to terminate run {}", run_id);
                let _ = events.send(RunEvent::termination_refused(run_id));
                Ok(CancelOutcome::Failure(CancelFailure::TerminationRefused))
            }
            // Worker exited on its own before the signal could land.
            Some(status) => Ok(CancelOutcome::Failure(CancelFailure::AlreadyTerminal {
                status,
            })),
            None => Err(corrupted(&run_id, "record vanished after lookup")),
        };
    }
    let _ = events.send(RunEvent::termination_requested(run_id.clone()));

    match registry.compare_and_transition(&run_id, RunStatus::Started, RunStatus::Canceled, Utc::now()) {
        Ok(true) => {
            info!("Run {} canceled", run_id);
            let _ = events.send(RunEvent::run_finished(run_id, RunStatus::Canceled));
            Ok(CancelOutcome::Success)
        }
        Ok(false) => {
            let status = registry
                .status(&run_id)
                .ok_or_else(|| corrupted(&run_id, "record vanished after transition"))?;
            info!(
                "Run {} finished as {} before cancellation took effect",
                run_id, status
            );
            Ok(CancelOutcome::Failure(CancelFailure::RaceLost { status }))
        }
        Err(dagrun_core::Error::RunNotFound(_)) => {
            Err(corrupted(&run_id, "record vanished during transition"))
        }
        Err(e) => Err(e.into()),
    }
}

fn corrupted(run_id: &RunId, message: &str) -> ExecutorError {
    ExecutorError::RegistryCorrupted {
        run_id: run_id.to_string(),
        message: message.to_string(),
    }
}
