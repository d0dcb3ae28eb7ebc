//! Execution manager - launches runs and supervises their workers

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use dagrun_core::{
    CompletionCallback, PipelineSelector, RunEvent, RunId, RunRecord, RunRegistry, RunStatus,
    WorkerOutcome,
};

use crate::cancel::{CancelOutcome, CancellationCoordinator};
use crate::error::Result;
use crate::launcher::{LaunchRequest, WorkerLauncher};

/// Configuration for the execution manager
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1000,
        }
    }
}

/// Owns the run registry and maps launch requests to supervised workers
pub struct ExecutionManager {
    registry: Arc<RunRegistry>,
    launcher: Arc<dyn WorkerLauncher>,
    events: broadcast::Sender<RunEvent>,
    coordinator: CancellationCoordinator,
}

impl ExecutionManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::with_config(launcher, ExecutorConfig::default())
    }

    pub fn with_config(launcher: Arc<dyn WorkerLauncher>, config: ExecutorConfig) -> Self {
        let registry = Arc::new(RunRegistry::new());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let coordinator = CancellationCoordinator::new(Arc::clone(&registry), events.clone());

        Self {
            registry,
            launcher,
            events,
            coordinator,
        }
    }

    /// Launch a run
    ///
    /// Returns once the record is registered and the worker has been handed
    /// off; it does not wait for the run to finish. Validation errors leave
    /// no record behind. A worker that fails to start leaves a `FAILURE`
    /// record and its id is still returned.
    pub async fn launch(
        &self,
        selector: PipelineSelector,
        mode: impl Into<String>,
        config: serde_json::Value,
    ) -> Result<RunId> {
        let request = LaunchRequest {
            run_id: RunId::generate(),
            selector,
            mode: mode.into(),
            config,
        };
        let handle = self.launcher.prepare(&request)?;

        let LaunchRequest {
            run_id,
            selector,
            mode,
            config,
        } = request;
        let pipeline = selector.name.clone();
        let record = RunRecord::new(run_id.clone(), selector, mode.clone(), config);
        self.registry.insert(record, Some(Arc::clone(&handle)))?;

        info!("Launching run {} of pipeline {} ({})", run_id, pipeline, mode);
        let _ = self
            .events
            .send(RunEvent::run_started(run_id.clone(), pipeline, mode));

        let on_complete =
            completion_callback(Arc::clone(&self.registry), self.events.clone(), run_id.clone());
        if let Err(e) = handle.start(on_complete).await {
            error!("Worker for run {} failed to start: {}", run_id, e);
            finalize(&self.registry, &self.events, &run_id, RunStatus::Failure);
        }

        Ok(run_id)
    }

    /// Cancel a run
    pub async fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome> {
        self.coordinator.cancel(run_id).await
    }

    /// Cancel every run that is still `STARTED`
    pub async fn cancel_all(&self) -> Vec<(RunId, Result<CancelOutcome>)> {
        let active: Vec<RunId> = self
            .registry
            .list()
            .into_iter()
            .filter(|record| !record.is_terminal())
            .map(|record| record.run_id)
            .collect();

        if !active.is_empty() {
            info!("Cancelling {} active run(s)", active.len());
        }

        join_all(active.into_iter().map(|run_id| async move {
            let outcome = self.coordinator.cancel(&run_id).await;
            (run_id, outcome)
        }))
        .await
    }

    /// Get a run snapshot
    pub fn get_run(&self, run_id: &RunId) -> Option<RunRecord> {
        self.registry.get(run_id)
    }

    /// List all runs, oldest first
    pub fn list_runs(&self) -> Vec<RunRecord> {
        self.registry.list()
    }

    /// Whether the worker of a run is still executing
    pub fn is_alive(&self, run_id: &RunId) -> bool {
        match self.registry.lookup(run_id) {
            dagrun_core::RunLookup::Active(handle) => handle.is_alive(),
            _ => false,
        }
    }

    /// Subscribe to run lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &CancellationCoordinator {
        &self.coordinator
    }
}

/// Completion path: the worker's own outcome finalizes the run unless a
/// cancellation got there first.
fn completion_callback(
    registry: Arc<RunRegistry>,
    events: broadcast::Sender<RunEvent>,
    run_id: RunId,
) -> CompletionCallback {
    Box::new(move |outcome| {
        let status = match outcome {
            WorkerOutcome::Succeeded => RunStatus::Success,
            WorkerOutcome::Failed { reason } => {
                warn!("Run {} failed: {}", run_id, reason);
                RunStatus::Failure
            }
            WorkerOutcome::Terminated => {
                // The coordinator that signalled the worker owns CANCELED.
                debug!("Worker for run {} exited after termination", run_id);
                return;
            }
        };
        finalize(&registry, &events, &run_id, status);
    })
}

fn finalize(
    registry: &RunRegistry,
    events: &broadcast::Sender<RunEvent>,
    run_id: &RunId,
    status: RunStatus,
) {
    match registry.compare_and_transition(run_id, RunStatus::Started, status, Utc::now()) {
        Ok(true) => {
            info!("Run {} finished with status {}", run_id, status);
            let _ = events.send(RunEvent::run_finished(run_id.clone(), status));
        }
        Ok(false) => debug!(
            "Run {} already finalized, dropping {} completion",
            run_id, status
        ),
        Err(e) => error!("Failed to finalize run {}: {}", run_id, e),
    }
}
