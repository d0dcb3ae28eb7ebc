//! In-process worker backend
//!
//! Pipelines run as tasks on the tokio runtime. `terminate()` aborts the
//! task and then waits for the task to exit: it returns `true` only if the
//! task ended cancelled. A pipeline that never reaches an await point runs
//! to completion, its own outcome finalizes the run, and the termination is
//! reported as not effective.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use dagrun_core::{CompletionCallback, PipelineSelector, RunId, WorkerHandle, WorkerOutcome};

use crate::error::{ExecutorError, Result};
use crate::launcher::{check_config, check_mode, default_modes, LaunchRequest, WorkerLauncher};

/// Inputs handed to a pipeline body
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: RunId,
    pub selector: PipelineSelector,
    pub mode: String,
    pub config: serde_json::Value,
}

/// An executable pipeline body
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn execute(&self, ctx: PipelineContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Pipeline for F
where
    F: Fn(PipelineContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: PipelineContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

#[derive(Clone)]
struct RegisteredPipeline {
    pipeline: Arc<dyn Pipeline>,
    modes: Vec<String>,
}

/// Launches runs as tasks from a catalog of in-process pipelines
#[derive(Clone, Default)]
pub struct TaskLauncher {
    pipelines: HashMap<String, RegisteredPipeline>,
}

impl TaskLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline that runs in the default mode
    pub fn with_pipeline<P>(self, name: impl Into<String>, pipeline: P) -> Self
    where
        P: Pipeline + 'static,
    {
        self.with_pipeline_modes(name, default_modes(), pipeline)
    }

    pub fn with_pipeline_modes<P>(mut self, name: impl Into<String>, modes: Vec<String>, pipeline: P) -> Self
    where
        P: Pipeline + 'static,
    {
        self.pipelines.insert(
            name.into(),
            RegisteredPipeline {
                pipeline: Arc::new(pipeline),
                modes,
            },
        );
        self
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("pipelines", &self.pipeline_names())
            .finish()
    }
}

impl WorkerLauncher for TaskLauncher {
    fn prepare(&self, request: &LaunchRequest) -> Result<Arc<dyn WorkerHandle>> {
        let name = &request.selector.name;
        let registered = self
            .pipelines
            .get(name)
            .ok_or_else(|| ExecutorError::PipelineNotFound { name: name.clone() })?;
        check_mode(name, &registered.modes, &request.mode)?;
        check_config(&request.config)?;

        let context = PipelineContext {
            run_id: request.run_id.clone(),
            selector: request.selector.clone(),
            mode: request.mode.clone(),
            config: request.config.clone(),
        };
        Ok(Arc::new(TaskWorker::new(
            Arc::clone(&registered.pipeline),
            context,
        )))
    }
}

/// Handle over one pipeline task
pub struct TaskWorker {
    run_id: RunId,
    pipeline: Arc<dyn Pipeline>,
    context: Mutex<Option<PipelineContext>>,
    abort: Mutex<Option<AbortHandle>>,
    /// `None` while running, then whether the task ended cancelled.
    /// Published after the completion callback has run.
    exit_tx: Mutex<Option<watch::Sender<Option<bool>>>>,
    exit_rx: watch::Receiver<Option<bool>>,
}

impl TaskWorker {
    pub fn new(pipeline: Arc<dyn Pipeline>, context: PipelineContext) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            run_id: context.run_id.clone(),
            pipeline,
            context: Mutex::new(Some(context)),
            abort: Mutex::new(None),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
        }
    }
}

impl fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWorker")
            .field("run_id", &self.run_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl WorkerHandle for TaskWorker {
    fn worker_id(&self) -> Option<String> {
        self.abort
            .lock()
            .as_ref()
            .map(|_| format!("task:{}", self.run_id))
    }

    async fn start(&self, on_complete: CompletionCallback) -> dagrun_core::Result<()> {
        let context = self.context.lock().take().ok_or_else(|| {
            dagrun_core::Error::Worker(format!("worker for run {} already started", self.run_id))
        })?;
        let exit_tx = self.exit_tx.lock().take().ok_or_else(|| {
            dagrun_core::Error::Worker(format!("worker for run {} already started", self.run_id))
        })?;

        let pipeline = Arc::clone(&self.pipeline);
        let task = {
            let mut abort = self.abort.lock();
            let task = tokio::spawn(async move { pipeline.execute(context).await });
            *abort = Some(task.abort_handle());
            task
        };
        info!("Started task worker for run {}", self.run_id);

        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(())) => WorkerOutcome::Succeeded,
                Ok(Err(e)) => WorkerOutcome::Failed {
                    reason: format!("{e:#}"),
                },
                Err(e) if e.is_cancelled() => WorkerOutcome::Terminated,
                Err(e) => WorkerOutcome::Failed {
                    reason: format!("pipeline panicked: {e}"),
                },
            };
            let cancelled = outcome == WorkerOutcome::Terminated;
            debug!("Task worker for run {} exited: {:?}", run_id, outcome);
            on_complete(outcome);
            exit_tx.send_replace(Some(cancelled));
        });

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.abort
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn terminate(&self) -> bool {
        let was_running = match self.abort.lock().as_ref() {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => {
                debug!("Worker for run {} was never started", self.run_id);
                return false;
            }
        };

        // Wait for the exit to be reported so callers observe the final status.
        let mut exit = self.exit_rx.clone();
        let cancelled = match exit.wait_for(Option::is_some).await {
            Ok(verdict) => was_running && *verdict == Some(true),
            Err(_) => false,
        };
        if !cancelled {
            info!(
                "Task for run {} ran to completion before the abort took effect",
                self.run_id
            );
        }
        cancelled
    }
}
