//! Application state

use std::sync::Arc;

use worker_runner::{ExecutionManager, WorkerLauncher};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: Arc<ExecutionManager>,
}

impl AppState {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        let executor = Arc::new(ExecutionManager::new(launcher));
        Self {
            inner: Arc::new(AppStateInner { executor }),
        }
    }

    /// Get reference to the execution manager
    pub fn executor(&self) -> &ExecutionManager {
        &self.inner.executor
    }

    pub fn executor_arc(&self) -> Arc<ExecutionManager> {
        Arc::clone(&self.inner.executor)
    }
}
