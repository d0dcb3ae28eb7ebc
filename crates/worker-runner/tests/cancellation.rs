//! Run cancellation scenarios against the in-process and subprocess backends

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use dagrun_core::{
    CompletionCallback, PipelineSelector, RunEventType, RunId, RunStatus, WorkerHandle,
};
use worker_runner::{
    CancelFailure, CancelOutcome, ExecutionManager, LaunchRequest, PipelineContext,
    TaskLauncher, TerminateExecutionResult, WorkerLauncher,
};

const WAIT: Duration = Duration::from_secs(10);

fn pipelines() -> TaskLauncher {
    TaskLauncher::new()
        .with_pipeline("noop_pipeline", |_ctx: PipelineContext| async {
            anyhow::Ok(())
        })
        .with_pipeline("failing_pipeline", |_ctx: PipelineContext| async {
            Err::<(), _>(anyhow::anyhow!("solid failed"))
        })
        .with_pipeline("infinite_loop_pipeline", |ctx: PipelineContext| async move {
            let path = ctx.config["solids"]["loop"]["config"]["file"]
                .as_str()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow::anyhow!("missing loop file"))?;
            tokio::fs::write(&path, b"running").await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::Ok(())
        })
        .with_pipeline("short_pipeline", |_ctx: PipelineContext| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            anyhow::Ok(())
        })
}

fn loop_config(path: &Path) -> serde_json::Value {
    json!({"solids": {"loop": {"config": {"file": path.to_string_lossy()}}}})
}

/// Wraps a launcher so tests can make `terminate()` refuse
struct RefusingLauncher {
    inner: TaskLauncher,
    refuse: Arc<AtomicBool>,
}

#[derive(Debug)]
struct RefusingHandle {
    inner: Arc<dyn WorkerHandle>,
    refuse: Arc<AtomicBool>,
}

impl WorkerLauncher for RefusingLauncher {
    fn prepare(&self, request: &LaunchRequest) -> worker_runner::Result<Arc<dyn WorkerHandle>> {
        Ok(Arc::new(RefusingHandle {
            inner: self.inner.prepare(request)?,
            refuse: Arc::clone(&self.refuse),
        }))
    }
}

#[async_trait]
impl WorkerHandle for RefusingHandle {
    fn worker_id(&self) -> Option<String> {
        self.inner.worker_id()
    }

    async fn start(&self, on_complete: CompletionCallback) -> dagrun_core::Result<()> {
        self.inner.start(on_complete).await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn terminate(&self) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.terminate().await
    }
}

async fn wait_for_file(path: &Path) {
    tokio::time::timeout(WAIT, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline never started");
}

async fn wait_for_terminal(manager: &ExecutionManager, run_id: &RunId) -> RunStatus {
    tokio::time::timeout(WAIT, async {
        loop {
            let status = manager.get_run(run_id).expect("run registered").status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run never finished")
}

async fn terminate(manager: &ExecutionManager, run_id: &RunId) -> TerminateExecutionResult {
    let outcome = manager.cancel(run_id).await.unwrap();
    TerminateExecutionResult::from_outcome(run_id.clone(), &outcome)
}

#[tokio::test]
async fn test_run_not_found() {
    let manager = ExecutionManager::new(Arc::new(pipelines()));

    let result = terminate(&manager, &RunId::from("nope")).await;
    assert_eq!(
        result,
        TerminateExecutionResult::NotFound {
            run_id: RunId::from("nope")
        }
    );
}

#[tokio::test]
async fn test_basic_termination() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loop-started");
    let manager = ExecutionManager::new(Arc::new(pipelines()));

    let run_id = manager
        .launch(
            PipelineSelector::new("infinite_loop_pipeline"),
            "default",
            loop_config(&path),
        )
        .await
        .unwrap();
    wait_for_file(&path).await;

    let result = terminate(&manager, &run_id).await;
    assert!(matches!(result, TerminateExecutionResult::Success { .. }));

    let record = manager.get_run(&run_id).unwrap();
    assert_eq!(record.status, RunStatus::Canceled);
    assert!(record.finished_at.is_some());

    let again = terminate(&manager, &run_id).await;
    assert!(matches!(again, TerminateExecutionResult::Failure { .. }));
    assert!(again
        .message()
        .unwrap()
        .contains("Current status is CANCELED"));
}

#[tokio::test]
async fn test_terminate_failed_then_retry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loop-started");
    let refuse = Arc::new(AtomicBool::new(true));
    let manager = ExecutionManager::new(Arc::new(RefusingLauncher {
        inner: pipelines(),
        refuse: Arc::clone(&refuse),
    }));

    let run_id = manager
        .launch(
            PipelineSelector::new("infinite_loop_pipeline"),
            "default",
            loop_config(&path),
        )
        .await
        .unwrap();
    wait_for_file(&path).await;

    let result = terminate(&manager, &run_id).await;
    assert_eq!(
        result.message(),
        Some(format!("Unable to terminate run {}", run_id).as_str())
    );
    assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Started);
    assert!(manager.is_alive(&run_id));

    refuse.store(false, Ordering::SeqCst);

    let retry = terminate(&manager, &run_id).await;
    assert!(matches!(retry, TerminateExecutionResult::Success { .. }));
    assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Canceled);
}

#[tokio::test]
async fn test_run_finished() {
    let manager = ExecutionManager::new(Arc::new(pipelines()));

    let run_id = manager
        .launch(PipelineSelector::new("noop_pipeline"), "default", json!({}))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&manager, &run_id).await, RunStatus::Success);

    let result = terminate(&manager, &run_id).await;
    assert!(matches!(result, TerminateExecutionResult::Failure { .. }));
    assert!(result
        .message()
        .unwrap()
        .contains("is not in a started state. Current status is SUCCESS"));
}

#[tokio::test]
async fn test_run_failed() {
    let manager = ExecutionManager::new(Arc::new(pipelines()));

    let run_id = manager
        .launch(PipelineSelector::new("failing_pipeline"), "default", json!({}))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&manager, &run_id).await, RunStatus::Failure);

    assert_eq!(
        manager.cancel(&run_id).await.unwrap(),
        CancelOutcome::Failure(CancelFailure::AlreadyTerminal {
            status: RunStatus::Failure
        })
    );
}

#[tokio::test]
async fn test_invalid_launches_leave_no_record() {
    let manager = ExecutionManager::new(Arc::new(pipelines()));

    let missing = manager
        .launch(PipelineSelector::new("nope_pipeline"), "default", json!({}))
        .await
        .unwrap_err();
    assert!(missing.is_validation());

    let bad_mode = manager
        .launch(PipelineSelector::new("noop_pipeline"), "prod", json!({}))
        .await
        .unwrap_err();
    assert!(bad_mode.is_validation());

    assert!(manager.list_runs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_blocking_pipeline_keeps_natural_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let started = dir.path().join("started");
    let finished = dir.path().join("finished");

    let launcher = {
        let (started, finished) = (started.clone(), finished.clone());
        TaskLauncher::new().with_pipeline("blocking_pipeline", move |_ctx: PipelineContext| {
            let (started, finished) = (started.clone(), finished.clone());
            async move {
                std::fs::write(&started, b"started")?;
                std::thread::sleep(Duration::from_millis(300));
                std::fs::write(&finished, b"finished")?;
                anyhow::Ok(())
            }
        })
    };
    let manager = ExecutionManager::new(Arc::new(launcher));

    let run_id = manager
        .launch(PipelineSelector::new("blocking_pipeline"), "default", json!({}))
        .await
        .unwrap();
    wait_for_file(&started).await;

    let result = terminate(&manager, &run_id).await;
    assert!(finished.exists());
    assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Success);
    assert_eq!(
        result.message(),
        Some(
            format!(
                "Run {} is not in a started state. Current status is SUCCESS.",
                run_id
            )
            .as_str()
        )
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_launch_and_cancel() {
    const RUNS: usize = 40;
    let manager = Arc::new(ExecutionManager::new(Arc::new(pipelines())));
    let mut events = manager.subscribe();

    let launches = (0..RUNS).map(|_| {
        let manager = Arc::clone(&manager);
        async move {
            manager
                .launch(PipelineSelector::new("short_pipeline"), "default", json!({}))
                .await
                .unwrap()
        }
    });
    let run_ids = join_all(launches).await;

    let cancels = run_ids.iter().step_by(2).cloned().map(|run_id| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let outcome = manager.cancel(&run_id).await.unwrap();
            (run_id, outcome)
        })
    });
    let cancelled: HashMap<RunId, CancelOutcome> = join_all(cancels)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    for run_id in &run_ids {
        let status = wait_for_terminal(&manager, run_id).await;
        match cancelled.get(run_id) {
            Some(CancelOutcome::Success) => assert_eq!(status, RunStatus::Canceled),
            Some(CancelOutcome::Failure(
                CancelFailure::RaceLost { status: reported }
                | CancelFailure::AlreadyTerminal { status: reported },
            )) => {
                assert_eq!(status, *reported);
                assert_eq!(status, RunStatus::Success);
            }
            Some(other) => panic!("unexpected outcome {other:?} for {run_id}"),
            None => assert_eq!(status, RunStatus::Success),
        }
    }

    // Exactly one finish event per run.
    let mut finished: HashMap<RunId, usize> = HashMap::new();
    let collect = async {
        while finished.len() < RUNS {
            let event = events.recv().await.unwrap();
            if let RunEventType::RunFinished { .. } = event.event {
                *finished.entry(event.run_id).or_default() += 1;
            }
        }
    };
    tokio::time::timeout(WAIT, collect).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        if let RunEventType::RunFinished { .. } = event.event {
            *finished.entry(event.run_id).or_default() += 1;
        }
    }
    assert_eq!(finished.len(), RUNS);
    assert!(finished.values().all(|count| *count == 1));
}

#[cfg(unix)]
mod subprocess {
    use super::*;
    use worker_runner::{PipelineCommand, ProcessLauncher};

    fn sh(script: &str) -> PipelineCommand {
        PipelineCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn launcher(dir: &Path) -> ProcessLauncher {
        ProcessLauncher::new(dir)
            .with_pipeline("sleeper", sh("sleep 30"))
            .with_pipeline("noop", sh("exit 0"))
            .with_pipeline("failing", sh("exit 3"))
            .with_pipeline("wrapper", sh("sh -c 'sleep 0.5; touch grandchild-done'; true"))
            .with_pipeline(
                "env_check",
                sh(r#"test "$DAGRUN_PIPELINE" = env_check && test -n "$DAGRUN_RUN_ID" && test "$DAGRUN_RUN_CONFIG" = '{"answer":42}'"#),
            )
    }

    #[tokio::test]
    async fn test_terminate_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExecutionManager::new(Arc::new(launcher(dir.path())));

        let run_id = manager
            .launch(PipelineSelector::new("sleeper"), "default", json!({}))
            .await
            .unwrap();
        assert!(manager.is_alive(&run_id));

        assert_eq!(manager.cancel(&run_id).await.unwrap(), CancelOutcome::Success);
        assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Canceled);
        assert!(!manager.is_alive(&run_id));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExecutionManager::new(Arc::new(launcher(dir.path())));

        let run_id = manager
            .launch(PipelineSelector::new("wrapper"), "default", json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.cancel(&run_id).await.unwrap(), CancelOutcome::Success);
        assert_eq!(manager.get_run(&run_id).unwrap().status, RunStatus::Canceled);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!dir.path().join("grandchild-done").exists());
    }

    #[tokio::test]
    async fn test_process_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExecutionManager::new(Arc::new(launcher(dir.path())));

        let ok = manager
            .launch(PipelineSelector::new("noop"), "default", json!({}))
            .await
            .unwrap();
        let failed = manager
            .launch(PipelineSelector::new("failing"), "default", json!({}))
            .await
            .unwrap();

        assert_eq!(wait_for_terminal(&manager, &ok).await, RunStatus::Success);
        assert_eq!(wait_for_terminal(&manager, &failed).await, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_run_environment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExecutionManager::new(Arc::new(launcher(dir.path())));

        let run_id = manager
            .launch(
                PipelineSelector::new("env_check"),
                "default",
                json!({"answer": 42}),
            )
            .await
            .unwrap();

        assert_eq!(wait_for_terminal(&manager, &run_id).await, RunStatus::Success);
    }
}
