//! Subprocess worker backend
//!
//! Each run is one OS process. On unix the process leads its own process
//! group and termination sends SIGKILL to the whole group, so commands that
//! fork (shell wrappers, pipelines of tools) do not leave work running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use dagrun_core::{CompletionCallback, RunId, WorkerHandle, WorkerOutcome};

use crate::error::{ExecutorError, Result};
use crate::launcher::{check_config, check_mode, default_modes, LaunchRequest, WorkerLauncher};

pub const ENV_RUN_ID: &str = "DAGRUN_RUN_ID";
pub const ENV_PIPELINE: &str = "DAGRUN_PIPELINE";
pub const ENV_MODE: &str = "DAGRUN_MODE";
pub const ENV_RUN_CONFIG: &str = "DAGRUN_RUN_CONFIG";
pub const ENV_SOLID_SUBSET: &str = "DAGRUN_SOLID_SUBSET";

/// Command a pipeline runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCommand {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
    /// Modes this pipeline can run in
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
    /// Additional environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl PipelineCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            modes: default_modes(),
            env: HashMap::new(),
        }
    }
}

/// Launches each run as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    working_dir: PathBuf,
    pipelines: HashMap<String, PipelineCommand>,
}

impl ProcessLauncher {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            pipelines: HashMap::new(),
        }
    }

    /// Load a `{ "<name>": PipelineCommand }` catalog from a JSON file
    pub fn from_catalog_file(path: impl AsRef<Path>, working_dir: impl Into<PathBuf>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let pipelines: HashMap<String, PipelineCommand> = serde_json::from_str(&raw)?;
        info!(
            "Loaded {} pipeline(s) from {:?}",
            pipelines.len(),
            path.as_ref()
        );
        Ok(Self {
            working_dir: working_dir.into(),
            pipelines,
        })
    }

    pub fn with_pipeline(mut self, name: impl Into<String>, command: PipelineCommand) -> Self {
        self.pipelines.insert(name.into(), command);
        self
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn prepare(&self, request: &LaunchRequest) -> Result<Arc<dyn WorkerHandle>> {
        let name = &request.selector.name;
        let command = self
            .pipelines
            .get(name)
            .ok_or_else(|| ExecutorError::PipelineNotFound { name: name.clone() })?;
        check_mode(name, &command.modes, &request.mode)?;
        check_config(&request.config)?;

        let mut env = vec![
            (ENV_RUN_ID.to_string(), request.run_id.to_string()),
            (ENV_PIPELINE.to_string(), name.clone()),
            (ENV_MODE.to_string(), request.mode.clone()),
            (ENV_RUN_CONFIG.to_string(), serde_json::to_string(&request.config)?),
        ];
        if let Some(subset) = &request.selector.solid_subset {
            env.push((ENV_SOLID_SUBSET.to_string(), subset.join(",")));
        }
        env.extend(command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(Arc::new(ProcessWorker::new(
            request.run_id.clone(),
            command.clone(),
            self.working_dir.clone(),
            env,
        )))
    }
}

type KillRequest = oneshot::Sender<bool>;

#[derive(Debug, Default)]
struct ProcessState {
    started: bool,
    pid: Option<u32>,
    kill_tx: Option<mpsc::Sender<KillRequest>>,
}

/// Handle over one worker process
#[derive(Debug)]
pub struct ProcessWorker {
    run_id: RunId,
    command: PipelineCommand,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    state: Mutex<ProcessState>,
    alive: Arc<AtomicBool>,
}

impl ProcessWorker {
    pub fn new(
        run_id: RunId,
        command: PipelineCommand,
        working_dir: PathBuf,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            run_id,
            command,
            working_dir,
            env,
            state: Mutex::new(ProcessState::default()),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the process ID
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn worker_id(&self) -> Option<String> {
        self.pid().map(|pid| format!("pid:{pid}"))
    }

    async fn start(&self, on_complete: CompletionCallback) -> dagrun_core::Result<()> {
        {
            let mut state = self.state.lock();
            if state.started {
                return Err(dagrun_core::Error::Worker(format!(
                    "worker for run {} already started",
                    self.run_id
                )));
            }
            state.started = true;
        }

        info!(
            "Spawning {} {:?} in {:?} for run {}",
            self.command.program, self.command.args, self.working_dir, self.run_id
        );

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            dagrun_core::Error::Worker(format!(
                "Failed to spawn {}: {}",
                self.command.program, e
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(self.run_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(self.run_id.clone(), "stderr", stderr);
        }

        let (kill_tx, mut kill_rx) = mpsc::channel::<KillRequest>(1);
        {
            let mut state = self.state.lock();
            state.pid = child.id();
            state.kill_tx = Some(kill_tx);
        }
        self.alive.store(true, Ordering::SeqCst);

        let alive = Arc::clone(&self.alive);
        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            let mut terminate_requested = false;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(reply) = kill_rx.recv() => {
                        let accepted = match kill_worker(&mut child) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("Failed to kill worker for run {}: {}", run_id, e);
                                false
                            }
                        };
                        terminate_requested |= accepted;
                        let _ = reply.send(accepted);
                    }
                }
            };
            alive.store(false, Ordering::SeqCst);

            let outcome = match status {
                _ if terminate_requested => WorkerOutcome::Terminated,
                Ok(status) if status.success() => WorkerOutcome::Succeeded,
                Ok(status) => WorkerOutcome::Failed {
                    reason: format!("worker exited with {status}"),
                },
                Err(e) => WorkerOutcome::Failed {
                    reason: format!("failed to wait on worker: {e}"),
                },
            };
            info!("Worker for run {} exited: {:?}", run_id, outcome);
            on_complete(outcome);

            // Requests that raced the exit are answered after finalization.
            kill_rx.close();
            while let Ok(reply) = kill_rx.try_recv() {
                let _ = reply.send(false);
            }
        });

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&self) -> bool {
        let kill_tx = self.state.lock().kill_tx.clone();
        let Some(kill_tx) = kill_tx else {
            warn!("Worker for run {} was never started", self.run_id);
            return false;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if kill_tx.send(reply_tx).await.is_err() {
            debug!("Worker for run {} already exited", self.run_id);
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

/// Kill the worker's process group, falling back to the child alone
#[cfg(unix)]
fn kill_worker(child: &mut tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return child.start_kill();
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: killpg only sends a signal; the group is ours because the child
    // is not reaped yet and was spawned with process_group(0).
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    debug!("killpg({}) failed: {}, killing child only", pgid, err);
    child.start_kill()
}

#[cfg(not(unix))]
fn kill_worker(child: &mut tokio::process::Child) -> std::io::Result<()> {
    child.start_kill()
}

fn spawn_output_reader<R>(run_id: RunId, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}: {}", run_id, stream, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::PipelineSelector;
    use serde_json::json;

    fn request(name: &str, mode: &str) -> LaunchRequest {
        LaunchRequest {
            run_id: RunId::generate(),
            selector: PipelineSelector::new(name),
            mode: mode.to_string(),
            config: json!({}),
        }
    }

    #[test]
    fn test_catalog_defaults() {
        let catalog: HashMap<String, PipelineCommand> =
            serde_json::from_value(json!({"sleeper": {"program": "sleep", "args": ["30"]}}))
                .unwrap();

        let sleeper = &catalog["sleeper"];
        assert_eq!(sleeper.modes, vec!["default".to_string()]);
        assert!(sleeper.env.is_empty());
    }

    #[test]
    fn test_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipelines.json");
        std::fs::write(
            &path,
            r#"{"noop": {"program": "true"}, "loop": {"program": "sleep", "args": ["30"], "modes": ["default", "test"]}}"#,
        )
        .unwrap();

        let launcher = ProcessLauncher::from_catalog_file(&path, dir.path()).unwrap();
        assert_eq!(launcher.pipeline_names(), vec!["loop", "noop"]);
    }

    #[test]
    fn test_prepare_validates_request() {
        let launcher =
            ProcessLauncher::new(".").with_pipeline("noop", PipelineCommand::new("true", vec![]));

        assert!(launcher.prepare(&request("noop", "default")).is_ok());
        assert!(matches!(
            launcher.prepare(&request("missing", "default")),
            Err(ExecutorError::PipelineNotFound { .. })
        ));
        assert!(matches!(
            launcher.prepare(&request("noop", "prod")),
            Err(ExecutorError::InvalidMode { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_before_start_is_refused() {
        let worker = ProcessWorker::new(
            RunId::generate(),
            PipelineCommand::new("sleep", vec!["30".to_string()]),
            PathBuf::from("."),
            vec![],
        );

        assert!(!worker.is_alive());
        assert!(!worker.terminate().await);
        assert!(worker.worker_id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_running_process() {
        let worker = ProcessWorker::new(
            RunId::generate(),
            PipelineCommand::new("sleep", vec!["30".to_string()]),
            PathBuf::from("."),
            vec![],
        );
        let (tx, rx) = oneshot::channel();
        worker
            .start(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }))
            .await
            .unwrap();

        assert!(worker.is_alive());
        assert!(worker.pid().is_some());
        assert!(worker.terminate().await);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Terminated);
        assert!(!worker.is_alive());
        assert!(!worker.terminate().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_maps_to_outcome() {
        for (program, expected_success) in [("true", true), ("false", false)] {
            let worker = ProcessWorker::new(
                RunId::generate(),
                PipelineCommand::new(program, vec![]),
                PathBuf::from("."),
                vec![],
            );
            let (tx, rx) = oneshot::channel();
            worker
                .start(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }))
                .await
                .unwrap();

            let outcome = rx.await.unwrap();
            assert_eq!(outcome == WorkerOutcome::Succeeded, expected_success);
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let worker = ProcessWorker::new(
            RunId::generate(),
            PipelineCommand::new("/definitely/not/a/binary", vec![]),
            PathBuf::from("."),
            vec![],
        );

        let err = worker.start(Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, dagrun_core::Error::Worker(_)));
        assert!(!worker.is_alive());
    }
}
