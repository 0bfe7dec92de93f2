// packages/runify/src/runtime/process_supervisor.rs
//! Supervisor for engine processes
//!
//! Manages the lifecycle of one persistent engine process:
//! - Spawning it on the bootstrap file
//! - Writing request frames to stdin
//! - Turning stdout lines into runtime events
//! - Keeping a stderr tail for crash reports
//! - Forced termination of the whole process group

use crate::bootstrap::Bootstrap;
use crate::protocol::{Request, RuntimeEvent};
use crate::runtime::process_manager::{ProcessManager, ProcessType, SpawnConfig};
use crate::transport::EventQueue;
use crate::utils::config::SupervisorConfig;
use crate::utils::errors::{HarnessError, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Number of stderr lines kept for crash messages
const STDERR_TAIL_LINES: usize = 32;

/// Handle to a running engine process
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    /// Process ID (also the process group ID)
    pub pid: u32,

    /// Started timestamp
    pub started_at: Instant,
}

/// Supervisor managing a single engine process
pub struct ProcessSupervisor {
    /// The spawned process
    process: Mutex<Option<Child>>,

    /// Standard input handle for sending requests
    stdin: Mutex<Option<ChildStdin>>,

    /// Process manager
    manager: ProcessManager,

    /// Runtime handle
    handle: RuntimeHandle,

    /// Last lines the engine wrote to stderr
    stderr_tail: Arc<SyncMutex<VecDeque<String>>>,

    /// stdout and stderr reader tasks
    readers: Vec<JoinHandle<()>>,

    /// Bootstrap file, removed when the supervisor goes away
    _bootstrap: Option<NamedTempFile>,

    kill_timeout: Duration,
}

impl ProcessSupervisor {
    /// Start an engine on a freshly written bootstrap
    pub async fn start(
        process_type: ProcessType,
        host_path: Option<&Path>,
        bootstrap: &Bootstrap,
        config: &SupervisorConfig,
        events: Arc<EventQueue>,
    ) -> Result<Self> {
        let mut manager = ProcessManager::new();
        let executable = manager.find_executable(process_type, host_path)?;
        let file = bootstrap.write_temp()?;

        info!(
            "Starting {:?} runtime from {:?}",
            process_type, executable
        );

        let spawn_config = SpawnConfig::for_engine(process_type, executable, file.path());
        Self::launch(manager, spawn_config, Some(file), config, events)
    }

    /// Spawn an already assembled command line and attach the readers
    pub(crate) fn launch(
        manager: ProcessManager,
        spawn_config: SpawnConfig,
        bootstrap: Option<NamedTempFile>,
        config: &SupervisorConfig,
        events: Arc<EventQueue>,
    ) -> Result<Self> {
        let mut child = manager.spawn(spawn_config)?;

        let pid = child
            .id()
            .ok_or_else(|| HarnessError::ProcessSpawnFailed("process exited at spawn".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::ProcessSpawnFailed("Failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::ProcessSpawnFailed("Failed to capture stderr".into()))?;

        let stderr_tail = Arc::new(SyncMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_reader = tokio::spawn(read_stdout(pid, stdout, events));
        let stderr_reader = tokio::spawn(read_stderr(pid, stderr, Arc::clone(&stderr_tail)));

        debug!("Engine process {} attached", pid);

        Ok(Self {
            process: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            manager,
            handle: RuntimeHandle {
                pid,
                started_at: Instant::now(),
            },
            stderr_tail,
            readers: vec![stdout_reader, stderr_reader],
            _bootstrap: bootstrap,
            kill_timeout: config.kill_timeout(),
        })
    }

    /// Write one request frame to the engine's stdin
    pub async fn deliver(&self, request: &Request) -> Result<()> {
        let frame = request.to_frame()?;
        debug!("→ pid {} {} #{}", self.handle.pid, request.op(), request.seq());

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| HarnessError::BackendCrashedError("engine stdin is closed".into()))?;

        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| self.crashed(format!("Failed to write to stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.crashed(format!("Failed to flush stdin: {}", e)))?;

        Ok(())
    }

    /// Kill the process group and wait for the exit, bounded by the kill timeout
    pub async fn terminate(&self) -> Result<()> {
        *self.stdin.lock().await = None;

        let mut process_guard = self.process.lock().await;
        let Some(mut process) = process_guard.take() else {
            return Ok(());
        };

        self.manager.kill_group(self.handle.pid)?;

        match tokio::time::timeout(self.kill_timeout, process.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} exited with status: {}", self.handle.pid, status);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error waiting for process {}: {}", self.handle.pid, e);
                Err(HarnessError::Io(e))
            }
            Err(_) => {
                warn!("Process {} did not exit in time", self.handle.pid);
                Err(HarnessError::RuntimeError(format!(
                    "process {} survived SIGKILL for {:?}",
                    self.handle.pid, self.kill_timeout
                )))
            }
        }
    }

    /// Close stdin, give the engine a moment to exit on EOF, then kill it
    pub async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down engine process {}", self.handle.pid);
        *self.stdin.lock().await = None;

        {
            let mut process_guard = self.process.lock().await;
            if let Some(process) = process_guard.as_mut() {
                let grace = self.kill_timeout.min(Duration::from_millis(500));
                if let Ok(Ok(status)) = tokio::time::timeout(grace, process.wait()).await {
                    debug!("Process {} exited on EOF: {}", self.handle.pid, status);
                    // the group may still hold children of the engine
                    let _ = self.manager.kill_group(self.handle.pid);
                    process_guard.take();
                    return Ok(());
                }
            }
        }

        self.terminate().await
    }

    /// Whether the engine process is still alive
    pub fn health_check(&self) -> bool {
        self.manager.is_running(self.handle.pid)
    }

    /// Recent stderr output, oldest first
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get runtime handle
    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    fn crashed(&self, reason: String) -> HarnessError {
        let tail = self.stderr_tail();
        if tail.is_empty() {
            HarnessError::BackendCrashedError(reason)
        } else {
            HarnessError::BackendCrashedError(format!("{}\n{}", reason, tail))
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        if self.process.get_mut().is_some() {
            let _ = self.manager.kill_group(self.handle.pid);
        }
    }
}

async fn read_stdout(pid: u32, stdout: tokio::process::ChildStdout, events: Arc<EventQueue>) {
    let mut lines = BufReader::new(stdout).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => match RuntimeEvent::from_line(&line) {
                Ok(event) => {
                    if events.push(event).is_err() {
                        break "event queue closed".to_string();
                    }
                }
                Err(e) => warn!("pid {}: {}", pid, e),
            },
            Ok(None) => break format!("engine process {} closed its output", pid),
            Err(e) => {
                error!("Error reading from stdout: {}", e);
                break format!("read error on engine stdout: {}", e);
            }
        }
    };

    debug!("stdout reader for {} finished: {}", pid, reason);
    let _ = events.push(RuntimeEvent::Disconnected { reason });
    events.close();
}

async fn read_stderr(
    pid: u32,
    stderr: tokio::process::ChildStderr,
    tail: Arc<SyncMutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        debug!("pid {} stderr: {}", pid, line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
