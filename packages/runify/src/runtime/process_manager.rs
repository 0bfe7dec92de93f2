// packages/runify/src/runtime/process_manager.rs
//! Process manager for spawning and killing engine binaries
//!
//! Supports the shell families that can read requests from stdin:
//! - Node.js (node)
//! - V8 (d8)
//! - JavaScriptCore (jsc)
//! - SpiderMonkey (js)
//!
//! Every engine runs in its own process group so that a forced stop also
//! takes down anything the engine spawned.

use crate::bootstrap::HostFamily;
use crate::utils::errors::{HarnessError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Supported engine binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    Node,
    D8,
    Jsc,
    JsShell,
}

impl ProcessType {
    /// Command looked up on `PATH` when no `hostPath` is configured
    pub fn command(&self) -> &str {
        match self {
            ProcessType::Node => "node",
            ProcessType::D8 => "d8",
            ProcessType::Jsc => "jsc",
            ProcessType::JsShell => "js",
        }
    }

    /// Arguments placed before the bootstrap file
    pub fn default_args(&self) -> Vec<&str> {
        match self {
            ProcessType::Node => vec!["--no-warnings"],
            ProcessType::D8 | ProcessType::Jsc | ProcessType::JsShell => vec![],
        }
    }

    /// Bootstrap hooks this engine understands
    pub fn family(&self) -> HostFamily {
        match self {
            ProcessType::Node => HostFamily::Node,
            ProcessType::D8 => HostFamily::D8,
            ProcessType::Jsc => HostFamily::Jsc,
            ProcessType::JsShell => HostFamily::JsShell,
        }
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Resolved executable
    pub executable: PathBuf,

    /// Full argument list
    pub args: Vec<OsString>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            work_dir: None,
            env_vars: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command line for an engine running the given bootstrap file
    pub fn for_engine(process_type: ProcessType, executable: PathBuf, bootstrap: &Path) -> Self {
        let mut config = Self::new(executable);
        for arg in process_type.default_args() {
            config.args.push(arg.into());
        }
        config.args.push(bootstrap.as_os_str().to_owned());
        config
    }
}

/// Process manager for engine processes
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: HashMap<ProcessType, PathBuf>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            executable_paths: HashMap::new(),
        }
    }

    /// Resolve the executable for an engine
    ///
    /// A configured `host_path` wins; bare names are looked up on `PATH`.
    pub fn find_executable(
        &mut self,
        process_type: ProcessType,
        host_path: Option<&Path>,
    ) -> Result<PathBuf> {
        if let Some(path) = host_path {
            return resolve(path);
        }

        if let Some(path) = self.executable_paths.get(&process_type) {
            return Ok(path.clone());
        }

        let command = process_type.command();
        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                self.executable_paths.insert(process_type, path.clone());
                Ok(path)
            }
            Err(e) => Err(HarnessError::ConfigurationError(format!(
                "no hostPath given and '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Spawn a new process in its own process group with piped stdio
    pub fn spawn(&self, config: SpawnConfig) -> Result<Child> {
        debug!("Spawning {:?} {:?}", config.executable, config.args);

        let mut command = Command::new(&config.executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            HarnessError::ProcessSpawnFailed(format!("{:?}: {}", config.executable, e))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// SIGKILL the whole process group led by `pid`
    pub fn kill_group(&self, pid: u32) -> Result<()> {
        let pid = Pid::from_raw(pid as i32);

        debug!("Sending SIGKILL to process group {}", pid);
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HarnessError::RuntimeError(format!(
                "failed to kill process group {}: {}",
                pid, e
            ))),
        }
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(path: &Path) -> Result<PathBuf> {
    if path.components().count() > 1 {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(HarnessError::ConfigurationError(format!(
            "hostPath {:?} does not exist",
            path
        )));
    }

    which::which(path).map_err(|e| {
        HarnessError::ConfigurationError(format!("hostPath {:?} not found in PATH: {}", path, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_process_type_command() {
        assert_eq!(ProcessType::Node.command(), "node");
        assert_eq!(ProcessType::D8.command(), "d8");
        assert_eq!(ProcessType::JsShell.command(), "js");
        assert_eq!(ProcessType::Jsc.family(), HostFamily::Jsc);
    }

    #[test]
    fn test_explicit_host_path() {
        let mut manager = ProcessManager::new();

        let path = manager
            .find_executable(ProcessType::Node, Some(Path::new("/bin/sh")))
            .unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));

        let missing =
            manager.find_executable(ProcessType::Node, Some(Path::new("/nonexistent/node")));
        assert!(matches!(missing, Err(HarnessError::ConfigurationError(_))));

        // bare names go through PATH
        assert!(manager
            .find_executable(ProcessType::Node, Some(Path::new("sh")))
            .is_ok());
    }

    #[test]
    fn test_engine_command_line() {
        let config = SpawnConfig::for_engine(
            ProcessType::Node,
            PathBuf::from("node"),
            Path::new("/tmp/runify-bootstrap1.js"),
        );
        assert_eq!(
            config.args.last().map(|a| a.to_string_lossy().to_string()),
            Some("/tmp/runify-bootstrap1.js".to_string())
        );
    }

    #[tokio::test]
    async fn test_kill_group_takes_down_children() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(
                SpawnConfig::new("/bin/sh")
                    .arg("-c")
                    .arg("sleep 1000 & sleep 1000"),
            )
            .unwrap();
        let pid = child.id().unwrap();
        assert!(manager.is_running(pid));

        manager.kill_group(pid).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());

        // a second kill of a vanished group is not an error
        assert!(manager.kill_group(pid).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let manager = ProcessManager::new();
        let err = manager
            .spawn(SpawnConfig::new("/nonexistent/engine"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::ProcessSpawnFailed(_)));
    }
}
