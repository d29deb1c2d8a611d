//! Agent daemon process management
//!
//! PID/version files next to the IPC socket, background start through the
//! hidden `run-daemon` command, and SIGTERM stop with SIGKILL escalation.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::process::{ProcSignal, signals};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Polls of the pid after SIGTERM before escalating
const STOP_POLL_ATTEMPTS: u32 = 50;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Directory shared by the PID file, version file and IPC socket
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("robotd")
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    pub fn new() -> Self {
        Self::with_pid_file(runtime_dir().join("robotd.pid"))
    }

    /// Manager with a custom PID file; the version file sits beside it
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the live daemon, if the PID file points at one
    pub fn running_pid(&self) -> Option<u32> {
        let pid = self.read_pid().filter(|&pid| signals::pid_exists(pid));
        debug!(?pid, "DaemonManager::running_pid: returning");
        pid
    }

    fn read_pid(&self) -> Option<u32> {
        read_trimmed(&self.pid_file)?.parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        write_file(&self.pid_file, &pid.to_string()).context("Failed to write PID file")
    }

    fn remove_pid_file(&self) -> Result<()> {
        remove_if_exists(&self.pid_file).context("Failed to remove PID file")
    }

    fn write_version(&self, version: &str) -> Result<()> {
        write_file(&self.version_file, version).context("Failed to write version file")
    }

    pub fn read_version(&self) -> Option<String> {
        read_trimmed(&self.version_file)
    }

    fn remove_version_file(&self) -> Result<()> {
        remove_if_exists(&self.version_file).context("Failed to remove version file")
    }

    /// Whether the running daemon was built from this version
    pub fn version_matches(&self) -> bool {
        let matches = self.read_version().is_some_and(|v| v == VERSION);
        debug!(matches, cli_version = VERSION, "DaemonManager::version_matches: checked");
        matches
    }

    /// Spawn `rd run-daemon` in the background and return its pid
    pub fn start(&self, config_path: Option<&Path>) -> Result<u32> {
        debug!(?config_path, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut command = Command::new(&exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// SIGTERM the daemon, SIGKILL it if it lingers
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        if !signals::send(pid, ProcSignal::Terminate) {
            return Err(eyre::eyre!("Failed to signal daemon PID {}", pid));
        }

        let mut attempts = 0;
        while signals::pid_exists(pid) && attempts < STOP_POLL_ATTEMPTS {
            std::thread::sleep(STOP_POLL_INTERVAL);
            attempts += 1;
        }
        debug!(attempts, "DaemonManager::stop: waited for process");

        if signals::pid_exists(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            signals::send(pid, ProcSignal::Kill);
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Record the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove PID and version files on a clean exit
    pub fn unregister(&self) {
        if let Err(e) = self.remove_pid_file().and_then(|_| self.remove_version_file()) {
            warn!(error = %e, "Failed to clean up daemon files");
        }
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
            version: self.read_version(),
        }
    }
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub version: Option<String>,
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        debug!(?path, "remove_if_exists: removed");
    }
    Ok(())
}
