//! ProcessController - owns one robot process tree at a time
//!
//! Start captures stdout/stderr as a line stream. Pause and resume walk the
//! whole descendant tree because the robot spawns browser automation
//! children of its own. Stop escalates terminate -> kill and then sweeps
//! for survivors, including automation processes that detached from the tree.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;

use super::signals::{self, ProcSignal};
use super::tree::{AutomationSignature, ProcessSnapshot, ProcessTable, started_within};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Errors starting a process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("A process tree is already active (pid {0})")]
    AlreadyRunning(u32),

    #[error("Spawned process has no pid")]
    NoPid,
}

/// Opaque reference to the started root process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of robot output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Result of a stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Root exit code when observable (signals as negative numbers)
    pub exit_code: Option<i32>,
    /// Whether force-kill was needed
    pub forced: bool,
    /// Survivors killed by the orphan sweep
    pub orphans_killed: usize,
    /// Nothing was tracked for this handle
    pub already_stopped: bool,
}

struct Tracked {
    child: Child,
    pid: u32,
    exit_code: Option<i32>,
}

impl Tracked {
    /// Non-blocking exit poll
    fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit_code = Some(exit_code_of(status)),
                Ok(None) => {}
                Err(e) => warn!(pid = self.pid, error = %e, "Failed to poll process"),
            }
        }
        self.exit_code
    }
}

#[derive(Default)]
struct ControllerState {
    tracked: Option<Tracked>,
    /// Last released root: (pid, exit code)
    last: Option<(u32, Option<i32>)>,
}

impl ControllerState {
    fn tracked_for(&mut self, handle: ProcessHandle) -> Option<&mut Tracked> {
        self.tracked.as_mut().filter(|t| t.pid == handle.pid)
    }

    fn release(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            self.last = Some((tracked.pid, tracked.exit_code));
        }
    }
}

/// Lifecycle owner for one external process tree
pub struct ProcessController {
    config: ProcessConfig,
    signature: AutomationSignature,
    state: Mutex<ControllerState>,
}

impl ProcessController {
    pub fn new(config: ProcessConfig) -> Self {
        let signature = AutomationSignature::from_config(&config);
        Self {
            config,
            signature,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Spawn `argv` in `cwd`; output arrives line by line on the receiver
    pub async fn start(
        &self,
        argv: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<(ProcessHandle, mpsc::Receiver<OutputLine>), ProcessError> {
        debug!(?argv, ?cwd, "ProcessController::start: called");
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

        let mut state = self.state.lock().await;
        if let Some(tracked) = state.tracked.as_mut()
            && tracked.poll_exit().is_none()
        {
            return Err(ProcessError::AlreadyRunning(tracked.pid));
        }
        state.release();

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::NoPid)?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        state.tracked = Some(Tracked {
            child,
            pid,
            exit_code: None,
        });
        info!(pid, %program, "Robot process started");
        Ok((ProcessHandle { pid }, rx))
    }

    /// Suspend the tree children first, root last; returns how many were suspended
    pub async fn pause(&self, handle: ProcessHandle) -> usize {
        debug!(pid = handle.pid, "ProcessController::pause: called");
        let mut state = self.state.lock().await;
        let Some(tracked) = state.tracked_for(handle) else {
            debug!(pid = handle.pid, "ProcessController::pause: not tracked");
            return 0;
        };
        if let Some(code) = tracked.poll_exit() {
            debug!(pid = handle.pid, code, "ProcessController::pause: already exited");
            return 0;
        }

        let mut descendants = ProcessTable::snapshot().descendants(handle.pid);
        if cfg!(not(target_os = "linux")) {
            // Children can show up a little after spawn here
            tokio::time::sleep(self.config.rescan_delay()).await;
            for pid in ProcessTable::snapshot().descendants(handle.pid) {
                if !descendants.contains(&pid) {
                    descendants.push(pid);
                }
            }
        }

        let order: Vec<u32> = descendants.iter().rev().copied().chain([handle.pid]).collect();
        let suspended = signals::send_all(&order, ProcSignal::Suspend);
        info!(
            pid = handle.pid,
            discovered = order.len(),
            suspended,
            "Suspended robot process tree"
        );
        suspended
    }

    /// Resume the tree root first, children last; returns how many were resumed
    pub async fn resume(&self, handle: ProcessHandle) -> usize {
        debug!(pid = handle.pid, "ProcessController::resume: called");
        let mut state = self.state.lock().await;
        let Some(tracked) = state.tracked_for(handle) else {
            debug!(pid = handle.pid, "ProcessController::resume: not tracked");
            return 0;
        };
        if let Some(code) = tracked.poll_exit() {
            debug!(pid = handle.pid, code, "ProcessController::resume: already exited");
            return 0;
        }

        let descendants = ProcessTable::snapshot().descendants(handle.pid);
        let order: Vec<u32> = [handle.pid].into_iter().chain(descendants).collect();
        let resumed = signals::send_all(&order, ProcSignal::Resume);
        info!(
            pid = handle.pid,
            discovered = order.len(),
            resumed,
            "Resumed robot process tree"
        );
        resumed
    }

    /// Terminate the tree with escalation and sweep up survivors
    ///
    /// Calling stop on a handle that is no longer tracked is a no-op.
    pub async fn stop(&self, handle: ProcessHandle) -> StopOutcome {
        debug!(pid = handle.pid, "ProcessController::stop: called");
        let mut state = self.state.lock().await;
        let Some(tracked) = state.tracked_for(handle) else {
            debug!(pid = handle.pid, "ProcessController::stop: not tracked");
            let exit_code = state.last.filter(|(pid, _)| *pid == handle.pid).and_then(|(_, code)| code);
            return StopOutcome {
                exit_code,
                already_stopped: true,
                ..Default::default()
            };
        };
        let root = handle.pid;

        // 1. Snapshot with identity for the orphan sweep
        let snapshot = ProcessTable::snapshot().capture(root);
        debug!(root, tracked = snapshot.len(), "ProcessController::stop: captured tree");

        let mut outcome = StopOutcome::default();

        if tracked.poll_exit().is_none() {
            // 2. Graceful terminate, children first then root
            let descendants: Vec<u32> = snapshot.descendants.iter().map(|p| p.pid).collect();
            signals::send_all(descendants.iter().rev(), ProcSignal::Terminate);
            signals::send(root, ProcSignal::Terminate);
            // Suspended processes only act on TERM once continued
            signals::send(root, ProcSignal::Resume);
            signals::send_all(&descendants, ProcSignal::Resume);

            // 3. Bounded wait for the root
            match tokio::time::timeout(self.config.stop_timeout(), tracked.child.wait()).await {
                Ok(Ok(status)) => tracked.exit_code = Some(exit_code_of(status)),
                Ok(Err(e)) => warn!(root, error = %e, "Failed waiting for robot process"),
                Err(_) => debug!(root, "ProcessController::stop: terminate timed out"),
            }

            // 4. Force kill on the current tree
            if tracked.poll_exit().is_none() {
                warn!(root, "Robot did not exit after terminate, force killing");
                outcome.forced = true;
                let current = ProcessTable::snapshot().descendants(root);
                signals::send_all(current.iter().rev(), ProcSignal::Kill);
                signals::send_all(descendants.iter().rev(), ProcSignal::Kill);
                if let Err(e) = tracked.child.start_kill() {
                    debug!(root, error = %e, "ProcessController::stop: start_kill failed");
                }
                match tokio::time::timeout(self.config.stop_timeout(), tracked.child.wait()).await {
                    Ok(Ok(status)) => tracked.exit_code = Some(exit_code_of(status)),
                    Ok(Err(e)) => warn!(root, error = %e, "Failed reaping robot process"),
                    Err(_) => warn!(root, "Robot process did not die after kill"),
                }
            }
        }
        outcome.exit_code = tracked.exit_code;

        tokio::time::sleep(self.config.settle_delay()).await;
        outcome.orphans_killed = self.sweep_orphans(&snapshot);

        state.release();
        info!(
            root,
            exit_code = ?outcome.exit_code,
            forced = outcome.forced,
            orphans_killed = outcome.orphans_killed,
            "Robot process tree stopped"
        );
        outcome
    }

    /// Kill snapshot survivors and recently started detached automation processes
    fn sweep_orphans(&self, snapshot: &ProcessSnapshot) -> usize {
        let table = ProcessTable::snapshot();
        let own_pid = std::process::id();
        let mut killed = 0;

        for info in snapshot.children_first() {
            if table.is_alive(info) && signals::send(info.pid, ProcSignal::Kill) {
                warn!(pid = info.pid, name = %info.name, "Killed surviving process from stopped tree");
                killed += 1;
            }
        }

        let window = self.config.orphan_window();
        for info in table.iter() {
            if info.pid == own_pid || snapshot.contains(info.pid) {
                continue;
            }
            if self.signature.matches(info)
                && started_within(info, window)
                && signals::send(info.pid, ProcSignal::Kill)
            {
                warn!(pid = info.pid, name = %info.name, "Killed orphaned automation process");
                killed += 1;
            }
        }

        debug!(killed, "sweep_orphans: done");
        killed
    }

    /// Whether the root process is still running
    pub async fn is_alive(&self, handle: ProcessHandle) -> bool {
        let mut state = self.state.lock().await;
        state.tracked_for(handle).is_some_and(|t| t.poll_exit().is_none())
    }

    /// Root exit code once exited (non-blocking)
    pub async fn exit_code(&self, handle: ProcessHandle) -> Option<i32> {
        let mut state = self.state.lock().await;
        if let Some(tracked) = state.tracked_for(handle) {
            return tracked.poll_exit();
        }
        state.last.filter(|(pid, _)| *pid == handle.pid).and_then(|(_, code)| code)
    }

    /// Drop ownership of an exited tree
    pub async fn release(&self, handle: ProcessHandle) {
        let mut state = self.state.lock().await;
        let exited = state.tracked_for(handle).is_some_and(|t| t.poll_exit().is_some());
        if exited {
            debug!(pid = handle.pid, "ProcessController::release: released");
            state.release();
        }
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(?stream, error = %e, "forward_lines: read failed");
                break;
            }
        }
    }
}

/// Exit code with signals encoded as negative numbers
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
