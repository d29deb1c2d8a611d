//! ExecutionSupervisor - per-run state machine
//!
//! Wires the ProcessController to the StateCoordinator behind one
//! mutex-guarded local status. Pause/resume/stop requests arrive through the
//! shared control flags, possibly written by another process, and are picked
//! up by the run loop on a fixed cadence. Only the supervisor that owns a run
//! touches its process tree or writes its terminal record.

mod setup;

pub use setup::{
    ENV_EXECUTION_ID, ENV_PARAMS_FILE, ENV_RUN_DIR, INLINE_FILE_PREFIX, PreparedRun, SetupError, prepare_run,
};

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, RobotConfig, SupervisorConfig};
use crate::domain::{
    ExecutionSpec, ExecutionStatus, ExecutionUpdate, ExitOutcome, PauseControl, STOPPED_MANUALLY, ServerStatus,
};
use crate::orchestrator::{DEFAULT_LOG_BUFFER, LogForwarder, LogSeverity, OrchestratorClient};
use crate::process::{OutputLine, OutputStream, ProcessController, ProcessError, ProcessHandle, StopOutcome};
use crate::state::StateCoordinator;

/// How long queued log lines may take to drain after the robot exits
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Slack on top of the owner's poll and stop escalation when waiting on a remote stop
const REMOTE_STOP_SLACK: Duration = Duration::from_secs(1);

/// Failures that end a run as `failed`
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Agent is {status}, not accepting runs")]
    Busy { status: ServerStatus },

    #[error("Execution {0} has already finished")]
    AlreadyFinished(String),

    #[error("Setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Failed to start robot: {0}")]
    Spawn(#[from] ProcessError),

    #[error("Robot exited with code {code}")]
    RobotFailed { execution_id: String, code: i32 },
}

/// How a finished run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub execution_id: String,
    pub exit_code: i32,
    /// Ended through an explicit stop
    pub stopped: bool,
}

impl RunReport {
    fn stopped(execution_id: String, exit_code: i32) -> Self {
        Self {
            execution_id,
            exit_code,
            stopped: true,
        }
    }
}

/// Result of an explicit stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub execution_id: String,
    /// Recorded exit code (`-1` when none was observable)
    pub exit_code: Option<i32>,
    pub outcome: StopOutcome,
    /// Nothing was live or pending for this id
    pub noop: bool,
}

impl StopReport {
    fn noop(execution_id: &str, exit_code: Option<i32>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            exit_code,
            outcome: StopOutcome {
                already_stopped: true,
                ..Default::default()
            },
            noop: true,
        }
    }
}

#[derive(Debug, Default)]
struct LocalState {
    status: ServerStatus,
    execution_id: Option<String>,
    handle: Option<ProcessHandle>,
    /// Execution an explicit stop has taken over
    stopped: Option<String>,
}

/// Thread-safe run supervisor (one robot slot per agent)
pub struct ExecutionSupervisor {
    controller: ProcessController,
    state: StateCoordinator,
    orchestrator: Arc<dyn OrchestratorClient>,
    robot: RobotConfig,
    cadence: SupervisorConfig,
    notify_timeout: Duration,
    remote_stop_wait: Duration,
    local: Mutex<LocalState>,
    /// Serializes read-check-write of record statuses
    record_writes: Mutex<()>,
}

impl ExecutionSupervisor {
    pub fn new(config: &Config, state: StateCoordinator, orchestrator: Arc<dyn OrchestratorClient>) -> Self {
        // Owner poll, terminate wait, kill wait, settle
        let remote_stop_wait = config.supervisor.pause_poll() * 2
            + config.process.stop_timeout() * 2
            + config.process.settle_delay()
            + REMOTE_STOP_SLACK;
        Self {
            controller: ProcessController::new(config.process.clone()),
            state,
            orchestrator,
            robot: config.robot.clone(),
            cadence: config.supervisor.clone(),
            notify_timeout: Duration::from_millis(config.orchestrator.timeout_ms),
            remote_stop_wait,
            local: Mutex::new(LocalState::default()),
            record_writes: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &StateCoordinator {
        &self.state
    }

    /// Current local status
    pub async fn status(&self) -> ServerStatus {
        self.local.lock().await.status
    }

    /// Execution currently owning the robot slot
    pub async fn current_execution(&self) -> Option<String> {
        self.local.lock().await.execution_id.clone()
    }

    /// Transition the local status and persist it
    ///
    /// The read-modify-write and the persist happen under the lock; the
    /// remote notification happens after it is released and never rolls the
    /// local change back. Returns whether a notification was delivered.
    pub async fn change_status(
        &self,
        new_status: ServerStatus,
        notify_remote: Option<ExecutionStatus>,
        execution_id: Option<&str>,
    ) -> bool {
        debug!(%new_status, ?notify_remote, ?execution_id, "change_status: called");
        let target = {
            let mut local = self.local.lock().await;
            let target = match new_status {
                ServerStatus::Free | ServerStatus::Closed => {
                    let target = execution_id.map(str::to_string).or_else(|| local.execution_id.clone());
                    local.execution_id = None;
                    local.handle = None;
                    target
                }
                ServerStatus::Blocked | ServerStatus::Running | ServerStatus::Paused => {
                    // A stop already handed the slot back
                    if let Some(id) = execution_id
                        && local.stopped.as_deref() == Some(id)
                    {
                        debug!(%id, %new_status, "change_status: execution was stopped, ignoring");
                        return false;
                    }
                    if let Some(id) = execution_id
                        && local.execution_id.as_deref() != Some(id)
                    {
                        local.execution_id = Some(id.to_string());
                    }
                    local.execution_id.clone()
                }
            };
            let previous = local.status;
            local.status = new_status;
            self.state.set_server_status(new_status).await;
            info!(from = %previous, to = %new_status, execution_id = ?target, "Server status changed");
            target
        };

        let Some(remote_status) = notify_remote else {
            return false;
        };
        let Some(execution_id) = target else {
            warn!(%remote_status, "No execution to report status for");
            return false;
        };
        self.notify(&execution_id, remote_status, false).await
    }

    async fn notify(&self, execution_id: &str, status: ExecutionStatus, actually_started: bool) -> bool {
        if !self.orchestrator.is_enabled() {
            debug!(%execution_id, %status, "notify: orchestrator disabled");
            return false;
        }
        let call = self.orchestrator.set_status(execution_id, status, actually_started);
        match tokio::time::timeout(self.notify_timeout, call).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(%execution_id, %status, error = %e, "Failed to notify orchestrator");
                false
            }
            Err(_) => {
                warn!(%execution_id, %status, timeout = ?self.notify_timeout, "Orchestrator notification timed out");
                false
            }
        }
    }

    /// Write `next` plus `update` unless the stored status forbids it
    ///
    /// Returns whether the transition was applied. Finished records never
    /// change again, so of two racing terminal writes exactly one lands.
    async fn transition(&self, execution_id: &str, next: ExecutionStatus, update: ExecutionUpdate) -> bool {
        let _guard = self.record_writes.lock().await;
        let current = self.state.get_execution(execution_id).await.and_then(|r| r.status);
        if let Some(current) = current
            && !current.can_transition_to(next)
        {
            debug!(%execution_id, %current, %next, "transition: refused");
            return false;
        }
        self.state.save_execution_state(execution_id, update.status(next)).await;
        true
    }

    /// Record a terminal status and free the slot; `false` when already finished
    async fn finish(&self, execution_id: &str, status: ExecutionStatus, update: ExecutionUpdate) -> bool {
        if !self.transition(execution_id, status, update.finished_now()).await {
            return false;
        }
        self.state.clear_pause_control(execution_id).await;
        self.change_status(ServerStatus::Free, Some(status), Some(execution_id))
            .await;
        true
    }

    /// Claim the robot slot for `execution_id` (status must be `free`)
    ///
    /// Claiming again for the execution that already holds the slot is
    /// allowed so admission and `run` can both call it.
    pub async fn claim(&self, execution_id: &str) -> Result<(), SupervisorError> {
        debug!(%execution_id, "claim: called");
        let mut local = self.local.lock().await;
        if local.status == ServerStatus::Blocked && local.execution_id.as_deref() == Some(execution_id) {
            return Ok(());
        }
        if local.status != ServerStatus::Free {
            return Err(SupervisorError::Busy { status: local.status });
        }
        local.status = ServerStatus::Blocked;
        local.execution_id = Some(execution_id.to_string());
        local.handle = None;
        local.stopped = None;
        self.state.set_server_status(ServerStatus::Blocked).await;
        info!(%execution_id, "Robot slot claimed");
        Ok(())
    }

    /// Give a claimed slot back before anything was spawned
    async fn release_claim(&self, execution_id: &str) {
        let mut local = self.local.lock().await;
        if local.status == ServerStatus::Blocked
            && local.execution_id.as_deref() == Some(execution_id)
            && local.handle.is_none()
        {
            local.status = ServerStatus::Free;
            local.execution_id = None;
            self.state.set_server_status(ServerStatus::Free).await;
            info!(%execution_id, "Robot slot released");
        }
    }

    /// Claim the slot and persist the `pending` record
    ///
    /// After this returns the record is queryable. Re-admitting a finished
    /// execution is refused and leaves the slot free.
    pub async fn admit(
        &self,
        execution_id: &str,
        robot_id: &str,
        task_handle: Option<&str>,
    ) -> Result<(), SupervisorError> {
        debug!(%execution_id, %robot_id, ?task_handle, "admit: called");
        self.claim(execution_id).await?;

        let mut update = ExecutionUpdate::new().robot_id(robot_id);
        if let Some(handle) = task_handle {
            update = update.task_handle(handle);
        }
        if !self.transition(execution_id, ExecutionStatus::Pending, update).await {
            self.release_claim(execution_id).await;
            return Err(SupervisorError::AlreadyFinished(execution_id.to_string()));
        }
        Ok(())
    }

    /// Run one execution end to end
    ///
    /// Only admission, setup failures and a failing robot exit come back as
    /// errors; everything else is logged and absorbed.
    pub async fn run(&self, mut spec: ExecutionSpec, task_handle: Option<String>) -> Result<RunReport, SupervisorError> {
        let execution_id = spec.resolve_id();
        debug!(%execution_id, robot_id = %spec.robot_id, "run: called");

        // A stop between admission and this task starting has already freed the slot
        if let Some(record) = self.state.get_execution(&execution_id).await
            && record.stopped
            && record.is_terminal()
        {
            info!(%execution_id, "Run stopped before it started");
            return Ok(RunReport::stopped(
                execution_id,
                record.exit_code.unwrap_or(STOPPED_MANUALLY),
            ));
        }
        self.admit(&execution_id, &spec.robot_id, task_handle.as_deref())
            .await?;

        let prepared = match prepare_run(&spec, &execution_id, &self.robot) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(%execution_id, error = %e, "Run setup failed");
                if !self.finish_failed(&execution_id, None, &e.to_string()).await {
                    return Ok(RunReport::stopped(execution_id, STOPPED_MANUALLY));
                }
                return Err(e.into());
            }
        };

        if self.state.get_pause_control(&execution_id).await.stop_requested {
            self.stop(&execution_id).await;
        }
        if self.is_stopped(&execution_id).await {
            info!(%execution_id, "Run stopped before spawn");
            return Ok(RunReport::stopped(execution_id, STOPPED_MANUALLY));
        }

        // Remote timers start here, after setup
        self.notify(&execution_id, ExecutionStatus::Running, true).await;

        let (handle, output) = match self.controller.start(&prepared.argv, &prepared.run_dir, &prepared.env).await {
            Ok(started) => started,
            Err(e) => {
                error!(%execution_id, error = %e, "Failed to spawn robot");
                if !self.finish_failed(&execution_id, None, &e.to_string()).await {
                    return Ok(RunReport::stopped(execution_id, STOPPED_MANUALLY));
                }
                return Err(e.into());
            }
        };

        let stopped_during_spawn = {
            let mut local = self.local.lock().await;
            let still_ours = local.execution_id.as_deref() == Some(execution_id.as_str())
                && local.stopped.as_deref() != Some(execution_id.as_str());
            if still_ours {
                local.handle = Some(handle);
            }
            !still_ours
        };
        let running = ExecutionUpdate::new().pid(handle.pid()).started_now();
        if stopped_during_spawn || !self.transition(&execution_id, ExecutionStatus::Running, running).await {
            let outcome = self.controller.stop(handle).await;
            info!(%execution_id, "Run stopped while spawning");
            return Ok(RunReport::stopped(
                execution_id,
                outcome.exit_code.unwrap_or(STOPPED_MANUALLY),
            ));
        }
        self.change_status(ServerStatus::Running, None, Some(&execution_id)).await;

        let exit_code = self.supervise(&execution_id, handle, output).await;
        self.controller.release(handle).await;

        if self.is_stopped(&execution_id).await {
            debug!(%execution_id, exit_code, "run: finalized by stop");
            return Ok(RunReport::stopped(execution_id, exit_code));
        }

        let outcome = ExitOutcome::classify(exit_code);
        info!(%execution_id, exit_code, ?outcome, "Robot exited");
        match outcome {
            ExitOutcome::Success | ExitOutcome::StoppedGracefully => {
                let update = ExecutionUpdate::new().exit_code(exit_code);
                if !self.finish(&execution_id, ExecutionStatus::Completed, update).await {
                    debug!(%execution_id, "run: a stop recorded the ending first");
                    return Ok(RunReport::stopped(execution_id, exit_code));
                }
                Ok(RunReport {
                    execution_id,
                    exit_code,
                    stopped: false,
                })
            }
            ExitOutcome::Failed(code) => {
                let message = format!("Robot exited with code {}", code);
                if !self.finish_failed(&execution_id, Some(code), &message).await {
                    debug!(%execution_id, "run: a stop recorded the ending first");
                    return Ok(RunReport::stopped(execution_id, exit_code));
                }
                Err(SupervisorError::RobotFailed { execution_id, code })
            }
        }
    }

    /// Read output, apply control flags, wait for exit; returns the exit code
    async fn supervise(
        &self,
        execution_id: &str,
        handle: ProcessHandle,
        mut output: mpsc::Receiver<OutputLine>,
    ) -> i32 {
        let mut forwarder = LogForwarder::spawn(self.orchestrator.clone(), execution_id, DEFAULT_LOG_BUFFER);
        let mut output_open = true;
        let mut paused = false;
        let mut last_poll = Instant::now();

        let exit_code = loop {
            if output_open {
                match tokio::time::timeout(self.cadence.read_timeout(), output.recv()).await {
                    Ok(Some(line)) => {
                        self.forward_line(execution_id, &mut forwarder, line);
                        while let Ok(line) = output.try_recv() {
                            self.forward_line(execution_id, &mut forwarder, line);
                        }
                    }
                    Ok(None) => output_open = false,
                    Err(_) => {}
                }
            }

            if let Some(code) = self.controller.exit_code(handle).await {
                // Whatever is still buffered, without waiting on lingering writers
                while let Ok(Some(line)) = tokio::time::timeout(self.cadence.read_timeout(), output.recv()).await {
                    self.forward_line(execution_id, &mut forwarder, line);
                }
                break code;
            }

            if last_poll.elapsed() >= self.cadence.pause_poll() {
                last_poll = Instant::now();
                if !self.is_stopped(execution_id).await {
                    let control = self.state.get_pause_control(execution_id).await;
                    if control.stop_requested {
                        info!(%execution_id, "Stop requested through shared state");
                        self.stop(execution_id).await;
                        continue;
                    }
                    paused = self.apply_pause_control(execution_id, handle, paused, control).await;
                }
            }

            tokio::time::sleep(self.cadence.idle_sleep()).await;
        };

        let delivered = forwarder.close(LOG_DRAIN_GRACE).await;
        debug!(%execution_id, exit_code, delivered, "supervise: robot exited");
        exit_code
    }

    fn forward_line(&self, execution_id: &str, forwarder: &mut LogForwarder, line: OutputLine) {
        let is_error = self.robot.error_markers.iter().any(|m| line.text.contains(m.as_str()));
        let severity = if is_error { LogSeverity::Error } else { LogSeverity::Info };
        match line.stream {
            OutputStream::Stdout => debug!(%execution_id, %severity, "robot: {}", line.text),
            OutputStream::Stderr => debug!(%execution_id, %severity, "robot(stderr): {}", line.text),
        }
        forwarder.forward(line.text, severity);
    }

    /// Consume pause/resume flags; returns the new paused state
    async fn apply_pause_control(
        &self,
        execution_id: &str,
        handle: ProcessHandle,
        paused: bool,
        control: PauseControl,
    ) -> bool {
        if !control.pause_requested && !control.resume_requested {
            return paused;
        }
        debug!(%execution_id, ?control, paused, "apply_pause_control: called");

        if control.pause_requested && !paused {
            let suspended = self.controller.pause(handle).await;
            if suspended == 0 {
                debug!(%execution_id, "apply_pause_control: nothing suspended");
                return false;
            }
            if control.resume_requested {
                // Left over from an earlier cycle
                self.state.clear_resume_request(execution_id).await;
            }
            let update = ExecutionUpdate::new().paused_now();
            if self.transition(execution_id, ExecutionStatus::Paused, update).await {
                self.change_status(ServerStatus::Paused, Some(ExecutionStatus::Paused), Some(execution_id))
                    .await;
            }
            info!(%execution_id, "Execution paused");
            return true;
        }

        if control.resume_requested && paused {
            self.controller.resume(handle).await;
            self.state.clear_pause_flags(execution_id).await;
            let update = ExecutionUpdate::new().resumed_now();
            if self.transition(execution_id, ExecutionStatus::Running, update).await {
                self.change_status(ServerStatus::Running, Some(ExecutionStatus::Running), Some(execution_id))
                    .await;
            }
            info!(%execution_id, "Execution resumed");
            return false;
        }

        if control.resume_requested && !paused {
            debug!(%execution_id, "apply_pause_control: clearing stale resume request");
            self.state.clear_resume_request(execution_id).await;
        }
        paused
    }

    async fn finish_failed(&self, execution_id: &str, exit_code: Option<i32>, message: &str) -> bool {
        let mut update = ExecutionUpdate::new().error(message);
        if let Some(code) = exit_code {
            update = update.exit_code(code);
        }
        self.finish(execution_id, ExecutionStatus::Failed, update).await
    }

    async fn is_stopped(&self, execution_id: &str) -> bool {
        if self.local.lock().await.stopped.as_deref() == Some(execution_id) {
            return true;
        }
        // A newer run may have reset the local marker
        self.state
            .get_execution(execution_id)
            .await
            .is_some_and(|r| r.stopped || r.is_terminal())
    }

    /// Flag a pause for the run loop (which may live in another process)
    pub async fn pause_request(&self, execution_id: &str) -> bool {
        debug!(%execution_id, "pause_request: called");
        if !self.is_active_record(execution_id).await {
            return false;
        }
        self.state.request_pause(execution_id).await
    }

    /// Flag a resume for the run loop
    pub async fn resume_request(&self, execution_id: &str) -> bool {
        debug!(%execution_id, "resume_request: called");
        if !self.is_active_record(execution_id).await {
            return false;
        }
        self.state.request_resume(execution_id).await
    }

    async fn is_active_record(&self, execution_id: &str) -> bool {
        match self.state.get_execution(execution_id).await {
            Some(record) if !record.is_terminal() => true,
            Some(_) => {
                debug!(%execution_id, "Execution already finished");
                false
            }
            None => {
                debug!(%execution_id, "Execution not found");
                false
            }
        }
    }

    /// Stop an execution synchronously and report how it ended
    ///
    /// A run owned by this supervisor is stopped here. A run owned elsewhere
    /// gets a stop request through shared state and this waits for its owner
    /// to record the ending. Stopping a finished execution changes nothing.
    pub async fn stop(&self, execution_id: &str) -> StopReport {
        debug!(%execution_id, "stop: called");
        let record = self.state.get_execution(execution_id).await;
        if let Some(record) = &record
            && record.is_terminal()
        {
            debug!(%execution_id, status = ?record.status, "stop: already finished");
            return StopReport::noop(execution_id, record.exit_code);
        }

        let (owned, handle) = {
            let mut local = self.local.lock().await;
            let owned = local.execution_id.as_deref() == Some(execution_id);
            if owned {
                local.stopped = Some(execution_id.to_string());
            }
            (owned, if owned { local.handle } else { None })
        };
        if !owned {
            if record.is_none() {
                debug!(%execution_id, "stop: nothing to stop");
                return StopReport::noop(execution_id, None);
            }
            return self.stop_remote(execution_id).await;
        }

        let outcome = match handle {
            Some(handle) => self.controller.stop(handle).await,
            None => StopOutcome {
                already_stopped: true,
                ..Default::default()
            },
        };
        let exit_code = outcome.exit_code.unwrap_or(STOPPED_MANUALLY);

        let update = ExecutionUpdate::new().exit_code(exit_code).stopped();
        if !self.finish(execution_id, ExecutionStatus::Completed, update).await {
            let recorded = self.state.get_execution(execution_id).await.and_then(|r| r.exit_code);
            debug!(%execution_id, ?recorded, "stop: run recorded its ending first");
            return StopReport {
                execution_id: execution_id.to_string(),
                exit_code: recorded,
                outcome,
                noop: true,
            };
        }
        info!(%execution_id, exit_code, forced = outcome.forced, "Execution stopped");

        StopReport {
            execution_id: execution_id.to_string(),
            exit_code: Some(exit_code),
            outcome,
            noop: false,
        }
    }

    /// Ask the owning process to stop and wait for its terminal record
    async fn stop_remote(&self, execution_id: &str) -> StopReport {
        if !self.state.request_stop(execution_id).await {
            warn!(%execution_id, "Failed to request stop");
            return StopReport {
                execution_id: execution_id.to_string(),
                exit_code: None,
                outcome: StopOutcome::default(),
                noop: false,
            };
        }
        info!(%execution_id, wait = ?self.remote_stop_wait, "Stop requested from the owning process");

        let deadline = Instant::now() + self.remote_stop_wait;
        loop {
            if let Some(record) = self.state.get_execution(execution_id).await
                && record.is_terminal()
            {
                info!(%execution_id, status = ?record.status, exit_code = ?record.exit_code, "Owner recorded the stop");
                return StopReport {
                    execution_id: execution_id.to_string(),
                    exit_code: record.exit_code,
                    outcome: StopOutcome::default(),
                    noop: !record.stopped,
                };
            }
            if Instant::now() >= deadline {
                warn!(%execution_id, "Owning process has not confirmed the stop yet");
                return StopReport {
                    execution_id: execution_id.to_string(),
                    exit_code: None,
                    outcome: StopOutcome::default(),
                    noop: false,
                };
            }
            tokio::time::sleep(self.cadence.idle_sleep()).await;
        }
    }

    /// Stop whatever is live and report `closed`
    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        if let Some(execution_id) = self.current_execution().await {
            warn!(%execution_id, "Stopping active execution for shutdown");
            self.stop(&execution_id).await;
        }
        self.change_status(ServerStatus::Closed, None, None).await;
    }
}
