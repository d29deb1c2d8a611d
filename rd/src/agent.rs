//! AgentContext - the per-machine agent
//!
//! Owns the state coordinator, supervisor and dispatcher for one machine and
//! exposes the command surface the IPC server (or an embedding caller) uses.
//! Construction runs orphan recovery before the agent reports itself `free`.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchError, Job, JobResult, TaskDispatcher, TaskHandle};
use crate::domain::{ExecutionRecord, ExecutionSpec, ServerStatus};
use crate::orchestrator::{OrchestratorClient, create_client};
use crate::state::{RecoveryStats, StateBackend, StateCoordinator, connect_backend, recover};
use crate::supervisor::{ExecutionSupervisor, StopReport};

/// How long shutdown waits for outstanding jobs
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedRun {
    pub execution_id: String,
    pub task_handle: TaskHandle,
}

pub struct AgentContext {
    machine_id: String,
    state: StateCoordinator,
    supervisor: Arc<ExecutionSupervisor>,
    dispatcher: TaskDispatcher,
    recovery: RecoveryStats,
}

impl AgentContext {
    /// Connect the configured backend and bring the agent up
    pub async fn start(config: &Config) -> Result<Self> {
        debug!(machine_id = %config.machine_id, "start: called");
        let backend = connect_backend(&config.state)
            .await
            .context("Failed to connect state backend")?;
        let orchestrator = create_client(&config.orchestrator);
        Ok(Self::start_with(config, backend, orchestrator).await)
    }

    /// Bring the agent up on an already connected backend
    pub async fn start_with(
        config: &Config,
        backend: Arc<dyn StateBackend>,
        orchestrator: Arc<dyn OrchestratorClient>,
    ) -> Self {
        let state = StateCoordinator::new(backend);
        state.set_machine_id(config.machine_id.clone());
        info!(machine_id = %config.machine_id, backend = state.backend_name(), "Agent starting");

        // Must finish before the agent reports free
        let recovery = recover(&state).await;

        let supervisor = Arc::new(ExecutionSupervisor::new(config, state.clone(), orchestrator));
        let dispatcher = TaskDispatcher::new(supervisor.clone());
        supervisor.change_status(ServerStatus::Free, None, None).await;
        info!(%recovery, "Agent ready");

        Self {
            machine_id: config.machine_id.clone(),
            state,
            supervisor,
            dispatcher,
            recovery,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.state.backend_name()
    }

    /// What startup recovery found
    pub fn recovery(&self) -> RecoveryStats {
        self.recovery
    }

    pub fn state(&self) -> &StateCoordinator {
        &self.state
    }

    /// Admit a run; rejected with `Busy` unless the agent is `free`
    pub async fn submit_run(&self, spec: ExecutionSpec) -> Result<SubmittedRun, DispatchError> {
        debug!(robot_id = %spec.robot_id, execution_id = ?spec.execution_id, "submit_run: called");
        let (task_handle, execution_id) = self.dispatcher.submit(Job::Run(spec)).await?;
        Ok(SubmittedRun {
            execution_id,
            task_handle,
        })
    }

    /// Stop an execution and wait for the stop to complete
    pub async fn request_stop(&self, execution_id: &str) -> Result<StopReport, DispatchError> {
        debug!(%execution_id, "request_stop: called");
        match self.run_job(Job::Stop(execution_id.to_string())).await? {
            JobResult::Stop(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Flag a pause; false when the execution is unknown or finished
    pub async fn request_pause(&self, execution_id: &str) -> Result<bool, DispatchError> {
        debug!(%execution_id, "request_pause: called");
        match self.run_job(Job::Pause(execution_id.to_string())).await? {
            JobResult::Pause(accepted) => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    /// Flag a resume; false when the execution is unknown or finished
    pub async fn request_resume(&self, execution_id: &str) -> Result<bool, DispatchError> {
        debug!(%execution_id, "request_resume: called");
        match self.run_job(Job::Resume(execution_id.to_string())).await? {
            JobResult::Resume(accepted) => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    /// Persisted server status; `None` reads as "unknown"
    pub async fn query_status(&self) -> Option<ServerStatus> {
        self.state.get_server_status().await
    }

    /// Local status as held by the supervisor
    pub async fn local_status(&self) -> ServerStatus {
        self.supervisor.status().await
    }

    pub async fn current_execution(&self) -> Option<String> {
        self.supervisor.current_execution().await
    }

    pub async fn query_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.state.get_execution(execution_id).await
    }

    pub async fn list_executions(&self) -> Vec<String> {
        self.state.list_execution_ids().await
    }

    /// Wait for a submitted run to finish
    pub async fn wait_run(&self, task_handle: TaskHandle) -> Result<JobResult, DispatchError> {
        self.dispatcher.join(task_handle).await
    }

    /// Drop bookkeeping for finished jobs
    pub async fn reap(&self) -> usize {
        self.dispatcher.reap().await
    }

    /// Stop any live run, report `closed` and close the backend
    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        info!(machine_id = %self.machine_id, "Agent shutting down");
        self.supervisor.shutdown().await;
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, self.dispatcher.drain())
            .await
            .is_err()
        {
            warn!(timeout = ?SHUTDOWN_DRAIN_TIMEOUT, "Jobs still running at shutdown");
        }
        self.state.close().await;
        info!("Agent shut down");
    }

    async fn run_job(&self, job: Job) -> Result<JobResult, DispatchError> {
        let (handle, _) = self.dispatcher.submit(job).await?;
        self.dispatcher.join(handle).await
    }
}

fn unexpected(result: JobResult) -> DispatchError {
    DispatchError::UnexpectedResult(format!("{:?}", result))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStatus, ExecutionUpdate};
    use crate::orchestrator::DisabledOrchestrator;
    use crate::state::SqliteBackend;
    use serial_test::serial;
    use tempfile::TempDir;

    async fn agent(temp: &TempDir) -> AgentContext {
        let mut config = Config::default();
        config.machine_id = "agent-test".to_string();
        config.robot.work_dir = temp.path().join("runs");
        config.process.stop_timeout_ms = 1000;
        config.process.settle_delay_ms = 50;
        config.process.driver_names.clear();
        let backend = Arc::new(SqliteBackend::open(temp.path().join("state.db")).unwrap());
        AgentContext::start_with(&config, backend, Arc::new(DisabledOrchestrator)).await
    }

    #[tokio::test]
    async fn test_start_recovers_and_reports_free() {
        let temp = TempDir::new().unwrap();
        {
            let backend = SqliteBackend::open(temp.path().join("state.db")).unwrap();
            let state = StateCoordinator::new(Arc::new(backend));
            state
                .save_execution_state("crashed", ExecutionUpdate::new().status(ExecutionStatus::Running))
                .await;
        }

        let agent = agent(&temp).await;
        assert_eq!(agent.recovery().recovered, 1);
        assert_eq!(agent.query_status().await, Some(ServerStatus::Free));
        let record = agent.query_execution("crashed").await.unwrap();
        assert_eq!(record.status, Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    #[serial]
    async fn test_submit_and_wait() {
        let temp = TempDir::new().unwrap();
        let agent = agent(&temp).await;

        let submitted = agent
            .submit_run(ExecutionSpec::new("Invoice Bot").with_command(["sh", "-c", "echo hi"]))
            .await
            .unwrap();
        assert!(submitted.execution_id.ends_with("-run-invoice-bot"));

        agent.wait_run(submitted.task_handle).await.unwrap();
        let record = agent.query_execution(&submitted.execution_id).await.unwrap();
        assert_eq!(record.status, Some(ExecutionStatus::Completed));
        assert_eq!(record.task_handle, Some(submitted.task_handle.to_string()));
        assert_eq!(agent.local_status().await, ServerStatus::Free);
    }

    #[tokio::test]
    #[serial]
    async fn test_busy_rejection_and_stop() {
        let temp = TempDir::new().unwrap();
        let agent = agent(&temp).await;

        let first = agent
            .submit_run(
                ExecutionSpec::new("bot")
                    .with_execution_id("long")
                    .with_command(["sleep", "30"]),
            )
            .await
            .unwrap();
        let second = agent
            .submit_run(ExecutionSpec::new("bot").with_command(["true"]))
            .await;
        assert!(matches!(second, Err(DispatchError::Busy(_))));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = agent.request_stop(&first.execution_id).await.unwrap();
        assert!(!report.noop);

        let again = agent.request_stop(&first.execution_id).await.unwrap();
        assert!(again.noop);
        assert_eq!(agent.local_status().await, ServerStatus::Free);
    }

    #[tokio::test]
    async fn test_pause_unknown_execution() {
        let temp = TempDir::new().unwrap();
        let agent = agent(&temp).await;
        assert!(!agent.request_pause("missing").await.unwrap());
        assert!(!agent.request_resume("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_reports_closed() {
        let temp = TempDir::new().unwrap();
        let agent = agent(&temp).await;
        agent.shutdown().await;
        assert_eq!(agent.local_status().await, ServerStatus::Closed);
    }
}
