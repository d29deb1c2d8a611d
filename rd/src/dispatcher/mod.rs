//! TaskDispatcher - runs supervisor jobs on tokio tasks
//!
//! Submit a job, get a handle. At most one `Run` may be live per execution
//! id; the handle doubles as the execution's `task_handle` and can be used to
//! cancel it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{ExecutionSpec, ServerStatus};
use crate::supervisor::{ExecutionSupervisor, RunReport, StopReport, SupervisorError};

/// How long a cancelled run may take to leave its loop before being aborted
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Dispatcher job id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Work the dispatcher executes
#[derive(Debug, Clone)]
pub enum Job {
    Run(ExecutionSpec),
    Pause(String),
    Resume(String),
    Stop(String),
}

impl Job {
    fn kind(&self) -> JobKind {
        match self {
            Self::Run(_) => JobKind::Run,
            Self::Pause(_) => JobKind::Pause,
            Self::Resume(_) => JobKind::Resume,
            Self::Stop(_) => JobKind::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Run,
    Pause,
    Resume,
    Stop,
}

/// Outcome of a finished job
#[derive(Debug, Clone)]
pub enum JobResult {
    Run(Result<RunReport, String>),
    Pause(bool),
    Resume(bool),
    Stop(StopReport),
}

/// Errors from job admission
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Execution {0} already has an active run")]
    AlreadyActive(String),

    #[error("Agent is {0}, not accepting runs")]
    Busy(ServerStatus),

    #[error("Execution {0} has already finished")]
    AlreadyFinished(String),

    #[error("Unknown task handle {0}")]
    UnknownHandle(TaskHandle),

    #[error("Task {0} failed: {1}")]
    TaskFailed(TaskHandle, String),

    #[error("Unexpected job result: {0}")]
    UnexpectedResult(String),
}

struct JobEntry {
    kind: JobKind,
    execution_id: String,
    join: JoinHandle<JobResult>,
}

/// Job runner bound to one supervisor
pub struct TaskDispatcher {
    supervisor: Arc<ExecutionSupervisor>,
    jobs: Mutex<HashMap<TaskHandle, JobEntry>>,
}

impl TaskDispatcher {
    pub fn new(supervisor: Arc<ExecutionSupervisor>) -> Self {
        Self {
            supervisor,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a job
    ///
    /// `Run` claims the robot slot and persists the `pending` record before
    /// returning, so the execution is queryable as soon as the id is known.
    pub async fn submit(&self, job: Job) -> Result<(TaskHandle, String), DispatchError> {
        let handle = TaskHandle::new();
        let kind = job.kind();
        let mut jobs = self.jobs.lock().await;
        reap_finished(&mut jobs);

        let (execution_id, join) = match job {
            Job::Run(mut spec) => {
                let execution_id = spec.resolve_id();
                if jobs
                    .values()
                    .any(|j| j.kind == JobKind::Run && j.execution_id == execution_id)
                {
                    return Err(DispatchError::AlreadyActive(execution_id));
                }
                self.supervisor
                    .admit(&execution_id, &spec.robot_id, Some(&handle.to_string()))
                    .await
                    .map_err(|e| match e {
                        SupervisorError::Busy { status } => DispatchError::Busy(status),
                        SupervisorError::AlreadyFinished(id) => DispatchError::AlreadyFinished(id),
                        other => DispatchError::TaskFailed(handle, other.to_string()),
                    })?;

                let supervisor = self.supervisor.clone();
                let id = execution_id.clone();
                let join = tokio::spawn(async move {
                    let result = supervisor.run(spec, Some(handle.to_string())).await;
                    match &result {
                        Ok(report) => debug!(execution_id = %id, ?report, "run job: finished"),
                        Err(e) => error!(execution_id = %id, error = %e, "Run failed"),
                    }
                    JobResult::Run(result.map_err(|e| e.to_string()))
                });
                (execution_id, join)
            }
            Job::Pause(execution_id) => {
                let supervisor = self.supervisor.clone();
                let id = execution_id.clone();
                let join = tokio::spawn(async move { JobResult::Pause(supervisor.pause_request(&id).await) });
                (execution_id, join)
            }
            Job::Resume(execution_id) => {
                let supervisor = self.supervisor.clone();
                let id = execution_id.clone();
                let join = tokio::spawn(async move { JobResult::Resume(supervisor.resume_request(&id).await) });
                (execution_id, join)
            }
            Job::Stop(execution_id) => {
                let supervisor = self.supervisor.clone();
                let id = execution_id.clone();
                let join = tokio::spawn(async move { JobResult::Stop(supervisor.stop(&id).await) });
                (execution_id, join)
            }
        };

        info!(%handle, ?kind, %execution_id, "Job dispatched");
        jobs.insert(
            handle,
            JobEntry {
                kind,
                execution_id: execution_id.clone(),
                join,
            },
        );
        Ok((handle, execution_id))
    }

    /// Wait for a job and take its result
    pub async fn join(&self, handle: TaskHandle) -> Result<JobResult, DispatchError> {
        let entry = self
            .jobs
            .lock()
            .await
            .remove(&handle)
            .ok_or(DispatchError::UnknownHandle(handle))?;
        entry
            .join
            .await
            .map_err(|e| DispatchError::TaskFailed(handle, e.to_string()))
    }

    /// Cancel a job; a cancelled run is stopped before its task is aborted
    pub async fn cancel(&self, handle: TaskHandle) -> Result<(), DispatchError> {
        debug!(%handle, "cancel: called");
        let mut entry = self
            .jobs
            .lock()
            .await
            .remove(&handle)
            .ok_or(DispatchError::UnknownHandle(handle))?;

        if entry.kind == JobKind::Run && !entry.join.is_finished() {
            self.supervisor.stop(&entry.execution_id).await;
            // The run loop notices the stop on its next poll
            if tokio::time::timeout(CANCEL_GRACE, &mut entry.join).await.is_err() {
                warn!(%handle, "Run did not wind down in time, aborting");
            }
        }
        entry.join.abort();
        warn!(%handle, execution_id = %entry.execution_id, "Job cancelled");
        Ok(())
    }

    /// Drop finished jobs; returns how many were removed
    pub async fn reap(&self) -> usize {
        reap_finished(&mut *self.jobs.lock().await)
    }

    /// Execution ids with a live run job
    pub async fn active_runs(&self) -> Vec<String> {
        let jobs = self.jobs.lock().await;
        let mut ids: Vec<String> = jobs
            .values()
            .filter(|j| j.kind == JobKind::Run && !j.join.is_finished())
            .map(|j| j.execution_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Handle of the live run for `execution_id`
    pub async fn run_handle(&self, execution_id: &str) -> Option<TaskHandle> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .find(|(_, j)| j.kind == JobKind::Run && j.execution_id == execution_id && !j.join.is_finished())
            .map(|(handle, _)| *handle)
    }

    /// Wait for every outstanding job
    pub async fn drain(&self) {
        let entries: Vec<(TaskHandle, JobEntry)> = self.jobs.lock().await.drain().collect();
        for (handle, entry) in entries {
            if let Err(e) = entry.join.await {
                warn!(%handle, error = %e, "Job ended abnormally");
            }
        }
    }
}

fn reap_finished(jobs: &mut HashMap<TaskHandle, JobEntry>) -> usize {
    let before = jobs.len();
    jobs.retain(|_, job| !job.join.is_finished());
    let reaped = before - jobs.len();
    if reaped > 0 {
        debug!(reaped, remaining = jobs.len(), "reap_finished: done");
    }
    reaped
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::orchestrator::DisabledOrchestrator;
    use crate::state::{SqliteBackend, StateCoordinator};
    use serial_test::serial;
    use tempfile::TempDir;

    fn dispatcher(temp: &TempDir) -> TaskDispatcher {
        let mut config = Config::default();
        config.robot.work_dir = temp.path().join("runs");
        config.process.stop_timeout_ms = 1000;
        config.process.settle_delay_ms = 50;
        config.process.driver_names.clear();
        let state = StateCoordinator::new(Arc::new(SqliteBackend::open_in_memory().unwrap()));
        let supervisor = Arc::new(ExecutionSupervisor::new(&config, state, Arc::new(DisabledOrchestrator)));
        TaskDispatcher::new(supervisor)
    }

    fn sh_run(id: &str, script: &str) -> Job {
        Job::Run(
            ExecutionSpec::new("bot")
                .with_execution_id(id)
                .with_command(["sh", "-c", script]),
        )
    }

    #[test]
    fn test_task_handle_round_trip() {
        let handle = TaskHandle::new();
        assert_eq!(handle.to_string().parse::<TaskHandle>().unwrap(), handle);
        assert!("not-a-uuid".parse::<TaskHandle>().is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_one_run_per_execution_and_machine() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp);

        let (handle, id) = dispatcher.submit(sh_run("d-1", "sleep 30")).await.unwrap();
        assert_eq!(id, "d-1");
        assert!(matches!(
            dispatcher.submit(sh_run("d-1", "true")).await,
            Err(DispatchError::AlreadyActive(_))
        ));
        assert!(matches!(
            dispatcher.submit(sh_run("d-2", "true")).await,
            Err(DispatchError::Busy(_))
        ));
        assert_eq!(dispatcher.active_runs().await, vec!["d-1"]);
        assert_eq!(dispatcher.run_handle("d-1").await, Some(handle));

        dispatcher.cancel(handle).await.unwrap();
        assert!(dispatcher.active_runs().await.is_empty());
        assert!(matches!(
            dispatcher.cancel(handle).await,
            Err(DispatchError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_join_run_and_reap() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp);

        let (handle, _) = dispatcher.submit(sh_run("d-3", "exit 0")).await.unwrap();
        match dispatcher.join(handle).await.unwrap() {
            JobResult::Run(Ok(report)) => assert_eq!(report.exit_code, 0),
            other => panic!("unexpected result: {:?}", other),
        }

        let (_, _) = dispatcher.submit(Job::Pause("d-3".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.reap().await, 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_submitted_run_is_queryable_immediately() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp);

        let (handle, id) = dispatcher.submit(sh_run("d-4", "sleep 30")).await.unwrap();
        let record = dispatcher.supervisor.state().get_execution(&id).await.unwrap();
        assert!(!record.is_terminal());
        assert_eq!(record.robot_id.as_deref(), Some("bot"));
        assert_eq!(record.task_handle, Some(handle.to_string()));

        dispatcher.cancel(handle).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_finished_execution_is_not_resubmitted() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp);

        let (handle, _) = dispatcher.submit(sh_run("d-5", "exit 0")).await.unwrap();
        dispatcher.join(handle).await.unwrap();

        assert!(matches!(
            dispatcher.submit(sh_run("d-5", "exit 0")).await,
            Err(DispatchError::AlreadyFinished(id)) if id == "d-5"
        ));
        assert_eq!(dispatcher.supervisor.status().await, ServerStatus::Free);
        assert!(dispatcher.active_runs().await.is_empty());
    }
}
