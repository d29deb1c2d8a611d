//! robotd - robot execution agent
//!
//! Runs one robot at a time per machine as an OS process tree, with
//! pause/resume/stop over the whole tree and execution state kept in a
//! shared backend so a restarted agent can recover from a crash.
//!
//! # Modules
//!
//! - [`state`] - key-value/hash backends (SQLite, redis) and the coordinator
//! - [`process`] - process tree snapshots, signals and the controller
//! - [`supervisor`] - the per-run state machine
//! - [`dispatcher`] - runs supervisor jobs on tokio tasks
//! - [`agent`] - wires everything together for one machine
//! - [`orchestrator`] - best-effort remote status and log sink
//! - [`ipc`], [`daemon`], [`cli`] - the `rd` command surface

pub mod agent;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod domain;
pub mod ipc;
pub mod orchestrator;
pub mod process;
pub mod state;
pub mod supervisor;

pub use agent::{AgentContext, SubmittedRun};
pub use config::Config;
pub use dispatcher::{DispatchError, Job, JobResult, TaskDispatcher, TaskHandle};
pub use domain::{ExecutionRecord, ExecutionSpec, ExecutionStatus, ServerStatus};
pub use orchestrator::{OrchestratorClient, create_client};
pub use process::{ProcessController, StopOutcome};
pub use state::{StateBackend, StateCoordinator, connect_backend, recover};
pub use supervisor::{ExecutionSupervisor, RunReport, StopReport, SupervisorError};
