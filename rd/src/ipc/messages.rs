//! IPC message types
//!
//! One line of JSON per request and per response.

use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionRecord, ExecutionSpec};

/// Requests from the CLI to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum AgentRequest {
    SubmitRun { spec: ExecutionSpec },
    Stop { id: String },
    Pause { id: String },
    Resume { id: String },
    Status,
    Show { id: String },
    List,
    Ping,
    Shutdown,
}

/// Responses from the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum AgentResponse {
    Ok,

    Submitted {
        execution_id: String,
        task_handle: String,
    },

    Stopped {
        execution_id: String,
        exit_code: Option<i32>,
        forced: bool,
        noop: bool,
    },

    /// Pause/resume flag outcome
    Accepted { accepted: bool },

    Status {
        machine_id: String,
        /// Persisted status or "unknown"
        status: String,
        current_execution: Option<String>,
        backend: String,
    },

    Execution { record: Option<ExecutionRecord> },

    Executions { ids: Vec<String> },

    Pong { version: String },

    Error { message: String },
}
