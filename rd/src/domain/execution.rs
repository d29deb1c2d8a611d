//! Execution domain types
//!
//! An execution is one run of the robot. Its persisted form is a flat hash of
//! string fields (`execution:{id}`); `ExecutionRecord` is the typed view and
//! `ExecutionUpdate` builds partial updates that only touch the fields a
//! caller actually changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::state::FieldMap;

/// Hash field names of an execution record
pub mod fields {
    pub const STATUS: &str = "status";
    pub const ROBOT_ID: &str = "robot_id";
    pub const TASK_HANDLE: &str = "task_handle";
    pub const PID: &str = "pid";
    pub const STARTED_AT: &str = "started_at";
    pub const FINISHED_AT: &str = "finished_at";
    pub const PAUSED_AT: &str = "paused_at";
    pub const RESUMED_AT: &str = "resumed_at";
    pub const EXIT_CODE: &str = "exit_code";
    pub const ERROR: &str = "error";
    pub const STOPPED: &str = "stopped";
}

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet spawned
    #[default]
    Pending,
    /// Robot process is live
    Running,
    /// Robot process tree is suspended
    Paused,
    /// Robot exited cleanly or was stopped
    Completed,
    /// Setup error, non-zero exit, or crash recovery
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// Transitions are monotone except `paused <-> running`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (Pending, _) => true,
            (Running, Pending) => false,
            (Running, _) => true,
            (Paused, Pending) => false,
            (Paused, _) => true,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Typed view over an `execution:{id}` hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub status: Option<ExecutionStatus>,
    pub robot_id: Option<String>,
    pub task_handle: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Set when the run ended through an explicit stop
    pub stopped: bool,
}

impl ExecutionRecord {
    /// Build from raw hash fields; `None` when the hash is empty
    ///
    /// Unparseable fields are skipped rather than failing the whole record.
    pub fn from_fields(execution_id: &str, map: &FieldMap) -> Option<Self> {
        if map.is_empty() {
            return None;
        }
        debug!(%execution_id, field_count = map.len(), "ExecutionRecord::from_fields: called");

        let text = |name: &str| map.get(name).filter(|v| !v.is_empty()).cloned();
        let time = |name: &str| {
            map.get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Some(Self {
            execution_id: execution_id.to_string(),
            status: map.get(fields::STATUS).and_then(|s| s.parse().ok()),
            robot_id: text(fields::ROBOT_ID),
            task_handle: text(fields::TASK_HANDLE),
            pid: map.get(fields::PID).and_then(|v| v.parse().ok()),
            started_at: time(fields::STARTED_AT),
            finished_at: time(fields::FINISHED_AT),
            paused_at: time(fields::PAUSED_AT),
            resumed_at: time(fields::RESUMED_AT),
            exit_code: map.get(fields::EXIT_CODE).and_then(|v| v.parse().ok()),
            error: text(fields::ERROR),
            stopped: map.get(fields::STOPPED).is_some_and(|v| v == "true"),
        })
    }

    /// Whether the record is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }
}

/// Builder for a partial execution update (merge semantics)
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    fields: FieldMap,
}

impl ExecutionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn status(self, status: ExecutionStatus) -> Self {
        self.with(fields::STATUS, status.as_str())
    }

    pub fn robot_id(self, robot_id: &str) -> Self {
        self.with(fields::ROBOT_ID, robot_id)
    }

    pub fn task_handle(self, handle: &str) -> Self {
        self.with(fields::TASK_HANDLE, handle)
    }

    pub fn pid(self, pid: u32) -> Self {
        self.with(fields::PID, pid)
    }

    pub fn exit_code(self, code: i32) -> Self {
        self.with(fields::EXIT_CODE, code)
    }

    pub fn error(self, error: impl Into<String>) -> Self {
        self.with(fields::ERROR, error.into())
    }

    pub fn stopped(self) -> Self {
        self.with(fields::STOPPED, "true")
    }

    pub fn started_now(self) -> Self {
        self.with(fields::STARTED_AT, now_rfc3339())
    }

    pub fn finished_now(self) -> Self {
        self.with(fields::FINISHED_AT, now_rfc3339())
    }

    pub fn paused_now(self) -> Self {
        self.with(fields::PAUSED_AT, now_rfc3339())
    }

    pub fn resumed_now(self) -> Self {
        self.with(fields::RESUMED_AT, now_rfc3339())
    }

    pub fn into_fields(self) -> FieldMap {
        self.fields
    }
}

impl From<ExecutionUpdate> for FieldMap {
    fn from(update: ExecutionUpdate) -> Self {
        update.into_fields()
    }
}

/// Current time in the string encoding used by persisted records
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
