//! Pause control flags and machine availability status

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::state::FieldMap;

pub const PAUSE_REQUESTED: &str = "pause_requested";
pub const RESUME_REQUESTED: &str = "resume_requested";
pub const STOP_REQUESTED: &str = "stop_requested";
pub const UPDATED_AT: &str = "updated_at";

/// Out-of-band pause/resume/stop request flags for one execution
///
/// This is a request queue of size one per direction, consumed by whichever
/// process owns the robot's process tree. It is never the authority on
/// whether the robot is actually suspended or stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseControl {
    pub pause_requested: bool,
    pub resume_requested: bool,
    pub stop_requested: bool,
}

impl PauseControl {
    /// Parse the `execution:{id}:pause_control` hash; absent fields read as `false`
    pub fn from_fields(map: &FieldMap) -> Self {
        let flag = |name: &str| map.get(name).is_some_and(|v| v == "true" || v == "1");
        Self {
            pause_requested: flag(PAUSE_REQUESTED),
            resume_requested: flag(RESUME_REQUESTED),
            stop_requested: flag(STOP_REQUESTED),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.pause_requested && !self.resume_requested && !self.stop_requested
    }
}

/// Externally visible availability of this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Accepting new runs
    #[default]
    Free,
    /// A robot is executing
    Running,
    /// Preparing a run; not accepting admissions
    Blocked,
    /// The robot is suspended
    Paused,
    /// The agent is shutting down
    Closed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "paused" => Ok(Self::Paused),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown server status: {}", other)),
        }
    }
}
