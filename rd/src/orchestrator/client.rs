//! OrchestratorClient trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ExecutionStatus;

use super::OrchestratorError;

/// Severity attached to a forwarded log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    #[default]
    Info,
    Error,
}

impl std::fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Best-effort sink for lifecycle transitions and robot output
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Announce a status change; `actually_started` marks the moment right
    /// before the robot is spawned, after setup finished
    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        actually_started: bool,
    ) -> Result<(), OrchestratorError>;

    async fn send_log(&self, execution_id: &str, message: &str, severity: LogSeverity) -> Result<(), OrchestratorError>;

    /// Whether calls actually leave the machine
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Sink used when no orchestrator URL is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOrchestrator;

#[async_trait]
impl OrchestratorClient for DisabledOrchestrator {
    async fn set_status(&self, _: &str, _: ExecutionStatus, _: bool) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::Disabled)
    }

    async fn send_log(&self, _: &str, _: &str, _: LogSeverity) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::Disabled)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Recorded call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Status {
            execution_id: String,
            status: ExecutionStatus,
            actually_started: bool,
        },
        Log {
            execution_id: String,
            message: String,
            severity: LogSeverity,
        },
    }

    /// Orchestrator that records every call
    #[derive(Default)]
    pub struct RecordingOrchestrator {
        calls: Mutex<Vec<Call>>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl RecordingOrchestrator {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call records and then fails
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        /// Every call sleeps before answering
        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn statuses(&self) -> Vec<(ExecutionStatus, bool)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Status {
                        status,
                        actually_started,
                        ..
                    } => Some((status, actually_started)),
                    Call::Log { .. } => None,
                })
                .collect()
        }

        pub fn logs(&self) -> Vec<(String, LogSeverity)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Log { message, severity, .. } => Some((message, severity)),
                    Call::Status { .. } => None,
                })
                .collect()
        }

        async fn finish(&self, call: Call) -> Result<(), OrchestratorError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(call);
            if self.fail {
                return Err(OrchestratorError::ApiError {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OrchestratorClient for RecordingOrchestrator {
        async fn set_status(
            &self,
            execution_id: &str,
            status: ExecutionStatus,
            actually_started: bool,
        ) -> Result<(), OrchestratorError> {
            self.finish(Call::Status {
                execution_id: execution_id.to_string(),
                status,
                actually_started,
            })
            .await
        }

        async fn send_log(
            &self,
            execution_id: &str,
            message: &str,
            severity: LogSeverity,
        ) -> Result<(), OrchestratorError> {
            self.finish(Call::Log {
                execution_id: execution_id.to_string(),
                message: message.to_string(),
                severity,
            })
            .await
        }
    }
}
