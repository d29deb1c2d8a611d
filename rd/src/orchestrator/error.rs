//! Orchestrator error types

use thiserror::Error;

/// Errors talking to the remote orchestrator
///
/// Never fatal: callers log these and keep their local state.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Orchestrator is not configured")]
    Disabled,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}
