//! Remote orchestrator sink
//!
//! Status transitions and robot output are reported to the console API on a
//! best-effort basis. Nothing here may block or roll back local state.

use std::sync::Arc;

use tracing::{info, warn};

pub mod client;
mod error;
mod forwarder;
mod http;

pub use client::{DisabledOrchestrator, LogSeverity, OrchestratorClient};
pub use error::OrchestratorError;
pub use forwarder::{DEFAULT_LOG_BUFFER, LogForwarder};
pub use http::HttpOrchestratorClient;

use crate::config::OrchestratorConfig;

/// Create the configured orchestrator client
///
/// Falls back to the disabled sink when no URL is set or the HTTP client
/// cannot be built.
pub fn create_client(config: &OrchestratorConfig) -> Arc<dyn OrchestratorClient> {
    match HttpOrchestratorClient::from_config(config) {
        Ok(Some(client)) => {
            info!(base_url = ?config.base_url, "Orchestrator notifications enabled");
            Arc::new(client)
        }
        Ok(None) => {
            info!("No orchestrator configured, notifications disabled");
            Arc::new(DisabledOrchestrator)
        }
        Err(e) => {
            warn!(error = %e, "Failed to build orchestrator client, notifications disabled");
            Arc::new(DisabledOrchestrator)
        }
    }
}
