//! Crash recovery
//!
//! Executions left active by an unclean shutdown are forced to `failed`
//! before the agent reports itself available.

use tracing::{debug, info, warn};

use super::StateCoordinator;

/// Recovery statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Execution records examined
    pub scanned: usize,
    /// Records forced to failed
    pub recovered: usize,
    /// Whether the sweep was skipped because the backend was unreachable
    pub skipped: bool,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "skipped (state backend unreachable)");
        }
        write!(f, "scanned: {}, recovered: {}", self.scanned, self.recovered)
    }
}

/// Run the startup orphan sweep
pub async fn recover(state: &StateCoordinator) -> RecoveryStats {
    debug!("recover: called");
    if !state.ping().await {
        warn!(backend = state.backend_name(), "Recovery skipped: state backend did not answer");
        return RecoveryStats {
            skipped: true,
            ..Default::default()
        };
    }

    let scanned = state.list_execution_ids().await.len();
    let recovered = state.mark_orphaned_executions_as_failed().await;
    let stats = RecoveryStats {
        scanned,
        recovered,
        skipped: false,
    };

    if recovered > 0 {
        info!("Recovery found incomplete work: {}", stats);
    } else {
        debug!("Recovery found no incomplete work: {}", stats);
    }
    stats
}
