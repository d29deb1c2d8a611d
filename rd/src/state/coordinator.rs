//! StateCoordinator - execution records, pause control and server status
//!
//! Built only on `StateBackend` primitives so the embedded and networked
//! stores behave identically. Backend failures are logged and degrade to
//! empty/default results; nothing here aborts the agent.

use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::domain::{
    ExecutionRecord, ExecutionStatus, ExecutionUpdate, PAUSE_REQUESTED, PauseControl, RESUME_REQUESTED, STOP_REQUESTED,
    ServerStatus, UPDATED_AT, now_rfc3339,
};

use super::backend::{FieldMap, StateBackend};

const EXECUTION_PREFIX: &str = "execution:";
const PAUSE_CONTROL_SUFFIX: &str = ":pause_control";

/// Error recorded on executions found active at startup
pub const ORPHANED_ERROR: &str = "Execution orphaned: agent restarted while the run was active";

pub fn execution_key(execution_id: &str) -> String {
    format!("{}{}", EXECUTION_PREFIX, execution_id)
}

pub fn pause_control_key(execution_id: &str) -> String {
    format!("{}{}{}", EXECUTION_PREFIX, execution_id, PAUSE_CONTROL_SUFFIX)
}

pub fn server_status_key(machine_id: &str) -> String {
    format!("server:{}:status", machine_id)
}

/// Shared-state coordinator (cheap to clone)
#[derive(Clone)]
pub struct StateCoordinator {
    backend: Arc<dyn StateBackend>,
    machine_id: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for StateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCoordinator")
            .field("backend", &self.backend.name())
            .field("machine_id", &self.machine_id())
            .finish()
    }
}

impl StateCoordinator {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            machine_id: Arc::new(RwLock::new(None)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Raw backend, for callers that need key-level access
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Configure the machine id used for `server:{id}:status`
    pub fn set_machine_id(&self, machine_id: impl Into<String>) {
        let machine_id = machine_id.into();
        debug!(%machine_id, "set_machine_id: called");
        if let Ok(mut guard) = self.machine_id.write() {
            *guard = Some(machine_id);
        }
    }

    pub fn machine_id(&self) -> Option<String> {
        self.machine_id.read().ok().and_then(|guard| guard.clone())
    }

    // === Execution records ===

    /// Merge fields into `execution:{id}`; fields not present are left alone
    pub async fn save_execution_state(&self, execution_id: &str, fields: impl Into<FieldMap>) -> bool {
        let fields = fields.into();
        debug!(%execution_id, field_count = fields.len(), "save_execution_state: called");
        if fields.is_empty() {
            return true;
        }
        match self.backend.hash_set(&execution_key(execution_id), &fields).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%execution_id, error = %e, "Failed to save execution state");
                false
            }
        }
    }

    /// Raw record fields (empty when absent or unreadable)
    pub async fn get_execution_state(&self, execution_id: &str) -> FieldMap {
        debug!(%execution_id, "get_execution_state: called");
        match self.backend.hash_get_all(&execution_key(execution_id)).await {
            Ok(map) => map,
            Err(e) => {
                warn!(%execution_id, error = %e, "Failed to read execution state");
                FieldMap::new()
            }
        }
    }

    /// Typed record, `None` when absent
    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        let map = self.get_execution_state(execution_id).await;
        ExecutionRecord::from_fields(execution_id, &map)
    }

    /// Ids of every stored execution record
    pub async fn list_execution_ids(&self) -> Vec<String> {
        let pattern = format!("{}*", EXECUTION_PREFIX);
        match self.backend.keys(&pattern).await {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| !k.ends_with(PAUSE_CONTROL_SUFFIX))
                .filter_map(|k| k.strip_prefix(EXECUTION_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list executions");
                Vec::new()
            }
        }
    }

    // === Server status ===

    /// Publish this machine's availability; no-op without a machine id
    pub async fn set_server_status(&self, status: ServerStatus) {
        let Some(machine_id) = self.machine_id() else {
            warn!(%status, "Server status not reported: machine id is not configured");
            return;
        };
        debug!(%machine_id, %status, "set_server_status: called");
        if let Err(e) = self.backend.set(&server_status_key(&machine_id), status.as_str()).await {
            warn!(%machine_id, %status, error = %e, "Failed to set server status");
        }
    }

    /// This machine's published status; `None` reads as "unknown"
    pub async fn get_server_status(&self) -> Option<ServerStatus> {
        let Some(machine_id) = self.machine_id() else {
            warn!("Server status unknown: machine id is not configured");
            return None;
        };
        match self.backend.get(&server_status_key(&machine_id)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                warn!(%machine_id, error = %e, "Failed to read server status");
                None
            }
        }
    }

    // === Pause control ===

    /// Flag a pause request; an outstanding resume request is left in place
    pub async fn request_pause(&self, execution_id: &str) -> bool {
        debug!(%execution_id, "request_pause: called");
        let fields = control_fields(&[(PAUSE_REQUESTED, "true")]);
        self.write_pause_control(execution_id, fields).await
    }

    /// Flag a resume request and withdraw any pending pause request
    pub async fn request_resume(&self, execution_id: &str) -> bool {
        debug!(%execution_id, "request_resume: called");
        let fields = control_fields(&[(RESUME_REQUESTED, "true"), (PAUSE_REQUESTED, "false")]);
        self.write_pause_control(execution_id, fields).await
    }

    /// Ask whichever process owns the run to stop it
    ///
    /// Only the owner kills the tree and writes the terminal record.
    pub async fn request_stop(&self, execution_id: &str) -> bool {
        debug!(%execution_id, "request_stop: called");
        let fields = control_fields(&[(STOP_REQUESTED, "true")]);
        self.write_pause_control(execution_id, fields).await
    }

    /// Current flags, all `false` when absent or unreadable
    pub async fn get_pause_control(&self, execution_id: &str) -> PauseControl {
        match self.backend.hash_get_all(&pause_control_key(execution_id)).await {
            Ok(map) => PauseControl::from_fields(&map),
            Err(e) => {
                warn!(%execution_id, error = %e, "Failed to read pause control");
                PauseControl::default()
            }
        }
    }

    /// Drop the whole pause-control record
    pub async fn clear_pause_control(&self, execution_id: &str) {
        debug!(%execution_id, "clear_pause_control: called");
        if let Err(e) = self.backend.delete(&[pause_control_key(execution_id)]).await {
            warn!(%execution_id, error = %e, "Failed to clear pause control");
        }
    }

    /// Reset pause and resume flags, leaving a pending stop request in place
    pub async fn clear_pause_flags(&self, execution_id: &str) {
        debug!(%execution_id, "clear_pause_flags: called");
        let fields = control_fields(&[(PAUSE_REQUESTED, "false"), (RESUME_REQUESTED, "false")]);
        self.write_pause_control(execution_id, fields).await;
    }

    /// Reset only the resume flag (stale request consumed)
    pub async fn clear_resume_request(&self, execution_id: &str) {
        debug!(%execution_id, "clear_resume_request: called");
        let fields = control_fields(&[(RESUME_REQUESTED, "false")]);
        self.write_pause_control(execution_id, fields).await;
    }

    async fn write_pause_control(&self, execution_id: &str, fields: FieldMap) -> bool {
        match self.backend.hash_set(&pause_control_key(execution_id), &fields).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%execution_id, error = %e, "Failed to write pause control");
                false
            }
        }
    }

    // === Crash recovery ===

    /// Force every execution left pending/running/paused to `failed`
    ///
    /// Called once at startup, before any command is accepted. No process
    /// tree survives a restart, so an active record cannot be corroborated.
    pub async fn mark_orphaned_executions_as_failed(&self) -> usize {
        debug!("mark_orphaned_executions_as_failed: called");
        let mut recovered = 0;

        for execution_id in self.list_execution_ids().await {
            let map = self.get_execution_state(&execution_id).await;
            let status = map.get(crate::domain::execution::fields::STATUS).and_then(|s| s.parse().ok());
            if !matches!(
                status,
                Some(ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Pending)
            ) {
                continue;
            }

            warn!(%execution_id, ?status, "Marking orphaned execution as failed");
            let update = ExecutionUpdate::new()
                .status(ExecutionStatus::Failed)
                .error(ORPHANED_ERROR)
                .finished_now();
            if self.save_execution_state(&execution_id, update).await {
                recovered += 1;
            }
            self.clear_pause_control(&execution_id).await;
        }

        if recovered > 0 {
            info!(recovered, "Recovered orphaned executions");
        }
        recovered
    }

    // === Lifecycle ===

    pub async fn ping(&self) -> bool {
        self.backend.ping().await
    }

    pub async fn close(&self) {
        debug!(backend = self.backend.name(), "close: called");
        self.backend.close().await;
    }
}

fn control_fields(flags: &[(&str, &str)]) -> FieldMap {
    let mut fields: FieldMap = flags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    fields.insert(UPDATED_AT.to_string(), now_rfc3339());
    fields
}
