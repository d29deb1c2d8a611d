//! Shared state layer
//!
//! `StateBackend` is the minimal persistence contract with an embedded
//! (SQLite) and a networked (redis) implementation. `StateCoordinator` holds
//! all execution/pause-control/server-status logic on top of it.

mod backend;
mod coordinator;
mod factory;
mod recovery;
mod redis;
mod sqlite;

pub use backend::{BackendError, FieldMap, StateBackend};
pub use coordinator::{ORPHANED_ERROR, StateCoordinator, execution_key, pause_control_key, server_status_key};
pub use factory::connect_backend;
pub use recovery::{RecoveryStats, recover};
pub use self::redis::RedisBackend;
pub use sqlite::SqliteBackend;
