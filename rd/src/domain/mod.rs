//! Domain types for robotd
//!
//! Execution records, pause control flags, server availability, run specs
//! and exit classification. Persisted types convert to and from the flat
//! string hashes the state backends store.

mod control;
pub mod execution;
mod id;
mod outcome;
mod spec;

pub use control::{PauseControl, ServerStatus};
pub use execution::{ExecutionRecord, ExecutionStatus, ExecutionUpdate, now_rfc3339};
pub use id::generate_id;
pub use outcome::{ExitOutcome, STOPPED_MANUALLY};
pub use spec::ExecutionSpec;

pub(crate) use control::{PAUSE_REQUESTED, RESUME_REQUESTED, STOP_REQUESTED, UPDATED_AT};
