//! OS process tree control
//!
//! `ProcessController` owns the robot's process tree for the life of a run;
//! `tree` and `signals` are the snapshot and per-pid primitives it uses.

mod controller;
pub mod signals;
mod tree;

pub use controller::{OutputLine, OutputStream, ProcessController, ProcessError, ProcessHandle, StopOutcome, exit_code_of};
pub use signals::ProcSignal;
pub use tree::{AutomationSignature, ProcessInfo, ProcessSnapshot, ProcessTable, started_within};
