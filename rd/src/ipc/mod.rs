//! Local command transport
//!
//! Unix domain socket between the `rd` CLI and the agent daemon. Each
//! connection carries one JSON request line and one JSON response line.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;

pub use client::AgentClient;
pub use listener::{cleanup_socket, create_listener, create_listener_at, dispatch, serve};
pub use messages::{AgentRequest, AgentResponse};

/// Request/response cap; inline base64 files make submits large
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Socket path, next to the daemon's PID file
pub fn get_socket_path() -> PathBuf {
    crate::daemon::runtime_dir().join("robotd.sock")
}
