//! CLI command definitions and subcommands

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::daemon::{DaemonManager, VERSION};
use crate::supervisor::INLINE_FILE_PREFIX;

/// robotd - robot execution agent
#[derive(Parser)]
#[command(
    name = "rd",
    about = "Run robots under process-tree control with crash-safe shared state",
    version = VERSION,
)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the agent daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Internal: run as the daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,

    /// Submit a robot run
    Submit {
        /// Robot identifier
        robot_id: String,

        /// Execution id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Parameter as KEY=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// File parameter as KEY=PATH, sent inline (repeatable)
        #[arg(short, long = "file", value_name = "KEY=PATH")]
        files: Vec<String>,

        /// Robot command override (everything after `--`)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Request a pause of a running execution
    Pause { id: String },

    /// Request a resume of a paused execution
    Resume { id: String },

    /// Stop an execution and its process tree
    Stop { id: String },

    /// Show the agent's status
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one execution record
    Show {
        id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List known executions
    List,

    /// Show agent logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ping the daemon over IPC
    Ping,
}

/// Split `KEY=VALUE`; the key must be non-empty
pub fn parse_key_value(arg: &str) -> Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| eyre::eyre!("Expected KEY=VALUE, got {:?}", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(eyre::eyre!("Empty key in {:?}", arg));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Encode a local file as an inline `base64:<file-name>:<payload>` parameter
pub fn inline_file_param(path: &Path) -> Result<String> {
    debug!(?path, "inline_file_param: called");
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre::eyre!("No usable file name in {}", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{}{}:{}", INLINE_FILE_PREFIX, name, STANDARD.encode(bytes)))
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("robotd")
        .join("logs")
        .join("robotd.log")
}

/// after_help text: daemon state and where logs go
pub fn generate_after_help() -> String {
    let daemon = DaemonManager::new();
    let (icon, state) = match daemon.running_pid() {
        Some(_) => ("\u{2705}", "running"),
        None => ("\u{274C}", "stopped"),
    };
    format!(
        "Daemon:\n  {} {}\n\nLogs are written to: {}\n",
        icon,
        state,
        get_log_path().display()
    )
}

/// Output format for status commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
