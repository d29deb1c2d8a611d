//! robotd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main robotd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifier of this machine in the shared state (`server:{machine-id}:status`)
    #[serde(rename = "machine-id")]
    pub machine_id: String,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Shared state backend selection
    pub state: StateConfig,

    /// Robot launch settings
    pub robot: RobotConfig,

    /// Process tree control timings and orphan signatures
    pub process: ProcessConfig,

    /// Run loop cadence
    pub supervisor: SupervisorConfig,

    /// Remote orchestrator sink
    pub orchestrator: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
            log_level: None,
            state: StateConfig::default(),
            robot: RobotConfig::default(),
            process: ProcessConfig::default(),
            supervisor: SupervisorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

fn default_machine_id() -> String {
    sysinfo::System::host_name()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .robotd.yml
        let local_config = PathBuf::from(".robotd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/robotd/robotd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("robotd").join("robotd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is initialised
    ///
    /// Errors are swallowed: a broken config file is reported later by `load`.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(p) => p.clone(),
            None => {
                let local = PathBuf::from(".robotd.yml");
                if local.exists() {
                    local
                } else {
                    dirs::config_dir()?.join("robotd").join("robotd.yml")
                }
            }
        };
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which state backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Prefer redis when reachable at startup, else sqlite
    #[default]
    Auto,
    Redis,
    Sqlite,
}

/// Shared state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: BackendKind,

    #[serde(rename = "redis-url")]
    pub redis_url: String,

    /// How long to wait for redis at startup before falling back
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,

    /// Embedded store location
    #[serde(rename = "sqlite-path")]
    pub sqlite_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        let sqlite_path = dirs::data_local_dir()
            .map(|d| d.join("robotd"))
            .unwrap_or_else(|| PathBuf::from(".robotd"))
            .join("state.db");

        Self {
            backend: BackendKind::Auto,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            connect_timeout_ms: 1000,
            sqlite_path,
        }
    }
}

impl StateConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Robot launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// argv used to launch the robot when a run does not carry its own command
    pub command: Vec<String>,

    /// Base directory for per-run working directories
    #[serde(rename = "work-dir")]
    pub work_dir: PathBuf,

    /// Output lines containing any of these are forwarded as errors
    #[serde(rename = "error-markers")]
    pub error_markers: Vec<String>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        let work_dir = dirs::data_local_dir()
            .map(|d| d.join("robotd").join("runs"))
            .unwrap_or_else(|| PathBuf::from("/tmp/robotd/runs"));

        Self {
            command: vec!["python3".to_string(), "-m".to_string(), "robot".to_string()],
            work_dir,
            error_markers: vec!["ERROR".to_string(), "Traceback".to_string(), "FAIL".to_string()],
        }
    }
}

/// Process control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Grace period between terminate and force-kill
    #[serde(rename = "stop-timeout-ms")]
    pub stop_timeout_ms: u64,

    /// Delay before re-enumerating descendants on platforms where children appear late
    #[serde(rename = "rescan-delay-ms")]
    pub rescan_delay_ms: u64,

    /// Pause between termination and the orphan sweep
    #[serde(rename = "settle-delay-ms")]
    pub settle_delay_ms: u64,

    /// Automation processes younger than this are considered ours
    #[serde(rename = "orphan-window-secs")]
    pub orphan_window_secs: u64,

    /// Browser-driver executable names
    #[serde(rename = "driver-names")]
    pub driver_names: Vec<String>,

    /// Browser executable names
    #[serde(rename = "browser-names")]
    pub browser_names: Vec<String>,

    /// Command line flags that mark a browser as automation-launched
    #[serde(rename = "automation-flags")]
    pub automation_flags: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 3000,
            rescan_delay_ms: 500,
            settle_delay_ms: 500,
            orphan_window_secs: 600,
            driver_names: ["chromedriver", "geckodriver", "msedgedriver", "operadriver", "safaridriver"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            browser_names: ["chrome", "chromium", "chromium-browser", "google-chrome", "firefox", "msedge"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            automation_flags: [
                "--enable-automation",
                "--remote-debugging-port",
                "--marionette",
                "--headless",
                "--test-type",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ProcessConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn orphan_window(&self) -> Duration {
        Duration::from_secs(self.orphan_window_secs)
    }
}

/// Run loop cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often the pause-control flags are checked
    #[serde(rename = "pause-poll-ms")]
    pub pause_poll_ms: u64,

    /// Unconditional sleep between loop iterations
    #[serde(rename = "idle-sleep-ms")]
    pub idle_sleep_ms: u64,

    /// Upper bound on waiting for one output line
    #[serde(rename = "read-timeout-ms")]
    pub read_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: 500,
            idle_sleep_ms: 50,
            read_timeout_ms: 50,
        }
    }
}

impl SupervisorConfig {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Remote orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Console API base URL; notifications are disabled when unset
    #[serde(rename = "base-url")]
    pub base_url: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(rename = "token-env")]
    pub token_env: String,

    /// Per-request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: "ROBOTD_ORCHESTRATOR_TOKEN".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl OrchestratorConfig {
    /// Token from the configured environment variable, if set
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.machine_id.is_empty());
        assert_eq!(config.state.backend, BackendKind::Auto);
        assert_eq!(config.process.stop_timeout_ms, 3000);
        assert_eq!(config.process.orphan_window_secs, 600);
        assert_eq!(config.supervisor.pause_poll_ms, 500);
        assert_eq!(config.supervisor.idle_sleep_ms, 50);
        assert!(config.orchestrator.base_url.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
machine-id: bench-07
log-level: debug

state:
  backend: sqlite
  sqlite-path: /var/lib/robotd/state.db

robot:
  command: ["robot", "--outputdir", "out"]
  work-dir: /srv/runs

process:
  stop-timeout-ms: 1500
  driver-names: [chromedriver]

orchestrator:
  base-url: https://console.example.com/api
  timeout-ms: 2000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.machine_id, "bench-07");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.state.backend, BackendKind::Sqlite);
        assert_eq!(config.state.sqlite_path, PathBuf::from("/var/lib/robotd/state.db"));
        assert_eq!(config.robot.command, vec!["robot", "--outputdir", "out"]);
        assert_eq!(config.robot.work_dir, PathBuf::from("/srv/runs"));
        assert_eq!(config.process.stop_timeout(), Duration::from_millis(1500));
        assert_eq!(config.process.driver_names, vec!["chromedriver"]);
        assert_eq!(
            config.orchestrator.base_url.as_deref(),
            Some("https://console.example.com/api")
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
state:
  redis-url: redis://cache:6379/2
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.state.redis_url, "redis://cache:6379/2");
        assert_eq!(config.state.backend, BackendKind::Auto);
        assert_eq!(config.process.rescan_delay_ms, 500);
        assert!(config.process.automation_flags.contains(&"--enable-automation".to_string()));
        assert_eq!(config.orchestrator.token_env, "ROBOTD_ORCHESTRATOR_TOKEN");
    }
}
