//! rd - robotd command line
//!
//! Starts and stops the agent daemon and drives it over IPC.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use robotd::agent::AgentContext;
use robotd::cli::{
    Cli, Command, DaemonCommand, OutputFormat, generate_after_help, get_log_path, inline_file_param, parse_key_value,
};
use robotd::config::Config;
use robotd::daemon::DaemonManager;
use robotd::domain::{ExecutionRecord, ExecutionSpec};
use robotd::ipc::{self, AgentClient, AgentResponse};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("robotd")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("robotd.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(machine_id = %config.machine_id, backend = ?config.state.backend, "robotd loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => cmd_start(&config, cli.config.as_ref(), foreground).await,
            DaemonCommand::Stop => cmd_stop().await,
            DaemonCommand::Status { format } => cmd_daemon_status(format),
            DaemonCommand::Ping => cmd_ping().await,
        },
        Command::RunDaemon => cmd_run_daemon(&config).await,
        Command::Submit {
            robot_id,
            id,
            params,
            files,
            command,
        } => cmd_submit(robot_id, id, &params, &files, command).await,
        Command::Pause { id } => cmd_pause(&id).await,
        Command::Resume { id } => cmd_resume(&id).await,
        Command::Stop { id } => cmd_stop_execution(&id).await,
        Command::Status { format } => cmd_status(format).await,
        Command::Show { id, format } => cmd_show(&id, format).await,
        Command::List => cmd_list().await,
        Command::Logs { follow, lines } => cmd_logs(follow, lines),
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    let daemon = DaemonManager::new();

    if let Some(pid) = daemon.running_pid() {
        println!("robotd is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting robotd in foreground mode...");
        run_daemon(config).await
    } else {
        let pid = daemon.start(config_path.map(PathBuf::as_path))?;
        println!("robotd started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
///
/// Tries IPC shutdown first so a live run is stopped cleanly, then SIGTERM.
async fn cmd_stop() -> Result<()> {
    debug!("cmd_stop: called");
    let daemon = DaemonManager::new();
    let Some(pid) = daemon.running_pid() else {
        println!("robotd is not running");
        return Ok(());
    };

    let client = AgentClient::new();
    if client.socket_exists() {
        match client.shutdown().await {
            Ok(()) => {
                let mut attempts = 0;
                while daemon.is_running() && attempts < 100 {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    attempts += 1;
                }
                if !daemon.is_running() {
                    println!("robotd stopped gracefully (was PID: {})", pid);
                    return Ok(());
                }
                debug!("cmd_stop: IPC shutdown timed out, falling back to SIGTERM");
            }
            Err(e) => debug!(error = %e, "cmd_stop: IPC shutdown failed, falling back to SIGTERM"),
        }
    }

    daemon.stop()?;
    println!("robotd stopped (was PID: {})", pid);
    Ok(())
}

fn cmd_daemon_status(format: OutputFormat) -> Result<()> {
    let status = DaemonManager::new().status();
    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "version": status.version,
                "pid_file": status.pid_file.to_string_lossy(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if status.running {
                println!("Status: {}", "running".green());
            } else {
                println!("Status: {}", "stopped".red());
            }
            if let Some(pid) = status.pid {
                println!("PID: {}", pid);
            }
            if let Some(version) = status.version {
                println!("Version: {}", version);
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }
    Ok(())
}

async fn cmd_ping() -> Result<()> {
    let client = AgentClient::new();
    match client.ping().await {
        Ok(version) => println!("robotd is alive (version {})", version),
        Err(e) => println!("robotd is not responding: {}", e),
    }
    Ok(())
}

/// Run as the daemon process (internal command)
async fn cmd_run_daemon(config: &Config) -> Result<()> {
    debug!("cmd_run_daemon: called");
    let daemon = DaemonManager::new();
    daemon.register_self()?;
    let result = run_daemon(config).await;
    daemon.unregister();
    result
}

async fn run_daemon(config: &Config) -> Result<()> {
    info!("Daemon starting...");
    fs::create_dir_all(&config.robot.work_dir)
        .with_context(|| format!("Cannot create work dir {}", config.robot.work_dir.display()))?;

    let ctx = Arc::new(AgentContext::start(config).await?);
    info!(
        backend = ctx.backend_name(),
        recovery = %ctx.recovery(),
        "Agent started"
    );

    let (listener, socket_path) = ipc::create_listener()?;
    info!(?socket_path, "IPC socket listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let server = tokio::spawn(ipc::serve(listener, ctx.clone(), shutdown_rx));

    wait_for_shutdown(server, shutdown_tx).await?;

    info!("Daemon shutting down...");
    ctx.shutdown().await;
    ipc::cleanup_socket(&socket_path);
    info!("Daemon stopped");
    Ok(())
}

/// Block until a signal arrives or the server exits on an IPC `Shutdown`
async fn wait_for_shutdown(
    mut server: tokio::task::JoinHandle<Result<()>>,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = &mut server => return log_server_exit(result),
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut server => return log_server_exit(result),
            _ = tokio::signal::ctrl_c() => warn!("Ctrl+C received"),
        }
    }

    let _ = shutdown_tx.send(()).await;
    log_server_exit(server.await)
}

fn log_server_exit(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "IPC server failed");
            Err(e)
        }
        Err(e) => Err(eyre::eyre!("IPC server task failed: {}", e)),
    }
}

async fn cmd_submit(
    robot_id: String,
    id: Option<String>,
    params: &[String],
    files: &[String],
    command: Vec<String>,
) -> Result<()> {
    debug!(%robot_id, ?id, "cmd_submit: called");
    let mut spec = ExecutionSpec::new(robot_id);
    spec.execution_id = id;
    for param in params {
        let (key, value) = parse_key_value(param)?;
        spec.params.insert(key, value);
    }
    for file in files {
        let (key, path) = parse_key_value(file)?;
        spec.params.insert(key, inline_file_param(&PathBuf::from(path))?);
    }
    if !command.is_empty() {
        spec.command = Some(command);
    }

    let (execution_id, task_handle) = AgentClient::new().submit(spec).await?;
    println!("{}", execution_id);
    debug!(%execution_id, %task_handle, "cmd_submit: accepted");
    Ok(())
}

async fn cmd_pause(id: &str) -> Result<()> {
    if AgentClient::new().pause(id).await? {
        println!("Pause requested for {}", id);
    } else {
        println!("{}: no active execution", id);
    }
    Ok(())
}

async fn cmd_resume(id: &str) -> Result<()> {
    if AgentClient::new().resume(id).await? {
        println!("Resume requested for {}", id);
    } else {
        println!("{}: no active execution", id);
    }
    Ok(())
}

async fn cmd_stop_execution(id: &str) -> Result<()> {
    if let AgentResponse::Stopped {
        execution_id,
        exit_code,
        forced,
        noop,
    } = AgentClient::new().stop(id).await?
    {
        if noop {
            println!("{}: nothing to stop", execution_id);
        } else {
            let code = exit_code.map_or_else(|| "-".to_string(), |c| c.to_string());
            let how = if forced { " (killed)" } else { "" };
            println!("{} stopped, exit code {}{}", execution_id, code, how);
        }
    }
    Ok(())
}

async fn cmd_status(format: OutputFormat) -> Result<()> {
    let AgentResponse::Status {
        machine_id,
        status,
        current_execution,
        backend,
    } = AgentClient::new().status().await?
    else {
        return Ok(());
    };

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "machine_id": machine_id,
                "status": status,
                "current_execution": current_execution,
                "backend": backend,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Machine: {}", machine_id.bold());
            println!("Status: {}", status);
            println!("Execution: {}", current_execution.as_deref().unwrap_or("-"));
            println!("Backend: {}", backend);
        }
    }
    Ok(())
}

async fn cmd_show(id: &str, format: OutputFormat) -> Result<()> {
    let Some(record) = AgentClient::new().show(id).await? else {
        println!("{}: not found", id);
        return Ok(());
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Text => print_record(&record),
    }
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    let status = record.status.map_or("unknown", |s| s.as_str());
    println!("{} {}", record.execution_id.bold(), status);
    let rows = [
        ("robot", record.robot_id.clone()),
        ("task", record.task_handle.clone()),
        ("pid", record.pid.map(|p| p.to_string())),
        ("started", record.started_at.map(|t| t.to_rfc3339())),
        ("paused", record.paused_at.map(|t| t.to_rfc3339())),
        ("resumed", record.resumed_at.map(|t| t.to_rfc3339())),
        ("finished", record.finished_at.map(|t| t.to_rfc3339())),
        ("exit code", record.exit_code.map(|c| c.to_string())),
        ("error", record.error.clone()),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            println!("  {:<10} {}", label, value);
        }
    }
    if record.stopped {
        println!("  {:<10} {}", "stopped", "yes".dimmed());
    }
}

async fn cmd_list() -> Result<()> {
    let ids = AgentClient::new().list().await?;
    if ids.is_empty() {
        println!("{}", "No executions".dimmed());
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    let log_path = get_log_path();
    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        return Ok(());
    }

    if follow {
        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;
        child.wait()?;
    } else {
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let all_lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }
    Ok(())
}
