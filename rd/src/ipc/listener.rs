//! Agent side of the IPC socket
//!
//! Binds the socket, reads one request per connection and answers it from the
//! `AgentContext`. Connections are served on their own tasks so a slow stop
//! never holds up a status query.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{AgentRequest, AgentResponse};
use super::{MAX_MESSAGE_SIZE, get_socket_path};
use crate::agent::AgentContext;
use crate::daemon::VERSION;

/// Cadence for dropping finished job bookkeeping
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Bind the agent socket at its default path
pub fn create_listener() -> Result<(UnixListener, PathBuf)> {
    create_listener_at(&get_socket_path())
}

/// Bind at `socket_path`, replacing a stale socket file
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener: creating IPC socket");
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    if socket_path.exists() {
        debug!(?socket_path, "create_listener: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Read one newline-terminated request, at most `MAX_MESSAGE_SIZE` bytes
pub async fn read_message(stream: &mut UnixStream) -> Result<AgentRequest> {
    let mut reader = BufReader::new(stream.take(MAX_MESSAGE_SIZE as u64 + 1));
    let mut line = String::new();
    let bytes_read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read IPC message")?;

    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Message too large: more than {} bytes", MAX_MESSAGE_SIZE));
    }
    if line.trim().is_empty() {
        return Err(eyre::eyre!("Empty message received"));
    }

    let msg: AgentRequest = serde_json::from_str(line.trim()).context("Failed to parse IPC message")?;
    Ok(msg)
}

pub async fn send_response(stream: &mut UnixStream, response: &AgentResponse) -> Result<()> {
    let response_json = serde_json::to_string(response).context("Failed to serialize response")?;
    stream
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write response")?;
    stream.write_all(b"\n").await.context("Failed to write newline")?;
    stream.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

/// Accept loop; returns on `shutdown` or on a `Shutdown` request
pub async fn serve(listener: UnixListener, ctx: Arc<AgentContext>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
    info!("IPC server accepting requests");
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let mut reap = tokio::time::interval(REAP_INTERVAL);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        let stop_tx = stop_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &ctx, &stop_tx).await {
                                warn!(error = %e, "IPC connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "IPC accept error"),
                }
            }
            _ = reap.tick() => {
                ctx.reap().await;
            }
            _ = stop_rx.recv() => {
                info!("Shutdown requested over IPC");
                break;
            }
            _ = shutdown.recv() => {
                debug!("serve: shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, ctx: &AgentContext, stop_tx: &mpsc::Sender<()>) -> Result<()> {
    let response = match read_message(&mut stream).await {
        Ok(msg) => {
            debug!(?msg, "handle_connection: received request");
            let shutdown = matches!(msg, AgentRequest::Shutdown);
            let response = dispatch(ctx, msg).await;
            if shutdown {
                // Full is fine: a shutdown is already queued
                let _ = stop_tx.try_send(());
            }
            response
        }
        Err(e) => AgentResponse::Error { message: e.to_string() },
    };
    send_response(&mut stream, &response).await
}

/// Answer one request from the agent
pub async fn dispatch(ctx: &AgentContext, msg: AgentRequest) -> AgentResponse {
    match msg {
        AgentRequest::SubmitRun { spec } => match ctx.submit_run(spec).await {
            Ok(submitted) => AgentResponse::Submitted {
                execution_id: submitted.execution_id,
                task_handle: submitted.task_handle.to_string(),
            },
            Err(e) => error_response(e),
        },
        AgentRequest::Stop { id } => match ctx.request_stop(&id).await {
            Ok(report) => AgentResponse::Stopped {
                execution_id: report.execution_id,
                exit_code: report.exit_code,
                forced: report.outcome.forced,
                noop: report.noop,
            },
            Err(e) => error_response(e),
        },
        AgentRequest::Pause { id } => match ctx.request_pause(&id).await {
            Ok(accepted) => AgentResponse::Accepted { accepted },
            Err(e) => error_response(e),
        },
        AgentRequest::Resume { id } => match ctx.request_resume(&id).await {
            Ok(accepted) => AgentResponse::Accepted { accepted },
            Err(e) => error_response(e),
        },
        AgentRequest::Status => AgentResponse::Status {
            machine_id: ctx.machine_id().to_string(),
            status: ctx
                .query_status()
                .await
                .map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            current_execution: ctx.current_execution().await,
            backend: ctx.backend_name().to_string(),
        },
        AgentRequest::Show { id } => AgentResponse::Execution {
            record: ctx.query_execution(&id).await,
        },
        AgentRequest::List => AgentResponse::Executions {
            ids: ctx.list_executions().await,
        },
        AgentRequest::Ping => AgentResponse::Pong {
            version: VERSION.to_string(),
        },
        AgentRequest::Shutdown => AgentResponse::Ok,
    }
}

fn error_response(e: impl std::fmt::Display) -> AgentResponse {
    AgentResponse::Error { message: e.to_string() }
}
