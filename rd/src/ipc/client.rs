//! IPC client used by the CLI to talk to a running agent

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::messages::{AgentRequest, AgentResponse};
use super::{MAX_MESSAGE_SIZE, get_socket_path};
use crate::domain::{ExecutionRecord, ExecutionSpec};

/// Connect and short-request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stops wait on the graceful timeout plus the orphan sweep
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for a running agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClient {
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Submit a run; returns `(execution_id, task_handle)`
    pub async fn submit(&self, spec: ExecutionSpec) -> Result<(String, String)> {
        match self.request(AgentRequest::SubmitRun { spec }, self.timeout).await? {
            AgentResponse::Submitted {
                execution_id,
                task_handle,
            } => Ok((execution_id, task_handle)),
            other => Err(unexpected(other)),
        }
    }

    /// Stop an execution; waits for the stop to finish
    pub async fn stop(&self, execution_id: &str) -> Result<AgentResponse> {
        let request = AgentRequest::Stop {
            id: execution_id.to_string(),
        };
        match self.request(request, STOP_TIMEOUT.max(self.timeout)).await? {
            stopped @ AgentResponse::Stopped { .. } => Ok(stopped),
            other => Err(unexpected(other)),
        }
    }

    pub async fn pause(&self, execution_id: &str) -> Result<bool> {
        let request = AgentRequest::Pause {
            id: execution_id.to_string(),
        };
        self.accepted(request).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<bool> {
        let request = AgentRequest::Resume {
            id: execution_id.to_string(),
        };
        self.accepted(request).await
    }

    /// Agent status response
    pub async fn status(&self) -> Result<AgentResponse> {
        match self.request(AgentRequest::Status, self.timeout).await? {
            status @ AgentResponse::Status { .. } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn show(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let request = AgentRequest::Show {
            id: execution_id.to_string(),
        };
        match self.request(request, self.timeout).await? {
            AgentResponse::Execution { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        match self.request(AgentRequest::List, self.timeout).await? {
            AgentResponse::Executions { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    /// Check the agent is alive; returns its version
    pub async fn ping(&self) -> Result<String> {
        match self.request(AgentRequest::Ping, self.timeout).await? {
            AgentResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.request(AgentRequest::Shutdown, self.timeout).await? {
            AgentResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn accepted(&self, request: AgentRequest) -> Result<bool> {
        match self.request(request, self.timeout).await? {
            AgentResponse::Accepted { accepted } => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    /// Send one request and wait for its response; agent errors become `Err`
    async fn request(&self, msg: AgentRequest, read_timeout: Duration) -> Result<AgentResponse> {
        debug!(?self.socket_path, ?msg, "AgentClient: sending request");
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to agent socket")?;

        match self.send_on_stream(stream, msg, read_timeout).await? {
            AgentResponse::Error { message } => Err(eyre::eyre!("Agent error: {}", message)),
            response => Ok(response),
        }
    }

    async fn send_on_stream(
        &self,
        mut stream: UnixStream,
        msg: AgentRequest,
        read_timeout: Duration,
    ) -> Result<AgentResponse> {
        let msg_json = serde_json::to_string(&msg).context("Failed to serialize request")?;
        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Request too large: {} bytes", msg_json.len()));
        }

        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write request")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        let mut reader = BufReader::new(&mut stream);
        let mut response_line = String::new();
        tokio::time::timeout(read_timeout, async {
            let bytes_read = reader
                .read_line(&mut response_line)
                .await
                .context("Failed to read response")?;
            if bytes_read > MAX_MESSAGE_SIZE {
                return Err(eyre::eyre!("Response too large: {} bytes", bytes_read));
            }
            if bytes_read == 0 {
                return Err(eyre::eyre!("Agent closed the connection"));
            }
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Read timeout")??;

        let response: AgentResponse =
            serde_json::from_str(response_line.trim()).context("Failed to parse agent response")?;
        debug!(?response, "AgentClient: received response");
        Ok(response)
    }
}

fn unexpected(response: AgentResponse) -> eyre::Error {
    eyre::eyre!("Unexpected response: {:?}", response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_default_path() {
        let client = AgentClient::default();
        assert!(client.socket_path.ends_with("robotd/robotd.sock"));
    }

    #[test]
    fn test_client_with_timeout() {
        let client = AgentClient::new().with_timeout(Duration::from_secs(10));
        assert_eq!(client.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let temp = TempDir::new().unwrap();
        let client = AgentClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(!client.socket_exists());
        assert!(client.ping().await.is_err());
    }
}
