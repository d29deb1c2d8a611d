//! HTTP orchestrator client
//!
//! Posts status transitions and log lines to the console API. Each request
//! carries its own timeout; failures are returned to the caller, which logs
//! and moves on.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::domain::ExecutionStatus;

use super::{LogSeverity, OrchestratorClient, OrchestratorError};

/// Console API client
pub struct HttpOrchestratorClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl HttpOrchestratorClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, OrchestratorError> {
        debug!(%base_url, ?timeout, has_token = token.is_some(), "HttpOrchestratorClient::new: called");
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    /// `None` when no base URL is configured
    pub fn from_config(config: &OrchestratorConfig) -> Result<Option<Self>, OrchestratorError> {
        let Some(base_url) = config.base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        Self::new(base_url, config.token(), Duration::from_millis(config.timeout_ms)).map(Some)
    }

    fn execution_url(&self, execution_id: &str, leaf: &str) -> String {
        format!("{}/executions/{}/{}", self.base_url, execution_id, leaf)
    }

    async fn post(&self, url: String, body: serde_json::Value) -> Result<(), OrchestratorError> {
        let mut request = self.http.post(&url).header("content-type", "application/json").json(&body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::ApiError { status, message });
        }
        debug!(%url, "HttpOrchestratorClient::post: accepted");
        Ok(())
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        actually_started: bool,
    ) -> Result<(), OrchestratorError> {
        debug!(%execution_id, %status, actually_started, "HttpOrchestratorClient::set_status: called");
        let body = json!({
            "status": status.as_str(),
            "actually_started": actually_started,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.post(self.execution_url(execution_id, "status"), body).await
    }

    async fn send_log(&self, execution_id: &str, message: &str, severity: LogSeverity) -> Result<(), OrchestratorError> {
        let body = json!({
            "message": message,
            "severity": severity,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.post(self.execution_url(execution_id, "logs"), body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_from_config_disabled_without_url() {
        let config = OrchestratorConfig::default();
        assert!(HttpOrchestratorClient::from_config(&config).unwrap().is_none());

        let config = OrchestratorConfig {
            base_url: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(HttpOrchestratorClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_execution_url_trims_slash() {
        let client = HttpOrchestratorClient::new("http://console/api/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.execution_url("e1", "status"),
            "http://console/api/executions/e1/status"
        );
    }

    /// One-shot HTTP server answering with `status_line`; returns the raw request
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = String::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if n == 0 || request.contains("}") {
                    break;
                }
            }
            let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
            stream.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (format!("http://{}/api", addr), handle)
    }

    #[tokio::test]
    async fn test_set_status_posts_json_with_token() {
        let (base, server) = serve_once("HTTP/1.1 200 OK").await;
        let client = HttpOrchestratorClient::new(&base, Some("s3cret".to_string()), Duration::from_secs(2)).unwrap();

        client.set_status("e1", ExecutionStatus::Running, true).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/executions/e1/status"));
        assert!(request.to_lowercase().contains("authorization: bearer s3cret"));
        assert!(request.contains(r#""actually_started":true"#));
        assert!(request.contains(r#""status":"running""#));
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let (base, server) = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let client = HttpOrchestratorClient::new(&base, None, Duration::from_secs(2)).unwrap();

        let result = client.send_log("e1", "hello", LogSeverity::Error).await;
        assert!(matches!(result, Err(OrchestratorError::ApiError { status: 503, .. })));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/executions/e1/logs"));
        assert!(request.contains(r#""severity":"error""#));
    }

    #[tokio::test]
    async fn test_unreachable_is_network_error() {
        let client = HttpOrchestratorClient::new("http://127.0.0.1:1", None, Duration::from_millis(500)).unwrap();
        let result = client.set_status("e1", ExecutionStatus::Failed, false).await;
        assert!(matches!(result, Err(OrchestratorError::Network(_))));
    }
}
