//! LogForwarder - ordered, non-blocking log shipping for one execution
//!
//! The run loop hands lines over with `try_send` and never waits on the
//! network. A single background task posts them in order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LogSeverity, OrchestratorClient};

/// Lines buffered before new ones are dropped
pub const DEFAULT_LOG_BUFFER: usize = 512;

/// Background log shipper
pub struct LogForwarder {
    tx: Option<mpsc::Sender<(String, LogSeverity)>>,
    task: Option<JoinHandle<usize>>,
    dropped: usize,
}

impl LogForwarder {
    /// Spawn the shipping task for `execution_id`
    pub fn spawn(client: Arc<dyn OrchestratorClient>, execution_id: &str, capacity: usize) -> Self {
        debug!(%execution_id, capacity, "LogForwarder::spawn: called");
        if !client.is_enabled() {
            return Self {
                tx: None,
                task: None,
                dropped: 0,
            };
        }

        let (tx, mut rx) = mpsc::channel::<(String, LogSeverity)>(capacity.max(1));
        let execution_id = execution_id.to_string();
        let task = tokio::spawn(async move {
            let mut sent = 0;
            let mut failures = 0usize;
            while let Some((message, severity)) = rx.recv().await {
                match client.send_log(&execution_id, &message, severity).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        failures += 1;
                        // One warning is enough; the rest are the same outage
                        if failures == 1 {
                            warn!(%execution_id, error = %e, "Failed to forward robot log");
                        }
                    }
                }
            }
            debug!(%execution_id, sent, failures, "LogForwarder: drained");
            sent
        });

        Self {
            tx: Some(tx),
            task: Some(task),
            dropped: 0,
        }
    }

    /// Queue a line without waiting; dropped with a warning when full
    pub fn forward(&mut self, message: impl Into<String>, severity: LogSeverity) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send((message.into(), severity)).is_err() {
            self.dropped += 1;
            if self.dropped == 1 || self.dropped.is_power_of_two() {
                warn!(dropped = self.dropped, "Log forwarding buffer full, dropping lines");
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Stop accepting lines and give queued ones up to `grace` to drain
    ///
    /// Returns how many lines were delivered.
    pub async fn close(mut self, grace: Duration) -> usize {
        self.tx.take();
        let Some(mut task) = self.task.take() else {
            return 0;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                warn!(error = %e, "Log forwarding task failed");
                0
            }
            Err(_) => {
                warn!(?grace, "Log forwarding did not drain in time");
                task.abort();
                0
            }
        }
    }
}
