//! Backend selection
//!
//! The choice is made once at startup and the resulting backend is shared for
//! the lifetime of the process.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BackendKind, StateConfig};

use super::backend::{BackendError, StateBackend};
use super::redis::RedisBackend;
use super::sqlite::SqliteBackend;

/// Connect the configured state backend
///
/// `auto` prefers redis when it answers within the connect timeout and
/// otherwise falls back to the embedded store.
pub async fn connect_backend(config: &StateConfig) -> Result<Arc<dyn StateBackend>, BackendError> {
    debug!(backend = ?config.backend, "connect_backend: called");
    match config.backend {
        BackendKind::Redis => {
            let backend = RedisBackend::connect(&config.redis_url, config.connect_timeout()).await?;
            info!("Using redis state backend");
            Ok(Arc::new(backend))
        }
        BackendKind::Sqlite => open_sqlite(config),
        BackendKind::Auto => match RedisBackend::connect(&config.redis_url, config.connect_timeout()).await {
            Ok(backend) => {
                info!("Using redis state backend");
                Ok(Arc::new(backend))
            }
            Err(e) => {
                info!(error = %e, "Redis unavailable, falling back to embedded store");
                open_sqlite(config)
            }
        },
    }
}

fn open_sqlite(config: &StateConfig) -> Result<Arc<dyn StateBackend>, BackendError> {
    let backend = SqliteBackend::open(&config.sqlite_path)?;
    info!(path = %config.sqlite_path.display(), "Using embedded state backend");
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(temp: &TempDir, backend: BackendKind) -> StateConfig {
        StateConfig {
            backend,
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            connect_timeout_ms: 200,
            sqlite_path: temp.path().join("state.db"),
        }
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_sqlite() {
        let temp = TempDir::new().unwrap();
        let backend = connect_backend(&config_in(&temp, BackendKind::Auto)).await.unwrap();
        assert_eq!(backend.name(), "sqlite");
        assert!(backend.ping().await);
    }

    #[tokio::test]
    async fn test_explicit_sqlite() {
        let temp = TempDir::new().unwrap();
        let backend = connect_backend(&config_in(&temp, BackendKind::Sqlite)).await.unwrap();
        assert_eq!(backend.name(), "sqlite");
        assert!(temp.path().join("state.db").exists());
    }

    #[tokio::test]
    async fn test_explicit_redis_failure_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(connect_backend(&config_in(&temp, BackendKind::Redis)).await.is_err());
    }
}
