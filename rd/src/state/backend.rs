//! StateBackend - minimal key/value + hash persistence contract
//!
//! Everything above this layer is backend-blind: the embedded SQLite store
//! and the networked redis store implement exactly the same operations.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Flat string hash, the unit of persisted records
pub type FieldMap = HashMap<String, String>;

/// Errors from state backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend is closed")]
    Closed,

    #[error("Backend lock poisoned")]
    Poisoned,

    #[error("Backend task failed: {0}")]
    Task(String),
}

/// Minimal persistence interface shared by all backends
///
/// Single-key and single-hash operations are atomic; hash merge is the only
/// mutation primitive the coordinator relies on for records.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short backend name for logs ("sqlite", "redis")
    fn name(&self) -> &'static str;

    /// Merge fields into a hash; returns the number of newly created fields
    async fn hash_set(&self, key: &str, fields: &FieldMap) -> Result<usize, BackendError>;

    /// All fields of a hash (empty when absent)
    async fn hash_get_all(&self, key: &str) -> Result<FieldMap, BackendError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Delete keys of any type; returns how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize, BackendError>;

    /// Keys matching a glob pattern (`*`, `?`, `[...]`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    async fn ping(&self) -> bool;

    async fn close(&self);
}
