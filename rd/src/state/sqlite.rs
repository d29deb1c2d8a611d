//! Embedded single-file backend (SQLite)
//!
//! Used when no networked store is reachable. WAL mode and a busy timeout let
//! the web-serving and worker processes share one database file. Every call
//! runs on the blocking pool so a held write lock never stalls a runtime
//! worker.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{BackendError, FieldMap, StateBackend};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS hashes (
    key   TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
";

/// SQLite-backed state store
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteBackend {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "SqliteBackend::open: called");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(%mode, "SqliteBackend::open: journal mode set");
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened embedded state store");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Private in-memory store (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| BackendError::Poisoned)?;
            let conn = guard.as_mut().ok_or(BackendError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn hash_set(&self, key: &str, fields: &FieldMap) -> Result<usize, BackendError> {
        debug!(%key, field_count = fields.len(), "SqliteBackend::hash_set: called");
        let key = key.to_string();
        let fields = fields.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut added = 0;
            for (field, value) in &fields {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM hashes WHERE key = ?1 AND field = ?2)",
                    params![key, field],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, field, value],
                )?;
                if !exists {
                    added += 1;
                }
            }
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<FieldMap, BackendError> {
        debug!(%key, "SqliteBackend::hash_get_all: called");
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT field, value FROM hashes WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let mut map = FieldMap::new();
            for row in rows {
                let (field, value) = row?;
                map.insert(field, value);
            }
            Ok(map)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        debug!(%key, "SqliteBackend::set: called");
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        debug!(%key, "SqliteBackend::get: called");
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, BackendError> {
        debug!(key_count = keys.len(), "SqliteBackend::delete: called");
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut removed = 0;
            for key in &keys {
                let kv_rows = tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                let hash_rows = tx.execute("DELETE FROM hashes WHERE key = ?1", params![key])?;
                if kv_rows + hash_rows > 0 {
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        debug!(%pattern, "SqliteBackend::keys: called");
        let pattern = pattern.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key FROM kv WHERE key GLOB ?1
                 UNION
                 SELECT key FROM hashes WHERE key GLOB ?1
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }

    async fn ping(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
        .is_ok()
    }

    async fn close(&self) {
        debug!(path = %self.path.display(), "SqliteBackend::close: called");
        // Dropping the connection checkpoints the WAL; keep that off the runtime too
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = conn.lock() {
                guard.take();
            }
        })
        .await;
        if let Err(e) = closed {
            debug!(error = %e, "SqliteBackend::close: close task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_hash_merge_counts_new_fields() {
        let backend = SqliteBackend::open_in_memory().unwrap();

        let added = backend.hash_set("h", &fields(&[("a", "1"), ("b", "2")])).await.unwrap();
        assert_eq!(added, 2);

        let added = backend.hash_set("h", &fields(&[("b", "3"), ("c", "4")])).await.unwrap();
        assert_eq!(added, 1);

        let all = backend.hash_get_all("h").await.unwrap();
        assert_eq!(all, fields(&[("a", "1"), ("b", "3"), ("c", "4")]));
    }

    #[tokio::test]
    async fn test_hash_get_all_missing_is_empty() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(backend.hash_get_all("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.set("k", "one").await.unwrap();
        backend.set("k", "two").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys_of_both_kinds() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.set("plain", "v").await.unwrap();
        backend.hash_set("hash", &fields(&[("f", "v")])).await.unwrap();

        let removed = backend
            .delete(&["plain".to_string(), "hash".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(backend.keys("*").await.unwrap().is_empty());
        assert_eq!(backend.delete(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.hash_set("execution:a", &fields(&[("status", "running")])).await.unwrap();
        backend
            .hash_set("execution:a:pause_control", &fields(&[("pause_requested", "true")]))
            .await
            .unwrap();
        backend.hash_set("execution:b", &fields(&[("status", "failed")])).await.unwrap();
        backend.set("server:m1:status", "free").await.unwrap();

        let keys = backend.keys("execution:*").await.unwrap();
        assert_eq!(keys, vec!["execution:a", "execution:a:pause_control", "execution:b"]);

        let keys = backend.keys("server:*:status").await.unwrap();
        assert_eq!(keys, vec!["server:m1:status"]);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.hash_set("execution:x", &fields(&[("status", "running")])).await.unwrap();
            backend.close().await;
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let all = backend.hash_get_all("execution:x").await.unwrap();
        assert_eq!(all.get("status").map(String::as_str), Some("running"));
    }

    #[tokio::test]
    async fn test_closed_backend_errors_and_fails_ping() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(backend.ping().await);

        backend.close().await;
        assert!(!backend.ping().await);
        assert!(matches!(backend.get("k").await, Err(BackendError::Closed)));
    }

    #[tokio::test]
    async fn test_locked_writer_does_not_block_runtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.db");
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());

        // Another process holding the write lock
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let writer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.set("k", "v").await })
        };
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!writer.is_finished());

        holder.execute_batch("COMMIT").unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
