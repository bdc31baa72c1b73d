//! Per-database pool handles.
//!
//! A [`PoolHandle`] wraps one backend-specific sqlx pool bound to exactly one named
//! database, together with the counters and connection state that the pool
//! statistics are read from. Handles are created by [`PoolHandle::connect`] and owned
//! by the registry; callers only ever hold `Arc` clones.

use crate::config::PoolSettings;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ServerTarget};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::pool::PoolOptions;
use sqlx::{
    MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions, postgres::PgConnectOptions,
    sqlite::SqliteConnectOptions,
};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        crate::with_pool!(self, |pool| pool.close().await)
    }

    pub fn is_closed(&self) -> bool {
        crate::with_pool!(self, |pool| pool.is_closed())
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Counters shared with the driver's connect hook.
#[derive(Debug, Default)]
struct PoolCounters {
    connections_opened: AtomicU64,
    pending: AtomicUsize,
}

impl PoolCounters {
    fn record_connect(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics for one pool. Reading them performs no I/O.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub connected: bool,
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub pending_requests: usize,
    pub handle_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub connections_opened: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One live pool bound to one database name.
pub struct PoolHandle {
    id: Uuid,
    database: String,
    pub pool: DbPool,
    created_at: DateTime<Utc>,
    counters: Arc<PoolCounters>,
    /// Uses std::sync::Mutex; never held across an await point.
    last_error: std::sync::Mutex<Option<String>>,
    disconnected: AtomicBool,
}

impl PoolHandle {
    /// Open a pool for `database` on the server described by `target`.
    ///
    /// PostgreSQL and MySQL pools connect to the per-database URL derived from the
    /// server-level URL. SQLite pools open `<dir>/<database>.db`, creating the file
    /// when missing (but never the directory).
    pub async fn connect(
        target: &ServerTarget,
        database: &str,
        settings: &PoolSettings,
    ) -> DbResult<Self> {
        let counters = Arc::new(PoolCounters::default());

        let pool = match target.db_type {
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(&database_url(target, database)?)?;
                let pool = pool_options(settings, &counters)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(database, e))?;
                DbPool::Postgres(pool)
            }
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&database_url(target, database)?)?
                    .charset("utf8mb4");
                let pool = pool_options(settings, &counters)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(database, e))?;
                DbPool::MySql(pool)
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::new()
                    .filename(target.sqlite_file(database))
                    .create_if_missing(true);
                let pool = pool_options(settings, &counters)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(database, e))?;
                DbPool::SQLite(pool)
            }
        };

        let handle = Self {
            id: Uuid::new_v4(),
            database: database.to_string(),
            pool,
            created_at: Utc::now(),
            counters,
            last_error: std::sync::Mutex::new(None),
            disconnected: AtomicBool::new(false),
        };
        debug!(database, handle_id = %handle.id, "Pool connected");
        Ok(handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the handle can still serve requests.
    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire) && !self.pool.is_closed()
    }

    /// Flag the handle as disconnected so the next acquisition rebuilds it.
    pub fn mark_disconnected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            warn!(
                database = %self.database,
                handle_id = %self.id,
                reason = %reason,
                "Pool marked disconnected"
            );
        }
        self.set_last_error(reason);
    }

    /// Record a driver error observed while using this pool.
    ///
    /// Connection-class failures also mark the handle disconnected.
    pub fn report_error(&self, err: &sqlx::Error) {
        if is_connection_failure(err) {
            self.mark_disconnected(err.to_string());
        } else {
            self.set_last_error(err.to_string());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_last_error(&self, message: String) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
    }

    /// Count a request against this pool until the returned guard is dropped.
    pub fn begin_request(&self) -> PendingRequest {
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        PendingRequest {
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (total, idle) = crate::with_pool!(&self.pool, |pool| (pool.size(), pool.num_idle()));
        let idle = u32::try_from(idle).unwrap_or(u32::MAX).min(total);
        PoolStats {
            connected: self.is_connected(),
            total_connections: total,
            active_connections: total - idle,
            idle_connections: idle,
            pending_requests: self.counters.pending.load(Ordering::Acquire),
            handle_id: self.id,
            created_at: self.created_at,
            connections_opened: self.counters.connections_opened.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }

    /// Drain and close the underlying pool.
    pub async fn close(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.pool.close().await;
        debug!(database = %self.database, handle_id = %self.id, "Pool closed");
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("db_type", &self.pool.db_type())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// RAII marker for one in-flight request on a pool.
#[derive(Debug)]
pub struct PendingRequest {
    counters: Arc<PoolCounters>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        // Saturate at 0; an extra decrement would otherwise wrap.
        let _ = self
            .counters
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }
}

fn pool_options<DB: sqlx::Database>(
    settings: &PoolSettings,
    counters: &Arc<PoolCounters>,
) -> PoolOptions<DB> {
    let counters = Arc::clone(counters);
    PoolOptions::<DB>::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(Some(settings.idle_timeout))
        .test_before_acquire(settings.test_before_acquire)
        .after_connect(move |_conn, _meta| {
            counters.record_connect();
            Box::pin(async { Ok(()) })
        })
}

fn database_url(target: &ServerTarget, database: &str) -> DbResult<String> {
    target.database_url(database).map_err(|e| {
        DbError::connection(e.to_string(), "Check the server URL format")
    })
}

fn connect_error(database: &str, err: sqlx::Error) -> DbError {
    DbError::connection(
        format!("Failed to connect to database '{}': {}", database, err),
        "Check that the database exists and the credentials are correct",
    )
}

/// Errors after which the pool can no longer be trusted to reach the server.
fn is_connection_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn sqlite_target(dir: &std::path::Path) -> ServerTarget {
        ServerTarget::new(format!("sqlite://{}", dir.display())).unwrap()
    }

    #[tokio::test]
    async fn test_connect_creates_sqlite_file_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let target = sqlite_target(dir.path());
        let settings = PoolSettings::for_environment(Environment::Development);

        let handle = PoolHandle::connect(&target, "inventory", &settings)
            .await
            .unwrap();
        assert!(handle.is_connected());
        assert_eq!(handle.database(), "inventory");
        assert!(dir.path().join("inventory.db").exists());
        handle.close().await;
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_stats_count_connections_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let target = sqlite_target(dir.path());
        let mut settings = PoolSettings::for_environment(Environment::Development);
        settings.min_connections = 1;

        let handle = PoolHandle::connect(&target, "stats", &settings).await.unwrap();
        let guard = handle.begin_request();
        let stats = handle.stats();
        assert!(stats.connected);
        assert_eq!(stats.pending_requests, 1);
        assert!(stats.connections_opened >= 1);
        assert_eq!(stats.handle_id, handle.id());
        drop(guard);
        assert_eq!(handle.stats().pending_requests, 0);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_report_error_marks_connection_failures() {
        let dir = tempfile::tempdir().unwrap();
        let target = sqlite_target(dir.path());
        let settings = PoolSettings::for_environment(Environment::Development);
        let handle = PoolHandle::connect(&target, "errors", &settings).await.unwrap();

        handle.report_error(&sqlx::Error::RowNotFound);
        assert!(handle.is_connected());
        assert!(handle.last_error().is_some());

        handle.report_error(&sqlx::Error::PoolClosed);
        assert!(!handle.is_connected());
        assert!(!handle.stats().connected);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_connect_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = sqlite_target(&dir.path().join("missing"));
        let settings = PoolSettings::for_environment(Environment::Development);

        let err = PoolHandle::connect(&target, "nowhere", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("nowhere"));
    }
}
