//! Connection pool manager.
//!
//! Lazily creates one pool per named database on a shared server, retries creation
//! with bounded backoff, replaces pools that lost their connection and runs an
//! optional periodic health check that evicts disconnected pools.
//!
//! # Concurrency Safety
//!
//! - All registry locks are released before pools are closed or created
//! - Single-flight creation per database name via the registry's shared creation
//!   futures; close and reconnect wait for an in-flight creation instead of
//!   orphaning it
//! - The health check task holds a `Weak` reference and exits once the manager is
//!   dropped

use crate::config::{PoolSettings, RetryPolicy};
use crate::db::pool::{PoolHandle, PoolStats};
use crate::db::registry::{PoolRegistry, PoolSlot};
use crate::error::{DbError, DbResult};
use crate::models::ServerTarget;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything needed to build a pool, shared with in-flight creation futures.
#[derive(Debug)]
struct PoolFactory {
    target: ServerTarget,
    settings: PoolSettings,
    retry: RetryPolicy,
}

impl PoolFactory {
    /// Create a pool, retrying failed or timed-out attempts with backoff.
    async fn create_with_retry(&self, database: &str) -> DbResult<PoolHandle> {
        let attempts = self.retry.attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(database, attempt, "Creating database pool");
            let outcome = tokio::time::timeout(
                self.settings.create_timeout,
                PoolHandle::connect(&self.target, database, &self.settings),
            )
            .await;

            let err = match outcome {
                Ok(Ok(handle)) => {
                    info!(
                        database,
                        attempt,
                        handle_id = %handle.id(),
                        "Database pool created"
                    );
                    return Ok(handle);
                }
                Ok(Err(e)) => e,
                Err(_) => DbError::timeout(
                    format!("creating pool for '{}'", database),
                    u32::try_from(self.settings.create_timeout.as_secs()).unwrap_or(u32::MAX),
                ),
            };

            warn!(
                database,
                attempt,
                max_attempts = attempts,
                error = %err,
                "Pool creation attempt failed"
            );
            last_error = Some(err);

            if attempt < attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        let source = last_error.unwrap_or_else(|| DbError::internal("no creation attempt made"));
        Err(DbError::pool_creation(database, attempts, source))
    }
}

pub struct PoolManager {
    factory: Arc<PoolFactory>,
    registry: PoolRegistry,
    /// Health check handle. Uses std::sync::Mutex for synchronous storage.
    health_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(target: ServerTarget, settings: PoolSettings, retry: RetryPolicy) -> Self {
        info!(
            server = %target.masked_url(),
            db_type = %target.db_type,
            max_connections = settings.max_connections,
            retry_attempts = retry.attempts,
            "Pool manager initialized"
        );
        Self {
            factory: Arc::new(PoolFactory {
                target,
                settings,
                retry,
            }),
            registry: PoolRegistry::new(),
            health_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ServerTarget {
        &self.factory.target
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.factory.settings
    }

    /// Get the pool for `database`, creating it on first use.
    ///
    /// A cached, connected pool is returned without I/O. A missing or disconnected
    /// pool is (re)created with bounded retry; concurrent callers for the same name
    /// wait on a single creation and share its outcome, failure included.
    ///
    /// A handle whose slot was closed or reconnected while it was being created is
    /// never returned: the caller that removed the slot closes it, and this call
    /// starts over against whatever is registered now.
    pub async fn get_pool(&self, database: &str) -> DbResult<Arc<PoolHandle>> {
        if database.is_empty() {
            return Err(DbError::invalid_input("Database name cannot be empty"));
        }

        loop {
            let slot = self
                .registry
                .slot(database, || self.creation(database))
                .await;

            let handle = match slot.wait().await {
                Ok(handle) => handle,
                Err(e) => {
                    self.registry.discard_failed(database, &slot).await;
                    return Err(e);
                }
            };
            if self.registry.is_registered(database, &slot).await {
                return Ok(handle);
            }
            debug!(
                database,
                handle_id = %handle.id(),
                "Pool was unregistered during creation, retrying"
            );
        }
    }

    fn creation(&self, database: &str) -> Arc<PoolSlot> {
        let factory = Arc::clone(&self.factory);
        let database = database.to_string();
        PoolSlot::new(async move { factory.create_with_retry(&database).await.map(Arc::new) })
    }

    /// Close and unregister the pool for `database`. Idempotent; never fails.
    ///
    /// A creation still in flight is awaited and its pool closed.
    pub async fn close_pool(&self, database: &str) {
        match self.registry.remove(database).await {
            Some(slot) => self.retire(slot).await,
            None => debug!(database, "No pool to close"),
        }
    }

    /// Close every pool concurrently and stop the health check.
    pub async fn close_all_pools(&self) {
        self.stop_health_check();
        let slots = self.registry.drain().await;
        if slots.is_empty() {
            return;
        }
        info!(count = slots.len(), "Closing all database pools");
        join_all(slots.into_iter().map(|slot| self.retire(slot))).await;
    }

    /// Settle a slot that has already left the registry and close whatever it produced.
    async fn retire(&self, slot: Arc<PoolSlot>) {
        if slot.is_pending() {
            debug!("Waiting for in-flight pool creation before closing");
        }
        if let Ok(handle) = slot.wait().await {
            self.close_handle(handle).await;
        }
    }

    /// Drain a pool that has already left the registry, bounded by the destroy timeout.
    async fn close_handle(&self, handle: Arc<PoolHandle>) {
        let timeout = self.factory.settings.destroy_timeout;
        match tokio::time::timeout(timeout, handle.close()).await {
            Ok(()) => info!(database = %handle.database(), "Closed database pool"),
            Err(_) => warn!(
                database = %handle.database(),
                timeout_ms = timeout.as_millis() as u64,
                "Timed out draining database pool"
            ),
        }
    }

    /// Force-reconnect a registered pool: close it, then create a fresh one.
    ///
    /// A pool still being created counts as registered; its creation is awaited and
    /// the result closed before the fresh pool is built.
    pub async fn reconnect(&self, database: &str) -> DbResult<Arc<PoolHandle>> {
        let Some(old) = self.registry.remove(database).await else {
            return Err(DbError::pool_not_found(database));
        };
        match old.handle() {
            Some(handle) => info!(database, handle_id = %handle.id(), "Reconnecting database pool"),
            None => info!(database, "Reconnecting database pool still being created"),
        }
        self.retire(old).await;
        self.get_pool(database).await
    }

    /// Statistics for every registered pool, keyed by database name.
    pub async fn pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.registry
            .handles()
            .await
            .into_iter()
            .map(|(name, handle)| (name, handle.stats()))
            .collect()
    }

    pub async fn pool_stats_for(&self, database: &str) -> DbResult<PoolStats> {
        self.registry
            .get(database)
            .await
            .map(|handle| handle.stats())
            .ok_or_else(|| DbError::pool_not_found(database))
    }

    pub async fn pool_count(&self) -> usize {
        self.registry.len().await
    }

    /// Number of pool creations currently in flight.
    pub async fn pending_creations(&self) -> usize {
        self.registry.pending().await
    }

    /// Start the periodic health check. Returns `false` if one is already running.
    pub fn start_health_check(self: &Arc<Self>, interval: Duration) -> bool {
        if interval.is_zero() {
            warn!("Health check interval must be greater than 0, not starting");
            return false;
        }

        let mut guard = self.health_guard();
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        // Weak reference avoids a cycle between the manager and its own task
        let weak_manager = Arc::downgrade(self);
        *guard = Some(tokio::spawn(Self::health_task(weak_manager, interval)));
        info!(
            interval_ms = interval.as_millis() as u64,
            "Pool health check started"
        );
        true
    }

    pub fn stop_health_check(&self) {
        if let Some(handle) = self.health_guard().take() {
            handle.abort();
            info!("Pool health check stopped");
        }
    }

    fn health_guard(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.health_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn health_task(weak_manager: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(manager) = weak_manager.upgrade() else {
                info!("Pool manager dropped, health check exiting");
                return;
            };
            manager.run_health_check().await;

            // Drop strong reference before sleeping to allow manager deallocation
            drop(manager);
        }
    }

    /// One health check pass: log a snapshot of every pool, then evict and close
    /// pools reporting disconnected. Returns the number of evicted pools.
    pub async fn run_health_check(&self) -> usize {
        for (database, handle) in self.registry.handles().await {
            let stats = handle.stats();
            debug!(
                database = %database,
                connected = stats.connected,
                total = stats.total_connections,
                active = stats.active_connections,
                idle = stats.idle_connections,
                pending = stats.pending_requests,
                "Pool health snapshot"
            );
        }

        let evicted = self.registry.evict_disconnected().await;
        for handle in &evicted {
            warn!(
                database = %handle.database(),
                handle_id = %handle.id(),
                last_error = ?handle.last_error(),
                "Evicting disconnected database pool"
            );
        }
        let count = evicted.len();
        join_all(evicted.into_iter().map(|handle| self.close_handle(handle))).await;
        count
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("db_type", &self.factory.target.db_type)
            .field("settings", &self.factory.settings)
            .field("retry", &self.factory.retry)
            .finish()
    }
}
