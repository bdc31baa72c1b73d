//! Registry of per-database pool slots.
//!
//! # Concurrency
//!
//! - **One shared creation per database name**: a slot wraps a `Shared` creation
//!   future, so concurrent cold-start requests for the same database all await the
//!   same attempt and receive the same outcome, success or failure.
//! - **Single point of mutation**: slots are only inserted, replaced or removed under
//!   the write lock, and replacement re-checks the slot it is about to replace.
//! - **No awaits under the lock**: slots that leave the registry are returned to the
//!   caller (or spawned) for settling and closing after the lock is released.
//! - **Removal never orphans a creation**: a removed slot is handed back whole, so
//!   whoever removed it can wait for an in-flight creation and close its result.

use crate::db::pool::PoolHandle;
use crate::error::DbResult;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

type Creation = Shared<BoxFuture<'static, DbResult<Arc<PoolHandle>>>>;

/// The pool for one database: either still being created, or the outcome of that creation.
pub struct PoolSlot {
    creation: Creation,
}

impl PoolSlot {
    pub fn new<F>(creation: F) -> Arc<Self>
    where
        F: Future<Output = DbResult<Arc<PoolHandle>>> + Send + 'static,
    {
        Arc::new(Self {
            creation: creation.boxed().shared(),
        })
    }

    /// Wait for the creation to settle. Every waiter gets a clone of the same outcome.
    pub async fn wait(&self) -> DbResult<Arc<PoolHandle>> {
        self.creation.clone().await
    }

    /// The created handle, once creation has succeeded.
    pub fn handle(&self) -> Option<Arc<PoolHandle>> {
        match self.creation.peek() {
            Some(Ok(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.creation.peek().is_none()
    }

    /// Pending slots count as usable; a failed one or a disconnected handle does not.
    fn is_usable(&self) -> bool {
        match self.creation.peek() {
            None => true,
            Some(Ok(handle)) => handle.is_connected(),
            Some(Err(_)) => false,
        }
    }
}

impl std::fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.creation.peek() {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("PoolSlot").field("state", &state).finish()
    }
}

/// Owns every live pool slot, keyed strictly by database name.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    slots: RwLock<HashMap<String, Arc<PoolSlot>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot to wait on for `database`, registering one built by `create` if needed.
    ///
    /// A slot holding a disconnected handle or a failed creation is replaced; a stale
    /// pool is closed in the background.
    pub async fn slot(
        &self,
        database: &str,
        create: impl FnOnce() -> Arc<PoolSlot>,
    ) -> Arc<PoolSlot> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(database) {
                if slot.is_usable() {
                    return Arc::clone(slot);
                }
            }
        }

        let (slot, stale) = {
            let mut slots = self.slots.write().await;
            // Double-check after acquiring write lock
            match slots.get(database) {
                Some(slot) if slot.is_usable() => (Arc::clone(slot), None),
                _ => {
                    let fresh = create();
                    let replaced = slots.insert(database.to_string(), Arc::clone(&fresh));
                    (fresh, replaced.and_then(|old| old.handle()))
                }
            }
        }; // Write lock released here

        if let Some(stale) = stale {
            info!(
                database,
                handle_id = %stale.id(),
                "Replacing disconnected database pool"
            );
            tokio::spawn(async move { stale.close().await });
        }
        slot
    }

    /// Whether `slot` is still the one registered for `database`.
    pub async fn is_registered(&self, database: &str, slot: &Arc<PoolSlot>) -> bool {
        let slots = self.slots.read().await;
        slots
            .get(database)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `slot` if it is still registered for `database` and its creation failed.
    pub async fn discard_failed(&self, database: &str, slot: &Arc<PoolSlot>) {
        let mut slots = self.slots.write().await;
        if let Some(current) = slots.get(database) {
            if Arc::ptr_eq(current, slot) && matches!(current.creation.peek(), Some(Err(_))) {
                slots.remove(database);
                debug!(database, "Discarded failed pool slot");
            }
        }
    }

    /// The created handle for `database`, if any.
    pub async fn get(&self, database: &str) -> Option<Arc<PoolHandle>> {
        let slots = self.slots.read().await;
        slots.get(database).and_then(|slot| slot.handle())
    }

    /// Every created handle. Slots still being created are skipped.
    pub async fn handles(&self) -> Vec<(String, Arc<PoolHandle>)> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .filter_map(|(name, slot)| slot.handle().map(|h| (name.clone(), h)))
            .collect()
    }

    /// Number of created handles.
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.handle().is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of creations still in flight.
    pub async fn pending(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.is_pending()).count()
    }

    /// Remove the slot for `database`, whatever state it is in.
    pub async fn remove(&self, database: &str) -> Option<Arc<PoolSlot>> {
        let mut slots = self.slots.write().await;
        slots.remove(database)
    }

    /// Remove every slot whose handle reports disconnected, returning those handles.
    /// Failed slots are dropped as well; in-flight ones are kept.
    pub async fn evict_disconnected(&self) -> Vec<Arc<PoolHandle>> {
        let mut slots = self.slots.write().await;
        let stale: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| !slot.is_usable())
            .map(|(name, _)| name.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|name| slots.remove(&name))
            .filter_map(|slot| slot.handle())
            .collect()
    }

    /// Remove every slot, in-flight ones included.
    pub async fn drain(&self) -> Vec<Arc<PoolSlot>> {
        let mut slots = self.slots.write().await;
        slots.drain().map(|(_, slot)| slot).collect()
    }
}
