//! In-memory permission store.
//!
//! Not durable: all grants are lost on restart. Mutations are serialized under one
//! mutex, which is never held across an await point.

use super::PermissionStore;
use crate::error::DbResult;
use crate::permissions::types::{PermissionRecord, PermissionSet};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// (user, database, table); `None` table is the database-wide grant.
type GrantKey = (i64, String, Option<String>);

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<GrantKey, PermissionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    state: Mutex<MemoryState>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, key: GrantKey) -> Option<PermissionRecord> {
        self.state().records.get(&key).cloned()
    }

    fn upsert(&self, key: GrantKey, permissions: PermissionSet) -> PermissionRecord {
        let mut state = self.state();
        let now = Utc::now();
        if let Some(existing) = state.records.get_mut(&key) {
            existing.permissions = permissions;
            existing.updated_at = now;
            return existing.clone();
        }

        state.next_id += 1;
        let record = PermissionRecord {
            id: state.next_id,
            user_id: key.0,
            database: key.1.clone(),
            table: key.2.clone(),
            permissions,
            created_at: now,
            updated_at: now,
        };
        state.records.insert(key, record.clone());
        record
    }

    fn delete(&self, key: GrantKey) -> bool {
        self.state().records.remove(&key).is_some()
    }
}

impl PermissionStore for MemoryPermissionStore {
    async fn find_database_permission(
        &self,
        user_id: i64,
        database: &str,
    ) -> DbResult<Option<PermissionRecord>> {
        Ok(self.find((user_id, database.to_string(), None)))
    }

    async fn find_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> DbResult<Option<PermissionRecord>> {
        Ok(self.find((user_id, database.to_string(), Some(table.to_string()))))
    }

    async fn upsert_database_permission(
        &self,
        user_id: i64,
        database: &str,
        permissions: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        Ok(self.upsert((user_id, database.to_string(), None), permissions))
    }

    async fn upsert_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
        permissions: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        Ok(self.upsert(
            (user_id, database.to_string(), Some(table.to_string())),
            permissions,
        ))
    }

    async fn delete_database_permission(&self, user_id: i64, database: &str) -> DbResult<bool> {
        Ok(self.delete((user_id, database.to_string(), None)))
    }

    async fn delete_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> DbResult<bool> {
        Ok(self.delete((user_id, database.to_string(), Some(table.to_string()))))
    }

    async fn list_user_permissions(&self, user_id: i64) -> DbResult<Vec<PermissionRecord>> {
        // BTreeMap order is already (user, database, table) with None first
        Ok(self
            .state()
            .records
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_database_permissions(&self, database: &str) -> DbResult<Vec<PermissionRecord>> {
        Ok(self
            .state()
            .records
            .values()
            .filter(|record| record.database == database)
            .cloned()
            .collect())
    }

    async fn delete_user_permissions(&self, user_id: i64) -> DbResult<u64> {
        let mut state = self.state();
        let before = state.records.len();
        state.records.retain(|(owner, _, _), _| *owner != user_id);
        Ok((before - state.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_keeps_one_record_per_key() {
        let store = MemoryPermissionStore::new();
        let first = store
            .upsert_database_permission(1, "SALES", PermissionSet::NONE)
            .await
            .unwrap();
        let second = store
            .upsert_database_permission(
                1,
                "SALES",
                PermissionSet {
                    read: true,
                    ..PermissionSet::NONE
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.permissions.read);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list_user_permissions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_database_and_table_records_coexist() {
        let store = MemoryPermissionStore::new();
        store
            .upsert_table_permission(1, "SALES", "Orders", PermissionSet::NONE)
            .await
            .unwrap();
        store
            .upsert_database_permission(1, "SALES", PermissionSet::NONE)
            .await
            .unwrap();

        let records = store.list_user_permissions(1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].table.is_none());
        assert_eq!(records[1].table.as_deref(), Some("Orders"));
    }

    #[tokio::test]
    async fn test_delete_user_permissions_counts() {
        let store = MemoryPermissionStore::new();
        store
            .upsert_database_permission(1, "A", PermissionSet::NONE)
            .await
            .unwrap();
        store
            .upsert_table_permission(1, "A", "t", PermissionSet::NONE)
            .await
            .unwrap();
        store
            .upsert_database_permission(2, "A", PermissionSet::NONE)
            .await
            .unwrap();

        assert_eq!(store.delete_user_permissions(1).await.unwrap(), 2);
        assert_eq!(store.delete_user_permissions(1).await.unwrap(), 0);
        assert_eq!(store.list_database_permissions("A").await.unwrap().len(), 1);
    }
}
