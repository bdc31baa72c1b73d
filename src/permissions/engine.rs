//! Permission resolution engine.
//!
//! Decides whether a (user, database, table, operation) tuple is granted:
//!
//! 1. With a table name, a table-scoped grant decides exactly when one exists. A
//!    table grant with the flag off is a hard deny; the database-wide grant is not
//!    consulted.
//! 2. Otherwise the database-wide grant decides. No grant at all denies.
//! 3. Lookup failures and timeouts deny.
//!
//! Admins never reach the engine; the bypass lives in the authorization middleware.

use crate::error::{DbError, DbResult};
use crate::permissions::store::{PermissionStore, SqlPermissionStore};
use crate::permissions::types::{
    PermissionGrant, PermissionRecord, PermissionSet, PermissionType, UserPermissions,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound for one permission lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct PermissionEngine<S = SqlPermissionStore> {
    store: S,
    lookup_timeout: Duration,
}

impl<S: PermissionStore> PermissionEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether the user holds `kind` on the database (and table, if given).
    ///
    /// Never fails: any storage error or timeout is logged and treated as deny.
    pub async fn has_permission(
        &self,
        user_id: i64,
        database: &str,
        table: Option<&str>,
        kind: PermissionType,
    ) -> bool {
        match self.resolve(user_id, database, table).await {
            Ok(Some(set)) => {
                let granted = set.allows(kind);
                debug!(
                    user_id,
                    database,
                    table,
                    permission = %kind,
                    granted,
                    "Permission resolved"
                );
                granted
            }
            Ok(None) => {
                debug!(user_id, database, table, permission = %kind, "No grant found");
                false
            }
            Err(e) => {
                warn!(
                    user_id,
                    database,
                    table,
                    permission = %kind,
                    error = %e,
                    "Permission lookup failed, denying"
                );
                false
            }
        }
    }

    /// String-typed variant of [`has_permission`](Self::has_permission).
    ///
    /// Fails only when `kind` is not one of READ, WRITE, DELETE, CREATE.
    pub async fn check(
        &self,
        user_id: i64,
        database: &str,
        table: Option<&str>,
        kind: &str,
    ) -> DbResult<bool> {
        let kind: PermissionType = kind.parse()?;
        Ok(self.has_permission(user_id, database, table, kind).await)
    }

    /// All four flags under the same resolution rule; all false when nothing matches
    /// or the lookup fails.
    pub async fn effective_permissions(
        &self,
        user_id: i64,
        database: &str,
        table: Option<&str>,
    ) -> PermissionSet {
        match self.resolve(user_id, database, table).await {
            Ok(set) => set.unwrap_or(PermissionSet::NONE),
            Err(e) => {
                warn!(user_id, database, table, error = %e, "Permission lookup failed, denying");
                PermissionSet::NONE
            }
        }
    }

    /// The grant that decides for this key, if any.
    async fn resolve(
        &self,
        user_id: i64,
        database: &str,
        table: Option<&str>,
    ) -> DbResult<Option<PermissionSet>> {
        if let Some(table) = table {
            let scoped = self
                .bounded(self.store.find_table_permission(user_id, database, table))
                .await?;
            if let Some(record) = scoped {
                return Ok(Some(record.permissions));
            }
        }

        let wide = self
            .bounded(self.store.find_database_permission(user_id, database))
            .await?;
        Ok(wide.map(|record| record.permissions))
    }

    async fn bounded<T>(&self, lookup: impl Future<Output = DbResult<T>>) -> DbResult<T> {
        tokio::time::timeout(self.lookup_timeout, lookup)
            .await
            .map_err(|_| {
                DbError::permission_lookup(format!(
                    "lookup exceeded {}ms",
                    self.lookup_timeout.as_millis()
                ))
            })?
    }

    /// Create or replace the database-wide grant.
    pub async fn assign_database_permission(
        &self,
        user_id: i64,
        database: &str,
        grant: PermissionGrant,
    ) -> DbResult<PermissionRecord> {
        let set = grant.resolve();
        let record = self
            .store
            .upsert_database_permission(user_id, database, set)
            .await
            .map_err(|e| DbError::permission_write("assign database permission", e.to_string()))?;
        info!(user_id, database, permissions = ?set, "Database permission assigned");
        Ok(record)
    }

    /// Create or replace the table-scoped grant.
    pub async fn assign_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
        grant: PermissionGrant,
    ) -> DbResult<PermissionRecord> {
        let set = grant.resolve();
        let record = self
            .store
            .upsert_table_permission(user_id, database, table, set)
            .await
            .map_err(|e| DbError::permission_write("assign table permission", e.to_string()))?;
        info!(user_id, database, table, permissions = ?set, "Table permission assigned");
        Ok(record)
    }

    /// Remove the database-wide grant. Returns whether one existed.
    pub async fn remove_database_permission(&self, user_id: i64, database: &str) -> DbResult<bool> {
        let removed = self
            .store
            .delete_database_permission(user_id, database)
            .await
            .map_err(|e| DbError::permission_write("remove database permission", e.to_string()))?;
        info!(user_id, database, removed, "Database permission removed");
        Ok(removed)
    }

    /// Remove the table-scoped grant. Returns whether one existed.
    pub async fn remove_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> DbResult<bool> {
        let removed = self
            .store
            .delete_table_permission(user_id, database, table)
            .await
            .map_err(|e| DbError::permission_write("remove table permission", e.to_string()))?;
        info!(user_id, database, table, removed, "Table permission removed");
        Ok(removed)
    }

    pub async fn user_permissions(&self, user_id: i64) -> DbResult<UserPermissions> {
        let records = self
            .store
            .list_user_permissions(user_id)
            .await
            .map_err(|e| DbError::permission_lookup(e.to_string()))?;
        Ok(UserPermissions::from_records(records))
    }

    /// Every grant on one database, both scopes.
    pub async fn database_grants(&self, database: &str) -> DbResult<Vec<PermissionRecord>> {
        self.store
            .list_database_permissions(database)
            .await
            .map_err(|e| DbError::permission_lookup(e.to_string()))
    }

    /// Databases where the user holds a read grant at either scope, sorted.
    pub async fn accessible_databases(&self, user_id: i64) -> DbResult<Vec<String>> {
        let records = self
            .store
            .list_user_permissions(user_id)
            .await
            .map_err(|e| DbError::permission_lookup(e.to_string()))?;
        let databases: BTreeSet<String> = records
            .into_iter()
            .filter(|record| record.permissions.read)
            .map(|record| record.database)
            .collect();
        Ok(databases.into_iter().collect())
    }

    /// Remove every grant of a user that is being deleted.
    pub async fn revoke_all_for_user(&self, user_id: i64) -> DbResult<u64> {
        let removed = self
            .store
            .delete_user_permissions(user_id)
            .await
            .map_err(|e| DbError::permission_write("revoke all permissions", e.to_string()))?;
        info!(user_id, removed, "All permissions revoked");
        Ok(removed)
    }
}
