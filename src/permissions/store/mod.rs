//! Permission storage.
//!
//! [`PermissionStore`] is the narrow persistence seam the resolution engine sits on:
//! parameterized lookups, upserts and deletes over the two grant tables. Two
//! implementations ship:
//!
//! - [`SqlPermissionStore`]: the `database_permissions` / `table_permissions` tables in
//!   the system database, reached through the pool manager.
//! - [`MemoryPermissionStore`]: process-local maps, for tests and local development.

use crate::error::DbResult;
use crate::permissions::types::{PermissionRecord, PermissionSet};

pub mod memory;
pub mod sql;

pub use memory::MemoryPermissionStore;
pub use sql::SqlPermissionStore;

/// Persistence operations over database-wide and table-scoped grants.
///
/// Lookups return `Ok(None)` when no grant exists; errors are reserved for storage
/// failures. Upserts keep at most one record per (user, database[, table]) key.
pub trait PermissionStore: Send + Sync {
    fn find_database_permission(
        &self,
        user_id: i64,
        database: &str,
    ) -> impl Future<Output = DbResult<Option<PermissionRecord>>> + Send;

    fn find_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> impl Future<Output = DbResult<Option<PermissionRecord>>> + Send;

    fn upsert_database_permission(
        &self,
        user_id: i64,
        database: &str,
        permissions: PermissionSet,
    ) -> impl Future<Output = DbResult<PermissionRecord>> + Send;

    fn upsert_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
        permissions: PermissionSet,
    ) -> impl Future<Output = DbResult<PermissionRecord>> + Send;

    /// Returns whether a record was deleted.
    fn delete_database_permission(
        &self,
        user_id: i64,
        database: &str,
    ) -> impl Future<Output = DbResult<bool>> + Send;

    /// Returns whether a record was deleted.
    fn delete_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> impl Future<Output = DbResult<bool>> + Send;

    /// All grants of one user, ordered by database then table (database-wide first).
    fn list_user_permissions(
        &self,
        user_id: i64,
    ) -> impl Future<Output = DbResult<Vec<PermissionRecord>>> + Send;

    /// All grants on one database, ordered by user then table.
    fn list_database_permissions(
        &self,
        database: &str,
    ) -> impl Future<Output = DbResult<Vec<PermissionRecord>>> + Send;

    /// Delete every grant of one user. Returns the number of records removed.
    fn delete_user_permissions(&self, user_id: i64) -> impl Future<Output = DbResult<u64>> + Send;
}

/// Sort key shared by the listing operations: `None` (database-wide) sorts first.
pub(crate) fn record_order(record: &PermissionRecord) -> (i64, &str, Option<&str>) {
    (record.user_id, record.database.as_str(), record.table.as_deref())
}
