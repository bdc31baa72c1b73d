//! SQL-backed permission store.
//!
//! Grants live in two tables of the system database:
//!
//! - `database_permissions`, unique on `(user_id, database_name)`
//! - `table_permissions`, unique on `(user_id, database_name, table_name)`
//!
//! Statements are written once with `$N` placeholders and rewritten to `?` for MySQL
//! and SQLite. Every call obtains the system database pool from the [`PoolManager`],
//! counts itself as a pending request on that pool and reports driver errors back to
//! it, so a broken connection is rebuilt on the next call.

use super::{PermissionStore, record_order};
use crate::db::{PoolHandle, PoolManager};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use crate::permissions::types::{PermissionRecord, PermissionSet};
use crate::with_pool;
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};

const DATABASE_COLUMNS: &str = "id, user_id, database_name, can_read, can_write, can_delete, \
     can_create, created_at, updated_at";

const TABLE_COLUMNS: &str = "id, user_id, database_name, table_name, can_read, can_write, \
     can_delete, can_create, created_at, updated_at";

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS database_permissions (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT TRUE,
        can_write BOOLEAN NOT NULL DEFAULT FALSE,
        can_delete BOOLEAN NOT NULL DEFAULT FALSE,
        can_create BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, database_name)
    )",
    "CREATE TABLE IF NOT EXISTS table_permissions (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        table_name VARCHAR(255) NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT TRUE,
        can_write BOOLEAN NOT NULL DEFAULT FALSE,
        can_delete BOOLEAN NOT NULL DEFAULT FALSE,
        can_create BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, database_name, table_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_database_permissions_database
        ON database_permissions (database_name)",
    "CREATE INDEX IF NOT EXISTS idx_table_permissions_database
        ON table_permissions (database_name)",
];

const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS database_permissions (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT TRUE,
        can_write BOOLEAN NOT NULL DEFAULT FALSE,
        can_delete BOOLEAN NOT NULL DEFAULT FALSE,
        can_create BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        updated_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        UNIQUE KEY uq_database_permissions (user_id, database_name),
        KEY idx_database_permissions_database (database_name)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
    "CREATE TABLE IF NOT EXISTS table_permissions (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        table_name VARCHAR(255) NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT TRUE,
        can_write BOOLEAN NOT NULL DEFAULT FALSE,
        can_delete BOOLEAN NOT NULL DEFAULT FALSE,
        can_create BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        updated_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        UNIQUE KEY uq_table_permissions (user_id, database_name, table_name),
        KEY idx_table_permissions_database (database_name)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
];

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS database_permissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        database_name TEXT NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT 1,
        can_write BOOLEAN NOT NULL DEFAULT 0,
        can_delete BOOLEAN NOT NULL DEFAULT 0,
        can_create BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, database_name)
    )",
    "CREATE TABLE IF NOT EXISTS table_permissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        database_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        can_read BOOLEAN NOT NULL DEFAULT 1,
        can_write BOOLEAN NOT NULL DEFAULT 0,
        can_delete BOOLEAN NOT NULL DEFAULT 0,
        can_create BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, database_name, table_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_database_permissions_database
        ON database_permissions (database_name)",
    "CREATE INDEX IF NOT EXISTS idx_table_permissions_database
        ON table_permissions (database_name)",
];

/// Decode one grant row. `$scoped` selects whether a `table_name` column is read.
macro_rules! decode_record {
    ($row:expr, $scoped:expr) => {
        (|| -> Result<PermissionRecord, sqlx::Error> {
            let row = &$row;
            let table = if $scoped {
                Some(row.try_get::<String, _>("table_name")?)
            } else {
                None
            };
            Ok(PermissionRecord {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                database: row.try_get("database_name")?,
                table,
                permissions: PermissionSet {
                    read: row.try_get("can_read")?,
                    write: row.try_get("can_write")?,
                    delete: row.try_get("can_delete")?,
                    create: row.try_get("can_create")?,
                },
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })()
    };
}

/// Which grant table a statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Database,
    Table,
}

impl Scope {
    fn table(&self) -> &'static str {
        match self {
            Scope::Database => "database_permissions",
            Scope::Table => "table_permissions",
        }
    }

    fn columns(&self) -> &'static str {
        match self {
            Scope::Database => DATABASE_COLUMNS,
            Scope::Table => TABLE_COLUMNS,
        }
    }

    fn key_columns(&self) -> &'static str {
        match self {
            Scope::Database => "user_id, database_name",
            Scope::Table => "user_id, database_name, table_name",
        }
    }

    fn is_scoped(&self) -> bool {
        matches!(self, Scope::Table)
    }
}

/// Column filter for the listing queries.
#[derive(Debug, Clone, Copy)]
enum Filter<'a> {
    User(i64),
    Database(&'a str),
}

impl Filter<'_> {
    fn column(&self) -> &'static str {
        match self {
            Filter::User(_) => "user_id",
            Filter::Database(_) => "database_name",
        }
    }
}

/// Rewrite `$N` placeholders to `?` for backends with positional parameters.
fn positional(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|next| next.is_ascii_digit()) {
            while chars.peek().is_some_and(|next| next.is_ascii_digit()) {
                chars.next();
            }
            out.push('?');
        } else {
            out.push(c);
        }
    }
    out
}

pub struct SqlPermissionStore {
    pools: Arc<PoolManager>,
    database: String,
}

impl SqlPermissionStore {
    /// Store over the permission tables in `database` (the system database).
    pub fn new(pools: Arc<PoolManager>, database: impl Into<String>) -> Self {
        Self {
            pools,
            database: database.into(),
        }
    }

    pub fn system_database(&self) -> &str {
        &self.database
    }

    fn db_type(&self) -> DatabaseType {
        self.pools.target().db_type
    }

    fn sql(&self, statement: &str) -> String {
        match self.db_type() {
            DatabaseType::PostgreSQL => statement.to_string(),
            DatabaseType::MySQL | DatabaseType::SQLite => positional(statement),
        }
    }

    async fn handle(&self) -> DbResult<Arc<PoolHandle>> {
        self.pools.get_pool(&self.database).await
    }

    /// Report a driver error to the pool it came from and convert it.
    fn finish<T>(handle: &PoolHandle, result: Result<T, sqlx::Error>) -> DbResult<T> {
        result.map_err(|e| {
            handle.report_error(&e);
            DbError::from(e)
        })
    }

    /// Create the permission tables if they do not exist.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        let statements = match self.db_type() {
            DatabaseType::PostgreSQL => POSTGRES_SCHEMA,
            DatabaseType::MySQL => MYSQL_SCHEMA,
            DatabaseType::SQLite => SQLITE_SCHEMA,
        };

        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        for statement in statements {
            let result = with_pool!(&handle.pool, |p| {
                sqlx::query(statement).execute(p).await.map(|_| ())
            });
            Self::finish(&handle, result)?;
        }
        info!(database = %self.database, "Permission schema ready");
        Ok(())
    }

    /// Select one record by key; `$3` is the table name when `by_table` is set.
    fn select_one_sql(&self, scope: Scope, by_table: bool) -> String {
        let mut statement = format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND database_name = $2",
            scope.columns(),
            scope.table()
        );
        if by_table {
            statement.push_str(" AND table_name = $3");
        }
        self.sql(&statement)
    }

    async fn find(
        &self,
        scope: Scope,
        user_id: i64,
        database: &str,
        table: Option<&str>,
    ) -> DbResult<Option<PermissionRecord>> {
        let sql = self.select_one_sql(scope, table.is_some());

        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        let result = with_pool!(&handle.pool, |p| {
            let mut query = sqlx::query(&sql).bind(user_id).bind(database);
            if let Some(table) = table {
                query = query.bind(table);
            }
            match query.fetch_optional(p).await {
                Ok(Some(row)) => decode_record!(row, scope.is_scoped()).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            }
        });
        Self::finish(&handle, result)
    }

    async fn upsert(
        &self,
        scope: Scope,
        user_id: i64,
        database: &str,
        table: Option<&str>,
        permissions: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        let statement = match scope {
            Scope::Database => "INSERT INTO database_permissions \
                 (user_id, database_name, can_read, can_write, can_delete, can_create, \
                 created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            Scope::Table => "INSERT INTO table_permissions \
                 (user_id, database_name, table_name, can_read, can_write, can_delete, \
                 can_create, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        };
        let conflict = match self.db_type() {
            DatabaseType::MySQL => "ON DUPLICATE KEY UPDATE can_read = VALUES(can_read), \
                 can_write = VALUES(can_write), can_delete = VALUES(can_delete), \
                 can_create = VALUES(can_create), updated_at = VALUES(updated_at)"
                .to_string(),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => format!(
                "ON CONFLICT ({}) DO UPDATE SET can_read = excluded.can_read, \
                 can_write = excluded.can_write, can_delete = excluded.can_delete, \
                 can_create = excluded.can_create, updated_at = excluded.updated_at",
                scope.key_columns()
            ),
        };
        let sql = self.sql(&format!("{} {}", statement, conflict));
        let select = self.select_one_sql(scope, table.is_some());
        let now = Utc::now();

        // The write and the read-back share one transaction, so a concurrent delete
        // cannot land between them.
        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        let result = with_pool!(&handle.pool, |p| {
            async {
                let mut tx = p.begin().await?;

                let mut query = sqlx::query(&sql).bind(user_id).bind(database);
                if let Some(table) = table {
                    query = query.bind(table);
                }
                query
                    .bind(permissions.read)
                    .bind(permissions.write)
                    .bind(permissions.delete)
                    .bind(permissions.create)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                let mut query = sqlx::query(&select).bind(user_id).bind(database);
                if let Some(table) = table {
                    query = query.bind(table);
                }
                let row = query.fetch_optional(&mut *tx).await?;
                tx.commit().await?;

                let record = row
                    .map(|row| decode_record!(row, scope.is_scoped()))
                    .transpose()?;
                Ok::<_, sqlx::Error>(record)
            }
            .await
        });
        let record = Self::finish(&handle, result)?;
        debug!(user_id, database, table, "Permission upserted");

        record.ok_or_else(|| DbError::internal("Upserted permission record not found"))
    }

    async fn delete(
        &self,
        scope: Scope,
        user_id: i64,
        database: &str,
        table: Option<&str>,
    ) -> DbResult<bool> {
        let mut statement = format!(
            "DELETE FROM {} WHERE user_id = $1 AND database_name = $2",
            scope.table()
        );
        if table.is_some() {
            statement.push_str(" AND table_name = $3");
        }
        let sql = self.sql(&statement);

        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        let result = with_pool!(&handle.pool, |p| {
            let mut query = sqlx::query(&sql).bind(user_id).bind(database);
            if let Some(table) = table {
                query = query.bind(table);
            }
            query.execute(p).await.map(|r| r.rows_affected())
        });
        Ok(Self::finish(&handle, result)? > 0)
    }

    /// Fetch every record of one scope matching `filter`.
    async fn list_where(&self, scope: Scope, filter: Filter<'_>) -> DbResult<Vec<PermissionRecord>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE {} = $1",
            scope.columns(),
            scope.table(),
            filter.column()
        ));

        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        let result = with_pool!(&handle.pool, |p| {
            let query = match filter {
                Filter::User(user_id) => sqlx::query(&sql).bind(user_id),
                Filter::Database(database) => sqlx::query(&sql).bind(database),
            };
            match query.fetch_all(p).await {
                Ok(rows) => rows
                    .iter()
                    .map(|row| decode_record!(row, scope.is_scoped()))
                    .collect::<Result<Vec<_>, _>>(),
                Err(e) => Err(e),
            }
        });
        Self::finish(&handle, result)
    }

    /// Delete every grant of `user_id` in both tables as one transaction.
    async fn delete_all_for_user(&self, user_id: i64) -> DbResult<u64> {
        let tables_sql = self.sql("DELETE FROM table_permissions WHERE user_id = $1");
        let databases_sql = self.sql("DELETE FROM database_permissions WHERE user_id = $1");

        let handle = self.handle().await?;
        let _pending = handle.begin_request();
        let result = with_pool!(&handle.pool, |p| {
            async {
                let mut tx = p.begin().await?;
                let tables = sqlx::query(&tables_sql)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                let databases = sqlx::query(&databases_sql)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                tx.commit().await?;
                Ok::<_, sqlx::Error>(tables + databases)
            }
            .await
        });
        Self::finish(&handle, result)
    }
}

impl PermissionStore for SqlPermissionStore {
    async fn find_database_permission(
        &self,
        user_id: i64,
        database: &str,
    ) -> DbResult<Option<PermissionRecord>> {
        self.find(Scope::Database, user_id, database, None).await
    }

    async fn find_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> DbResult<Option<PermissionRecord>> {
        self.find(Scope::Table, user_id, database, Some(table)).await
    }

    async fn upsert_database_permission(
        &self,
        user_id: i64,
        database: &str,
        permissions: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        self.upsert(Scope::Database, user_id, database, None, permissions)
            .await
    }

    async fn upsert_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
        permissions: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        self.upsert(Scope::Table, user_id, database, Some(table), permissions)
            .await
    }

    async fn delete_database_permission(&self, user_id: i64, database: &str) -> DbResult<bool> {
        self.delete(Scope::Database, user_id, database, None).await
    }

    async fn delete_table_permission(
        &self,
        user_id: i64,
        database: &str,
        table: &str,
    ) -> DbResult<bool> {
        self.delete(Scope::Table, user_id, database, Some(table))
            .await
    }

    async fn list_user_permissions(&self, user_id: i64) -> DbResult<Vec<PermissionRecord>> {
        let filter = Filter::User(user_id);
        let mut records = self.list_where(Scope::Database, filter).await?;
        records.extend(self.list_where(Scope::Table, filter).await?);
        records.sort_by(|a, b| record_order(a).cmp(&record_order(b)));
        Ok(records)
    }

    async fn list_database_permissions(&self, database: &str) -> DbResult<Vec<PermissionRecord>> {
        let filter = Filter::Database(database);
        let mut records = self.list_where(Scope::Database, filter).await?;
        records.extend(self.list_where(Scope::Table, filter).await?);
        records.sort_by(|a, b| record_order(a).cmp(&record_order(b)));
        Ok(records)
    }

    async fn delete_user_permissions(&self, user_id: i64) -> DbResult<u64> {
        self.delete_all_for_user(user_id).await
    }
}

impl std::fmt::Debug for SqlPermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlPermissionStore")
            .field("database", &self.database)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_rewrites_placeholders() {
        assert_eq!(
            positional("SELECT 1 WHERE a = $1 AND b = $12"),
            "SELECT 1 WHERE a = ? AND b = ?"
        );
        assert_eq!(positional("SELECT '$' || x"), "SELECT '$' || x");
    }

    #[test]
    fn test_scope_columns() {
        assert!(!Scope::Database.columns().contains("table_name"));
        assert!(Scope::Table.columns().contains("table_name"));
        assert_eq!(Scope::Table.key_columns(), "user_id, database_name, table_name");
    }
}
