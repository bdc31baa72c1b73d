//! Integration tests for permission resolution over the SQL store.
//!
//! Tests verify that:
//! - Database-wide grants cover every table of the database
//! - Table-scoped grants replace the database-wide grant for that table only
//! - Assignments upsert one record per key, removals are idempotent
//! - Revoking a user is all-or-nothing, assignment survives concurrent removal
//! - Unknown permission kinds are rejected, storage failures deny
//! - The SQL store and the in-memory store resolve identically

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tablekeeper::{DbError, with_pool};
use tablekeeper::config::{BackoffStrategy, Environment, PoolSettings, RetryPolicy};
use tablekeeper::db::PoolManager;
use tablekeeper::error::DbResult;
use tablekeeper::models::ServerTarget;
use tablekeeper::permissions::{
    MemoryPermissionStore, PermissionEngine, PermissionGrant, PermissionRecord, PermissionSet,
    PermissionStore, PermissionType, SqlPermissionStore,
};
use tempfile::TempDir;

const SYSTEM_DB: &str = "tablekeeper";

async fn setup() -> (TempDir, Arc<PoolManager>, PermissionEngine<SqlPermissionStore>) {
    let dir = tempfile::tempdir().unwrap();
    let target = ServerTarget::new(format!("sqlite://{}", dir.path().display())).unwrap();
    let settings = PoolSettings::for_environment(Environment::Development);
    let retry = RetryPolicy::new(2, Duration::from_millis(10), BackoffStrategy::Fixed);
    let pools = Arc::new(PoolManager::new(target, settings, retry));

    let store = SqlPermissionStore::new(Arc::clone(&pools), SYSTEM_DB);
    store.ensure_schema().await.unwrap();
    // Running it twice must be harmless
    store.ensure_schema().await.unwrap();

    (dir, pools, PermissionEngine::new(store))
}

#[tokio::test]
async fn test_database_grant_covers_tables() {
    let (_dir, pools, engine) = setup().await;
    engine
        .assign_database_permission(7, "SALES", PermissionGrant::read_only().write(true))
        .await
        .unwrap();

    assert!(engine.has_permission(7, "SALES", None, PermissionType::Read).await);
    assert!(engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Write).await);
    assert!(!engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Delete).await);
    assert!(!engine.has_permission(7, "HR", None, PermissionType::Read).await);
    assert!(!engine.has_permission(8, "SALES", None, PermissionType::Read).await);
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_sales_orders_scenario() {
    let (_dir, pools, engine) = setup().await;
    let read = PermissionGrant {
        read: Some(true),
        ..PermissionGrant::default()
    };
    engine
        .assign_database_permission(7, "SALES", read)
        .await
        .unwrap();

    assert!(engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Read).await);
    assert!(!engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Write).await);

    let write = PermissionGrant {
        write: Some(true),
        ..PermissionGrant::default()
    };
    engine
        .assign_table_permission(7, "SALES", "Orders", write)
        .await
        .unwrap();

    assert!(engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Write).await);
    assert!(engine.has_permission(7, "SALES", Some("Orders"), PermissionType::Read).await);
    assert!(!engine.has_permission(7, "SALES", Some("Customers"), PermissionType::Write).await);
    assert!(!engine.has_permission(7, "SALES", None, PermissionType::Write).await);
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_table_grant_overrides_database_grant() {
    let (_dir, pools, engine) = setup().await;
    engine
        .assign_database_permission(7, "SALES", PermissionGrant::full())
        .await
        .unwrap();
    engine
        .assign_table_permission(7, "SALES", "Payroll", PermissionSet::NONE.into())
        .await
        .unwrap();
    engine
        .assign_database_permission(9, "SALES", PermissionSet::NONE.into())
        .await
        .unwrap();
    engine
        .assign_table_permission(9, "SALES", "Orders", PermissionGrant::read_only())
        .await
        .unwrap();

    for kind in PermissionType::ALL {
        assert!(!engine.has_permission(7, "SALES", Some("Payroll"), kind).await);
        assert!(engine.has_permission(7, "SALES", Some("Orders"), kind).await);
    }
    // A narrower grant can also widen access for one table
    assert!(engine.has_permission(9, "SALES", Some("Orders"), PermissionType::Read).await);
    assert!(!engine.has_permission(9, "SALES", Some("Customers"), PermissionType::Read).await);
    assert!(!engine.has_permission(9, "SALES", None, PermissionType::Read).await);
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_assignment_is_an_upsert() {
    let (_dir, pools, engine) = setup().await;
    let first = engine
        .assign_table_permission(3, "HR", "People", PermissionGrant::default().write(false))
        .await
        .unwrap();
    assert!(first.permissions.read);
    assert!(!first.permissions.write);
    assert_eq!(first.table.as_deref(), Some("People"));

    let second = engine
        .assign_table_permission(3, "HR", "People", PermissionGrant::full())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.permissions, PermissionGrant::full().resolve());

    let grants = engine.user_permissions(3).await.unwrap();
    assert!(grants.database_permissions.is_empty());
    assert_eq!(grants.table_permissions.len(), 1);
    assert_eq!(engine.database_grants("HR").await.unwrap().len(), 1);
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_removal_is_idempotent() {
    let (_dir, pools, engine) = setup().await;
    engine
        .assign_database_permission(4, "OPS", PermissionGrant::read_only())
        .await
        .unwrap();
    engine
        .assign_table_permission(4, "OPS", "Jobs", PermissionGrant::read_only())
        .await
        .unwrap();

    assert!(engine.remove_table_permission(4, "OPS", "Jobs").await.unwrap());
    assert!(!engine.remove_table_permission(4, "OPS", "Jobs").await.unwrap());
    assert!(engine.remove_database_permission(4, "OPS").await.unwrap());
    assert!(!engine.remove_database_permission(4, "OPS").await.unwrap());
    assert!(!engine.has_permission(4, "OPS", Some("Jobs"), PermissionType::Read).await);
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_accessible_databases_and_revoke() {
    let (_dir, pools, engine) = setup().await;
    engine
        .assign_database_permission(5, "SALES", PermissionGrant::read_only())
        .await
        .unwrap();
    engine
        .assign_table_permission(5, "HR", "People", PermissionGrant::read_only())
        .await
        .unwrap();
    engine
        .assign_database_permission(5, "OPS", PermissionGrant::read_only().read(false))
        .await
        .unwrap();

    assert_eq!(
        engine.accessible_databases(5).await.unwrap(),
        vec!["HR".to_string(), "SALES".to_string()]
    );
    assert_eq!(engine.revoke_all_for_user(5).await.unwrap(), 3);
    assert!(engine.accessible_databases(5).await.unwrap().is_empty());
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_revoke_is_all_or_nothing() {
    let (_dir, pools, engine) = setup().await;
    engine
        .assign_database_permission(6, "SALES", PermissionGrant::read_only())
        .await
        .unwrap();
    engine
        .assign_table_permission(6, "SALES", "Orders", PermissionGrant::full())
        .await
        .unwrap();

    // Make the second half of the revoke fail
    let handle = pools.get_pool(SYSTEM_DB).await.unwrap();
    with_pool!(&handle.pool, |p| {
        sqlx::query("DROP TABLE database_permissions")
            .execute(p)
            .await
            .unwrap();
    });

    assert!(engine.revoke_all_for_user(6).await.is_err());
    // The table grant deleted first was rolled back with the failed transaction
    let kept = engine
        .store()
        .find_table_permission(6, "SALES", "Orders")
        .await
        .unwrap();
    assert!(kept.is_some_and(|record| record.permissions.write));
    pools.close_all_pools().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_assignment_survives_concurrent_removal() {
    let (_dir, pools, engine) = setup().await;
    let engine = Arc::new(engine);

    for _ in 0..20 {
        let assign = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .assign_table_permission(11, "OPS", "Jobs", PermissionGrant::read_only())
                    .await
            }
        });
        let remove = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.remove_table_permission(11, "OPS", "Jobs").await }
        });

        let record = assign.await.unwrap().unwrap();
        assert_eq!(record.table.as_deref(), Some("Jobs"));
        assert!(record.permissions.read);
        remove.await.unwrap().unwrap();
    }
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_unknown_kind_is_rejected() {
    let (_dir, pools, engine) = setup().await;
    let err = engine.check(1, "SALES", None, "EXECUTE").await.unwrap_err();
    assert!(matches!(err, DbError::InvalidPermissionType { .. }));
    assert_eq!(err.code(), "INVALID_PERMISSION_TYPE");
    assert!(!engine.check(1, "SALES", None, " read ").await.unwrap());
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_unreachable_store_denies() {
    let dir = tempfile::tempdir().unwrap();
    // Pools cannot be created inside a directory that does not exist
    let target = ServerTarget::new(format!("sqlite://{}/absent", dir.path().display())).unwrap();
    let retry = RetryPolicy::new(1, Duration::from_millis(1), BackoffStrategy::Fixed);
    let pools = Arc::new(PoolManager::new(
        target,
        PoolSettings::for_environment(Environment::Development),
        retry,
    ));
    let engine = PermissionEngine::new(SqlPermissionStore::new(pools, SYSTEM_DB));

    assert!(!engine.has_permission(1, "SALES", None, PermissionType::Read).await);
    assert_eq!(
        engine.effective_permissions(1, "SALES", Some("Orders")).await,
        PermissionSet::NONE
    );
    assert!(matches!(
        engine.user_permissions(1).await,
        Err(DbError::PermissionLookup { .. })
    ));
}

/// Store whose lookups never finish.
struct StalledStore;

impl PermissionStore for StalledStore {
    async fn find_database_permission(&self, _: i64, _: &str) -> DbResult<Option<PermissionRecord>> {
        std::future::pending().await
    }

    async fn find_table_permission(
        &self,
        _: i64,
        _: &str,
        _: &str,
    ) -> DbResult<Option<PermissionRecord>> {
        std::future::pending().await
    }

    async fn upsert_database_permission(
        &self,
        _: i64,
        _: &str,
        _: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        Err(DbError::internal("read-only"))
    }

    async fn upsert_table_permission(
        &self,
        _: i64,
        _: &str,
        _: &str,
        _: PermissionSet,
    ) -> DbResult<PermissionRecord> {
        Err(DbError::internal("read-only"))
    }

    async fn delete_database_permission(&self, _: i64, _: &str) -> DbResult<bool> {
        Ok(false)
    }

    async fn delete_table_permission(&self, _: i64, _: &str, _: &str) -> DbResult<bool> {
        Ok(false)
    }

    async fn list_user_permissions(&self, _: i64) -> DbResult<Vec<PermissionRecord>> {
        Ok(Vec::new())
    }

    async fn list_database_permissions(&self, _: &str) -> DbResult<Vec<PermissionRecord>> {
        Ok(Vec::new())
    }

    async fn delete_user_permissions(&self, _: i64) -> DbResult<u64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_lookup_timeout_denies() {
    let engine =
        PermissionEngine::new(StalledStore).with_lookup_timeout(Duration::from_millis(20));
    assert!(!engine.has_permission(1, "SALES", Some("Orders"), PermissionType::Read).await);

    let err = engine
        .assign_database_permission(1, "SALES", PermissionGrant::full())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PermissionWrite { .. }));
}

#[tokio::test]
async fn test_sql_and_memory_stores_agree() {
    let (_dir, pools, sql) = setup().await;
    let memory = PermissionEngine::new(MemoryPermissionStore::new());
    let databases = ["SALES", "HR"];
    let tables = ["Orders", "People", "Jobs"];
    let mut rng = rand::thread_rng();

    for _ in 0..40 {
        let user = rng.gen_range(1..=3);
        let database = databases[rng.gen_range(0..databases.len())];
        let grant = PermissionGrant::default()
            .read(rng.gen_bool(0.7))
            .write(rng.gen_bool(0.5))
            .delete(rng.gen_bool(0.3))
            .create(rng.gen_bool(0.3));

        if rng.gen_bool(0.5) {
            sql.assign_database_permission(user, database, grant)
                .await
                .unwrap();
            memory
                .assign_database_permission(user, database, grant)
                .await
                .unwrap();
        } else {
            let table = tables[rng.gen_range(0..tables.len())];
            sql.assign_table_permission(user, database, table, grant)
                .await
                .unwrap();
            memory
                .assign_table_permission(user, database, table, grant)
                .await
                .unwrap();
        }
    }

    for user in 1..=3 {
        for database in databases {
            assert_eq!(
                sql.effective_permissions(user, database, None).await,
                memory.effective_permissions(user, database, None).await
            );
            for table in tables {
                for kind in PermissionType::ALL {
                    assert_eq!(
                        sql.has_permission(user, database, Some(table), kind).await,
                        memory.has_permission(user, database, Some(table), kind).await,
                        "user {user} {kind} on {database}.{table}"
                    );
                }
            }
        }
        assert_eq!(
            sql.accessible_databases(user).await.unwrap(),
            memory.accessible_databases(user).await.unwrap()
        );
    }
    pools.close_all_pools().await;
}
