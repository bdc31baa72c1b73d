//! Database module for connection pool management.
//!
//! This module provides:
//! - Per-database pool handles over MySQL, PostgreSQL and SQLite
//! - A registry keyed by database name with single-flight creation
//! - The pool manager (retry, reconnect, statistics, health check)

pub mod macros;
pub mod manager;
pub mod pool;
pub mod registry;

pub use manager::PoolManager;
pub use pool::{DbPool, PendingRequest, PoolHandle, PoolStats};
pub use registry::{PoolRegistry, PoolSlot};
