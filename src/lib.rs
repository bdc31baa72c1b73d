//! tablekeeper library
//!
//! Backend core of a multi-database table browser: lazily-created per-database
//! connection pools on a shared server, and layered (database-wide, then
//! table-scoped) access control enforced by HTTP middleware.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod permissions;
pub mod transport;

pub use config::Config;
pub use db::PoolManager;
pub use error::{DbError, DbResult};
pub use permissions::PermissionEngine;
