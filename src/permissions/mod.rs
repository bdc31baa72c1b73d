//! Layered access control.
//!
//! Grants exist at two levels: database-wide and table-scoped. A table-scoped grant
//! overrides the database-wide one for that table only.

pub mod engine;
pub mod store;
pub mod types;

pub use engine::PermissionEngine;
pub use store::{MemoryPermissionStore, PermissionStore, SqlPermissionStore};
pub use types::{PermissionGrant, PermissionRecord, PermissionSet, PermissionType, UserPermissions};
