//! HTTP middleware: principal extraction, authorization guards and the audit hook.

pub mod audit;
pub mod authorize;
pub mod principal;

pub use audit::{AuditHook, AuditRecord, TracingAuditHook, audit};
pub use authorize::{AuthzRejection, PermissionGuard, PermissionTarget, enforce, require_admin};
pub use principal::{Principal, trusted_principal};
