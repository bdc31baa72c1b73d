//! Permission model types.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Operation a permission check is made for.
///
/// Serializes as the uppercase name; deserializes through [`FromStr`], so JSON input
/// is as case-insensitive as every other place a kind is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum PermissionType {
    Read,
    Write,
    Delete,
    Create,
}

impl PermissionType {
    pub const ALL: [PermissionType; 4] = [Self::Read, Self::Write, Self::Delete, Self::Create];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
        }
    }
}

impl std::fmt::Display for PermissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive; anything outside the four kinds is `InvalidPermissionType`.
impl FromStr for PermissionType {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Ok(Self::Read),
            "WRITE" => Ok(Self::Write),
            "DELETE" => Ok(Self::Delete),
            "CREATE" => Ok(Self::Create),
            _ => Err(DbError::invalid_permission_type(s)),
        }
    }
}

impl TryFrom<String> for PermissionType {
    type Error = DbError;

    fn try_from(value: String) -> DbResult<Self> {
        value.parse()
    }
}

/// The four independent booleans of one grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub create: bool,
}

impl PermissionSet {
    pub const NONE: PermissionSet = PermissionSet {
        read: false,
        write: false,
        delete: false,
        create: false,
    };

    pub fn allows(&self, kind: PermissionType) -> bool {
        match kind {
            PermissionType::Read => self.read,
            PermissionType::Write => self.write,
            PermissionType::Delete => self.delete,
            PermissionType::Create => self.create,
        }
    }
}

/// Requested grant. Unspecified flags default to read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionGrant {
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub write: Option<bool>,
    #[serde(default)]
    pub delete: Option<bool>,
    #[serde(default)]
    pub create: Option<bool>,
}

impl PermissionGrant {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self::from(PermissionSet {
            read: true,
            write: true,
            delete: true,
            create: true,
        })
    }

    pub fn read(mut self, value: bool) -> Self {
        self.read = Some(value);
        self
    }

    pub fn write(mut self, value: bool) -> Self {
        self.write = Some(value);
        self
    }

    pub fn delete(mut self, value: bool) -> Self {
        self.delete = Some(value);
        self
    }

    pub fn create(mut self, value: bool) -> Self {
        self.create = Some(value);
        self
    }

    /// Resolve defaults: read=true, everything else false.
    pub fn resolve(&self) -> PermissionSet {
        PermissionSet {
            read: self.read.unwrap_or(true),
            write: self.write.unwrap_or(false),
            delete: self.delete.unwrap_or(false),
            create: self.create.unwrap_or(false),
        }
    }
}

impl From<PermissionSet> for PermissionGrant {
    fn from(set: PermissionSet) -> Self {
        Self {
            read: Some(set.read),
            write: Some(set.write),
            delete: Some(set.delete),
            create: Some(set.create),
        }
    }
}

/// One stored grant. `table` is `None` for a database-wide grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRecord {
    pub id: i64,
    pub user_id: i64,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(flatten)]
    pub permissions: PermissionSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PermissionRecord {
    pub fn is_database_wide(&self) -> bool {
        self.table.is_none()
    }
}

/// Every grant held by one user, split by scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserPermissions {
    pub database_permissions: Vec<PermissionRecord>,
    pub table_permissions: Vec<PermissionRecord>,
}

impl UserPermissions {
    /// Partition records by scope, keeping their order.
    pub fn from_records(records: impl IntoIterator<Item = PermissionRecord>) -> Self {
        let (database_permissions, table_permissions) =
            records.into_iter().partition(PermissionRecord::is_database_wide);
        Self {
            database_permissions,
            table_permissions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.database_permissions.is_empty() && self.table_permissions.is_empty()
    }
}
