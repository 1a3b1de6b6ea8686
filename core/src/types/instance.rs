use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Primary,
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Standby => write!(f, "STANDBY"),
        }
    }
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    /// Login used for the SSH transport; `None` uses the operator's default.
    pub ssh_user: Option<String>,
    /// SYS password shared by both databases for redo transport.
    pub sys_password: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    #[error("instance id must not be empty")]
    EmptyId,
    #[error("instance '{0}' has no network address")]
    EmptyAddress(String),
    #[error("instance name '{0}' must match pattern 'ora-<number>'")]
    BadName(String),
    #[error("diskgroup name '{0}' must be letters, digits and underscores")]
    BadDiskgroup(String),
}

// ---------------------------------------------------------------------------
// InstanceHandle
// ---------------------------------------------------------------------------

/// Typed reference to one provisioned instance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    id: String,
    role: Role,
    address: String,
    credentials: Credentials,
}

impl InstanceHandle {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        address: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, InstanceError> {
        let id = id.into();
        let address = address.into();
        if id.trim().is_empty() {
            return Err(InstanceError::EmptyId);
        }
        if address.trim().is_empty() {
            return Err(InstanceError::EmptyAddress(id));
        }
        Ok(InstanceHandle {
            id,
            role,
            address,
            credentials,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

// ---------------------------------------------------------------------------
// InstanceNaming
// ---------------------------------------------------------------------------

/// Names derived from an `ora-<n>` instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceNaming {
    pub number: String,
}

impl InstanceNaming {
    pub fn parse(instance_id: &str) -> Result<Self, InstanceError> {
        let number = instance_id
            .strip_prefix("ora-")
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| InstanceError::BadName(instance_id.to_string()))?;
        Ok(InstanceNaming {
            number: number.to_string(),
        })
    }

    /// `ora-1` -> `ORA1`
    pub fn db_name(&self) -> String {
        format!("ORA{}", self.number)
    }

    /// `ora-1` -> `DGORA1`
    pub fn cdb_diskgroup(&self) -> String {
        format!("DGORA{}", self.number)
    }
}
