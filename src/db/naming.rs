//! Deterministic naming of identity-scoped databases.
//!
//! # Name Format
//!
//! ```text
//! {prefix}-{identity}-v{schema_version}      e.g. shapesync-user_42-v3
//! {prefix}-h{sha256[..24]}-v{schema_version} for identities that are not filename-safe
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{DatabaseError, DbResult};

const MAX_RAW_IDENTITY_LEN: usize = 64;

/// Id of the authenticated identity a replica belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    /// Create an identity id, rejecting empty values.
    pub fn new(id: impl Into<String>) -> DbResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DatabaseError::InvalidIdentity(
                "identity id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename-safe form of the id.
    fn storage_segment(&self) -> String {
        let safe = self.0.len() <= MAX_RAW_IDENTITY_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if safe {
            return self.0.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("h{}", &digest[..24])
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully derived database name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives database names from `(prefix, identity, schema_version)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseNaming {
    prefix: String,
    schema_version: u32,
}

impl DatabaseNaming {
    pub fn new(prefix: impl Into<String>, schema_version: u32) -> Self {
        Self {
            prefix: prefix.into(),
            schema_version,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Name of the database for an identity at the current schema version.
    pub fn name_for(&self, identity: &IdentityId) -> DatabaseName {
        DatabaseName(format!(
            "{}-{}-v{}",
            self.prefix,
            identity.storage_segment(),
            self.schema_version
        ))
    }

    /// Whether a stored database was created by this crate under this prefix.
    pub fn owns(&self, stored: &str) -> bool {
        let Some(rest) = stored.strip_prefix(&self.prefix) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix('-') else {
            return false;
        };
        match rest.rsplit_once("-v") {
            Some((identity, version)) => {
                !identity.is_empty()
                    && !version.is_empty()
                    && version.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Owned databases that must not survive a session for `identity`.
    pub fn stale<'a>(
        &self,
        identity: &IdentityId,
        stored: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let current = self.name_for(identity);
        stored
            .into_iter()
            .filter(|name| self.owns(name) && *name != current.as_str())
            .map(str::to_string)
            .collect()
    }
}
