//! Shape descriptors and the keys derived from them.
//!
//! # Keys
//!
//! ```text
//! CacheKey  ("documents", Some("id = '5'"), Some(["id", "title"]))   per session, dedups callers
//! ShapeKey  documents-<sha256(identity, schema_version, table, where)[..16]>  names the stream
//! ```
//!
//! Descriptors that differ only in surrounding or repeated whitespace (outside
//! string literals), column order, or duplicate columns map to the same
//! cache key.

use std::fmt;

use sha2::{Digest, Sha256};

use super::error::{ShapeError, ShapeResult};
use crate::db::IdentityId;

/// What to replicate: a table, an optional row filter and an optional projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDescriptor {
    table: String,
    filter: Option<String>,
    columns: Option<Vec<String>>,
}

impl ShapeDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            columns: None,
        }
    }

    /// Restrict rows with an SQL predicate, e.g. `search_space_id = 3`.
    #[must_use]
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.filter = Some(predicate.into());
        self
    }

    /// Only replicate these columns.
    #[must_use]
    pub fn columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn where_clause(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn projection(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Canonical form used for caching and for the upstream request.
    pub fn normalize(&self) -> ShapeResult<NormalizedShape> {
        let table = self.table.trim().to_string();
        if table.is_empty() {
            return Err(ShapeError::EmptyTable);
        }

        let (filter, repaired) = match self.filter.as_deref().map(normalize_filter) {
            Some((filter, repaired)) if !filter.is_empty() => (Some(filter), repaired),
            _ => (None, false),
        };

        let columns = match &self.columns {
            Some(columns) => {
                let mut seen: Vec<String> = Vec::with_capacity(columns.len());
                for column in columns {
                    let column = column.trim();
                    if !is_identifier(column) {
                        return Err(ShapeError::InvalidColumn {
                            table: table.clone(),
                            column: column.to_string(),
                        });
                    }
                    if !seen.iter().any(|c| c == column) {
                        seen.push(column.to_string());
                    }
                }
                (!seen.is_empty()).then_some(seen)
            }
            None => None,
        };

        let cache_key = CacheKey::new(&table, filter.as_deref(), columns.as_deref());
        Ok(NormalizedShape {
            table,
            filter,
            columns,
            repaired,
            cache_key,
        })
    }
}

/// A descriptor after trimming, whitespace folding and quote repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedShape {
    pub table: String,
    pub filter: Option<String>,
    /// Projection in caller order, duplicates removed.
    pub columns: Option<Vec<String>>,
    /// An unterminated string literal in the filter was closed.
    pub repaired: bool,
    pub cache_key: CacheKey,
}

impl NormalizedShape {
    pub fn shape_key(&self, identity: &IdentityId, schema_version: u32) -> ShapeKey {
        ShapeKey::derive(identity, schema_version, &self.table, self.filter.as_deref())
    }
}

/// Identifies equivalent descriptors within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    fn new(table: &str, filter: Option<&str>, columns: Option<&[String]>) -> Self {
        let columns = columns.map(|columns| {
            let mut sorted = columns.to_vec();
            sorted.sort();
            sorted
        });
        Self(format!("({table:?}, {filter:?}, {columns:?})"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable name of a remote subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey(String);

impl ShapeKey {
    /// Same inputs always give the same key.
    pub fn derive(
        identity: &IdentityId,
        schema_version: u32,
        table: &str,
        filter: Option<&str>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(schema_version.to_be_bytes());
        hasher.update(table.as_bytes());
        hasher.update([0]);
        if let Some(filter) = filter {
            hasher.update([1]);
            hasher.update(filter.as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("{table}-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fold whitespace outside `'...'` literals and `"..."` identifiers, then
/// close whichever of them was left unterminated.
///
/// Returns the normalized filter and whether a closing quote was appended.
pub fn normalize_filter(filter: &str) -> (String, bool) {
    let mut out = String::with_capacity(filter.len() + 1);
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in filter.trim().chars() {
        if let Some(open) = quote {
            out.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        }
        out.push(c);
    }

    if let Some(open) = quote {
        out.push(open);
    }
    (out, quote.is_some())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
