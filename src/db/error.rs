//! Database lifecycle error types.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::schema::SchemaError;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Errors that can occur while provisioning or using a replica database.
///
/// Cloneable so a single acquisition outcome can be handed to every caller
/// that joined it.
#[derive(Error, Debug, Clone)]
pub enum DatabaseError {
    /// SQLite reported an error.
    #[error("SQLite error: {0}")]
    Sqlite(Arc<rusqlite::Error>),

    /// Filesystem error while managing on-disk stores.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Schema registration failed; the database was not handed out.
    #[error("schema registration failed: {0}")]
    Schema(Arc<SchemaError>),

    /// The database was closed by a release or identity switch.
    #[error("database '{0}' is closed")]
    Closed(String),

    /// No database has been acquired.
    #[error("no database is open")]
    NotOpen,

    /// Identity ids must be non-empty.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

impl DatabaseError {
    /// Check if this error means the handle outlived its session.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::NotOpen)
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(Arc::new(err))
    }
}

impl From<io::Error> for DatabaseError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<SchemaError> for DatabaseError {
    fn from(err: SchemaError) -> Self {
        Self::Schema(Arc::new(err))
    }
}
