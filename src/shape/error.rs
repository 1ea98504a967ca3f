//! Shape subscription error types.

use thiserror::Error;

use crate::db::DatabaseError;

/// Result type for shape operations.
pub type ShapeResult<T> = Result<T, ShapeError>;

/// Errors reported by a [`super::ShapeSubscriber`] implementation.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Another subscription for the same shape key is still being set up.
    #[error("shape '{0}' is already being subscribed")]
    AlreadySubscribing(String),

    /// The request never produced a response (connection, timeout, TLS).
    #[error("shape request failed: {0}")]
    Request(String),

    /// The endpoint refused the shape (bad filter, unknown table, auth).
    #[error("shape endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The endpoint failed while serving the shape.
    #[error("shape endpoint error ({status}): {body}")]
    Server { status: u16, body: String },

    /// The response body or headers could not be understood.
    #[error("failed to decode shape response: {0}")]
    Decode(String),

    /// Changes could not be written to the local replica.
    #[error("failed to apply shape changes locally: {0}")]
    Apply(#[from] DatabaseError),
}

impl TransportError {
    /// Check if retrying the same request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Server { .. })
    }

    pub fn is_already_subscribing(&self) -> bool {
        matches!(self, Self::AlreadySubscribing(_))
    }
}

/// Errors surfaced to callers of `sync_shape`.
///
/// Cloneable so every caller joined on one establishment attempt receives
/// the same outcome.
#[derive(Error, Debug, Clone)]
pub enum ShapeError {
    #[error("shape table must not be empty")]
    EmptyTable,

    #[error("table '{0}' is not part of the local schema")]
    UnknownTable(String),

    #[error("column '{column}' is not a column of '{table}'")]
    InvalidColumn { table: String, column: String },

    #[error("projection for '{table}' must include primary key column '{column}'")]
    MissingPrimaryKey { table: String, column: String },

    #[error("failed to establish shape subscription for '{table}': {source}")]
    Establish {
        table: String,
        #[source]
        source: TransportError,
    },

    #[error("initial sync failed for shape {shape_key}: {message}")]
    InitialSync { shape_key: String, message: String },

    #[error("session was released while the shape was being established")]
    SessionClosed,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
