//! HTTP shape engine.
//!
//! Implements [`crate::shape::ShapeSubscriber`] against a remote shape endpoint:
//! each subscription fetches the shape snapshot, then long-polls for changes,
//! writing every batch and its stream position to the replica in one
//! transaction.

mod apply;
mod client;
mod protocol;
mod stream;
mod subscriber;

pub use apply::{
    apply_changes, load_position, prepare_changes, save_position, to_sql_value, RowChange,
    StreamPosition,
};
pub use client::{FetchOutcome, ShapeClient};
pub use protocol::{
    parse_messages, ChangeMessage, Control, Message, Operation, ShapeRequest, ShapeResponse,
    CURSOR_HEADER, HANDLE_HEADER, INITIAL_OFFSET, OFFSET_HEADER, UP_TO_DATE_HEADER,
};
pub use stream::{HttpShapeStream, RetryPolicy, SyncCursor};
pub use subscriber::HttpShapeSubscriber;
