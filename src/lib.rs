//! # shapesync
//!
//! Keeps a local SQLite replica of server-side table shapes in sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 SyncClient (facade)                      │
//! │   initialize(identity) · database() · sync_shape(..)     │
//! └─────────────────────────────────────────────────────────┘
//!              │                              │
//!              ▼ [db]                         ▼ [shape]
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │ DatabaseManager           │  │ ShapeCoordinator         │
//! │ one Session per identity  │◀─│ dedup · readiness ·      │
//! │ + SchemaRegistry DDL      │  │ must-refetch cleanup     │
//! └───────────────────────────┘  └──────────────────────────┘
//!              │                              │ ShapeSubscriber
//!              ▼                              ▼ [remote]
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │ StorageBackend            │  │ HttpShapeSubscriber      │
//! │ (SQLite files / memory)   │  │ GET /v1/shape, long-poll │
//! └───────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shapesync::prelude::*;
//!
//! # async fn run() -> Result<(), SyncError> {
//! let client = SyncClient::from_settings(&Settings::load()?)?;
//! client.initialize("user-42").await?;
//!
//! let shape = client
//!     .sync_shape(ShapeDescriptor::new("documents").filter("search_space_id = 3"))
//!     .await?;
//! shape.initial_sync().await?;
//!
//! let rows = client.database().await?.row_count("documents")?;
//! println!("{rows} documents");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod db;
pub mod remote;
pub mod schema;
pub mod shape;

pub use client::{global, install_global, SyncClient, SyncError, SyncResult};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::client::{SyncClient, SyncError, SyncResult};
    pub use crate::config::Settings;
    pub use crate::db::{CleanupOutcome, IdentityId, ReplicaDb, Session};
    pub use crate::shape::{ReadinessPhase, ShapeDescriptor, ShapeHandle};
}
