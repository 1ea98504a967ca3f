//! Local replica databases, one per identity.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   acquire(identity)   ┌──────────────────┐
//! │  DatabaseManager   │ ─────────────────────▶│  StorageBackend  │
//! │  (one Session)     │◀───────────────────── │  file / memory   │
//! └────────┬───────────┘      Connection       └──────────────────┘
//!          │ Session { identity, ReplicaDb, ShapeRegistry }
//!          ▼
//!    SchemaRegistry::register (DDL + version check)
//! ```
//!
//! Database names come from [`DatabaseNaming`]; anything stored under the same
//! prefix that does not match the current identity and schema version is
//! deleted after a successful acquisition.

mod connection;
mod error;
mod manager;
mod naming;
mod storage;

pub use connection::ReplicaDb;
pub use error::{DatabaseError, DbResult};
pub use manager::{CleanupOutcome, DatabaseManager, Session};
pub use naming::{DatabaseName, DatabaseNaming, IdentityId};
pub use storage::{FileStorage, MemoryStorage, StorageBackend};
