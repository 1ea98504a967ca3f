//! The subscription capability the coordinator is built on.
//!
//! [`ShapeSubscriber`] is the only thing the coordinator needs from a sync
//! engine. The HTTP engine in [`crate::remote`] implements it; tests use fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Transaction;
use tokio::sync::broadcast;

use super::descriptor::ShapeKey;
use super::error::TransportError;
use crate::db::ReplicaDb;

/// Called once when the stream first catches up.
pub type InitialSyncFn = Arc<dyn Fn() + Send + Sync>;

/// Called for stream errors. The stream decides whether it keeps running.
pub type ErrorFn = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Called inside the refetch transaction, before the fresh snapshot is written.
pub type MustRefetchFn = Arc<dyn Fn(&Transaction<'_>) -> rusqlite::Result<()> + Send + Sync>;

/// Hooks a subscriber invokes over the life of a stream.
#[derive(Clone)]
pub struct SubscriptionCallbacks {
    pub on_initial_sync: InitialSyncFn,
    pub on_error: ErrorFn,
    pub on_must_refetch: MustRefetchFn,
}

impl SubscriptionCallbacks {
    /// Callbacks that do nothing.
    pub fn noop() -> Self {
        Self {
            on_initial_sync: Arc::new(|| {}),
            on_error: Arc::new(|_: &TransportError| {}),
            on_must_refetch: Arc::new(|_: &Transaction<'_>| Ok(())),
        }
    }
}

impl fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCallbacks").finish_non_exhaustive()
    }
}

/// Everything needed to start replicating one shape into a local table.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub shape_key: ShapeKey,
    pub table: String,
    pub where_clause: Option<String>,
    /// Projection in request order; `None` replicates every column.
    pub columns: Option<Vec<String>>,
    pub primary_key: Vec<String>,
    /// Database the rows are written to.
    pub db: ReplicaDb,
    pub callbacks: SubscriptionCallbacks,
}

/// Signals published by a running stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    UpToDate,
    /// A batch of this many row changes was applied.
    Changes(usize),
    MustRefetch,
    Error(String),
}

/// A live subscription.
pub trait ShapeStream: Send + Sync {
    /// Whether the local table currently reflects the server.
    fn is_up_to_date(&self) -> bool;

    /// Opaque server-side handle of the shape, once known.
    fn shape_handle(&self) -> Option<String>;

    /// Subscribe to in-band signals.
    fn events(&self) -> broadcast::Receiver<StreamEvent>;

    /// Stop replicating. Calling twice is a no-op.
    fn unsubscribe(&self);
}

/// Starts shape streams.
#[async_trait]
pub trait ShapeSubscriber: Send + Sync {
    /// Start replicating a shape.
    ///
    /// Fails with [`TransportError::AlreadySubscribing`] while another
    /// subscription for the same shape key is active.
    async fn subscribe(
        &self,
        config: SubscriptionConfig,
    ) -> Result<Arc<dyn ShapeStream>, TransportError>;
}
