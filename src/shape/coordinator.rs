//! Deduplicated shape establishment.

use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use rusqlite::Transaction;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::descriptor::{NormalizedShape, ShapeDescriptor, ShapeKey};
use super::error::{ShapeError, ShapeResult, TransportError};
use super::handle::ShapeHandle;
use super::readiness::{
    drive_readiness, ReadinessEvent, ReadinessPhase, ReadinessTiming, ReadinessTracker,
};
use super::registry::{Lookup, ShapeRegistry};
use super::subscriber::{
    MustRefetchFn, ShapeStream, ShapeSubscriber, SubscriptionCallbacks, SubscriptionConfig,
};
use crate::config::Settings;
use crate::db::{ReplicaDb, Session};
use crate::schema::{quote_ident, TableSchema};

/// Timers used while establishing shapes.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub readiness: ReadinessTiming,
    /// Wait before retrying a contended subscription.
    pub contention_backoff: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            readiness: ReadinessTiming {
                timeout: Duration::from_millis(5000),
                poll_interval: Duration::from_millis(100),
            },
            contention_backoff: Duration::from_millis(100),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            readiness: ReadinessTiming {
                timeout: settings.readiness.timeout(),
                poll_interval: settings.readiness.poll_interval(),
            },
            contention_backoff: settings.contention.backoff(),
        }
    }
}

/// Hands out one [`ShapeHandle`] per equivalent shape and session.
#[derive(Clone)]
pub struct ShapeCoordinator {
    subscriber: Arc<dyn ShapeSubscriber>,
    options: CoordinatorOptions,
}

impl ShapeCoordinator {
    pub fn new(subscriber: Arc<dyn ShapeSubscriber>, options: CoordinatorOptions) -> Self {
        Self {
            subscriber,
            options,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Return the handle for `descriptor` in `session`, establishing it once.
    ///
    /// Concurrent calls for equivalent descriptors share one attempt. A failed
    /// attempt is not cached, so the next call tries again.
    pub async fn sync_shape(
        &self,
        session: &Session,
        descriptor: &ShapeDescriptor,
    ) -> ShapeResult<Arc<ShapeHandle>> {
        let shape = descriptor.normalize()?;
        let table = session
            .schema()
            .table(&shape.table)
            .ok_or_else(|| ShapeError::UnknownTable(shape.table.clone()))?;
        validate_projection(table, shape.columns.as_deref())?;

        let registry = session.shapes().clone();
        let key = shape.cache_key.clone();

        let lookup = registry.lookup_or_start(&key, || {
            let attempt = Attempt {
                subscriber: self.subscriber.clone(),
                registry: registry.clone(),
                options: self.options,
                shape_key: shape.shape_key(session.identity(), session.schema().version()),
                primary_key: table.primary_key.clone(),
                db: session.db().clone(),
                shape,
            };
            let future = attempt.settle().boxed().shared();
            tokio::spawn(future.clone().map(|_| ()));
            future
        });

        match lookup {
            Lookup::Ready(handle) => Ok(handle),
            Lookup::Pending(future) => future.await,
            Lookup::Closed => Err(ShapeError::SessionClosed),
        }
    }
}

fn validate_projection(table: &TableSchema, columns: Option<&[String]>) -> ShapeResult<()> {
    let Some(columns) = columns else {
        return Ok(());
    };
    if let Some(unknown) = columns.iter().find(|c| !table.has_column(c)) {
        return Err(ShapeError::InvalidColumn {
            table: table.name.clone(),
            column: unknown.clone(),
        });
    }
    if let Some(missing) = table
        .primary_key
        .iter()
        .find(|pk| !columns.iter().any(|c| c == *pk))
    {
        return Err(ShapeError::MissingPrimaryKey {
            table: table.name.clone(),
            column: missing.clone(),
        });
    }
    Ok(())
}

/// Rows a forced resync must remove before the new snapshot lands.
fn refetch_cleanup(table: &str, filter: Option<&str>, shape_key: ShapeKey) -> MustRefetchFn {
    let sql = match filter {
        Some(filter) => format!("DELETE FROM {} WHERE {filter}", quote_ident(table)),
        None => format!("DELETE FROM {}", quote_ident(table)),
    };
    Arc::new(move |tx: &Transaction<'_>| {
        let deleted = tx.execute(&sql, [])?;
        info!(shape_key = %shape_key, deleted, "cleared rows for refetch");
        Ok(())
    })
}

/// One establishment attempt for a cache key.
struct Attempt {
    subscriber: Arc<dyn ShapeSubscriber>,
    registry: Arc<ShapeRegistry>,
    options: CoordinatorOptions,
    shape: NormalizedShape,
    shape_key: ShapeKey,
    primary_key: Vec<String>,
    db: ReplicaDb,
}

impl Attempt {
    /// Establish, then do the registry bookkeeping.
    async fn settle(self) -> ShapeResult<Arc<ShapeHandle>> {
        let registry = self.registry.clone();
        let key = self.shape.cache_key.clone();
        let result = self.establish().await;

        match registry.complete(&key, &result) {
            Ok(()) => result,
            Err(e) => {
                if let Ok(handle) = &result {
                    handle.unsubscribe();
                }
                Err(e)
            }
        }
    }

    async fn establish(self) -> ShapeResult<Arc<ShapeHandle>> {
        if self.shape.repaired {
            warn!(
                table = %self.shape.table,
                filter = ?self.shape.filter,
                "closed unterminated string literal in shape filter"
            );
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = self.config(events_tx);

        let stream = match self.subscriber.subscribe(config.clone()).await {
            Ok(stream) => stream,
            Err(TransportError::AlreadySubscribing(_)) => {
                debug!(
                    shape_key = %self.shape_key,
                    backoff_ms = self.options.contention_backoff.as_millis() as u64,
                    "shape contended, retrying"
                );
                tokio::time::sleep(self.options.contention_backoff).await;

                if let Some(existing) = self.registry.get(&self.shape.cache_key) {
                    return Ok(existing);
                }

                match self.subscriber.subscribe(config).await {
                    Ok(stream) => stream,
                    Err(TransportError::AlreadySubscribing(_)) => {
                        warn!(
                            shape_key = %self.shape_key,
                            "shape still contended, returning placeholder handle"
                        );
                        return Ok(ShapeHandle::placeholder(
                            self.shape.cache_key,
                            self.shape_key,
                            self.shape.table,
                        ));
                    }
                    Err(source) => return Err(self.establish_error(source)),
                }
            }
            Err(source) => return Err(self.establish_error(source)),
        };

        Ok(self.start(stream, events_rx))
    }

    fn start(
        self,
        stream: Arc<dyn ShapeStream>,
        events_rx: mpsc::UnboundedReceiver<ReadinessEvent>,
    ) -> Arc<ShapeHandle> {
        let tracker = Arc::new(ReadinessTracker::new(ReadinessPhase::Establishing));
        let handle = ShapeHandle::live(
            self.shape.cache_key,
            self.shape_key,
            self.shape.table,
            stream.clone(),
            tracker.clone(),
            &self.registry,
        );
        let driver = tokio::spawn(drive_readiness(
            tracker,
            stream,
            events_rx,
            self.options.readiness,
        ));
        handle.attach_driver(driver);

        info!(
            shape_key = %handle.shape_key(),
            table = %handle.table(),
            "established shape subscription"
        );
        handle
    }

    fn config(&self, events: mpsc::UnboundedSender<ReadinessEvent>) -> SubscriptionConfig {
        let initial_sync_tx = events.clone();
        let shape_key = self.shape_key.clone();
        let callbacks = SubscriptionCallbacks {
            on_initial_sync: Arc::new(move || {
                let _ = initial_sync_tx.send(ReadinessEvent::InitialSyncCallback);
            }),
            on_error: Arc::new(move |error: &TransportError| {
                warn!(shape_key = %shape_key, error = %error, "shape stream error");
                let _ = events.send(ReadinessEvent::Error(error.to_string()));
            }),
            on_must_refetch: refetch_cleanup(
                &self.shape.table,
                self.shape.filter.as_deref(),
                self.shape_key.clone(),
            ),
        };

        SubscriptionConfig {
            shape_key: self.shape_key.clone(),
            table: self.shape.table.clone(),
            where_clause: self.shape.filter.clone(),
            columns: self.shape.columns.clone(),
            primary_key: self.primary_key.clone(),
            db: self.db.clone(),
            callbacks,
        }
    }

    fn establish_error(&self, source: TransportError) -> ShapeError {
        warn!(
            shape_key = %self.shape_key,
            error = %source,
            "failed to establish shape subscription"
        );
        ShapeError::Establish {
            table: self.shape.table.clone(),
            source,
        }
    }
}
