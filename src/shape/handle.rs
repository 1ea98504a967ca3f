//! Handles returned by `sync_shape`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::descriptor::{CacheKey, ShapeKey};
use super::error::{ShapeError, ShapeResult};
use super::readiness::{ReadinessEvent, ReadinessPhase, ReadinessTracker};
use super::registry::ShapeRegistry;
use super::subscriber::ShapeStream;

/// A shared subscription to one shape.
///
/// Every caller asking for an equivalent shape in the same session receives the
/// same `Arc<ShapeHandle>`.
pub struct ShapeHandle {
    id: Uuid,
    cache_key: CacheKey,
    shape_key: ShapeKey,
    table: String,
    stream: Option<Arc<dyn ShapeStream>>,
    readiness: Arc<ReadinessTracker>,
    registry: Weak<ShapeRegistry>,
    driver: Mutex<Option<JoinHandle<()>>>,
    unsubscribed: AtomicBool,
}

impl ShapeHandle {
    pub(crate) fn live(
        cache_key: CacheKey,
        shape_key: ShapeKey,
        table: String,
        stream: Arc<dyn ShapeStream>,
        readiness: Arc<ReadinessTracker>,
        registry: &Arc<ShapeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            cache_key,
            shape_key,
            table,
            stream: Some(stream),
            readiness,
            registry: Arc::downgrade(registry),
            driver: Mutex::new(None),
            unsubscribed: AtomicBool::new(false),
        })
    }

    /// A handle with no stream behind it, used when the shape stayed contended.
    pub(crate) fn placeholder(
        cache_key: CacheKey,
        shape_key: ShapeKey,
        table: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            cache_key,
            shape_key,
            table,
            stream: None,
            readiness: Arc::new(ReadinessTracker::new(ReadinessPhase::Contended)),
            registry: Weak::new(),
            driver: Mutex::new(None),
            unsubscribed: AtomicBool::new(false),
        })
    }

    pub(crate) fn attach_driver(&self, driver: JoinHandle<()>) {
        *self.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(driver);
        if self.is_unsubscribed() {
            let driver = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(driver) = driver {
                driver.abort();
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn shape_key(&self) -> &ShapeKey {
        &self.shape_key
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Stream flag, read on every call. Placeholders are never up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_up_to_date())
    }

    /// Server-side handle of the shape stream.
    pub fn stream_handle(&self) -> Option<String> {
        self.stream.as_ref().and_then(|s| s.shape_handle())
    }

    pub fn is_placeholder(&self) -> bool {
        self.stream.is_none()
    }

    pub fn readiness(&self) -> ReadinessPhase {
        self.readiness.phase()
    }

    /// Wait until the initial sync settles.
    ///
    /// Resolves with the settled phase. A timed-out or contended shape still
    /// resolves `Ok`; only a stream failure before catching up is an error.
    pub async fn initial_sync(&self) -> ShapeResult<ReadinessPhase> {
        let mut rx = self.readiness.subscribe();
        let phase = match rx.wait_for(ReadinessPhase::is_settled).await {
            Ok(phase) => phase.clone(),
            Err(_) => self.readiness.phase(),
        };

        match phase {
            ReadinessPhase::Failed(message) => Err(ShapeError::InitialSync {
                shape_key: self.shape_key.to_string(),
                message,
            }),
            other => Ok(other),
        }
    }

    /// Stop the stream and drop the handle from its session cache.
    ///
    /// Calling twice is a no-op.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.cache_key, self.id);
        }
        if let Some(stream) = &self.stream {
            stream.unsubscribe();
        }
        let driver = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.readiness.apply(ReadinessEvent::Cancelled);

        debug!(shape_key = %self.shape_key, table = %self.table, "unsubscribed shape");
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeHandle")
            .field("id", &self.id)
            .field("shape_key", &self.shape_key)
            .field("table", &self.table)
            .field("placeholder", &self.is_placeholder())
            .field("readiness", &self.readiness())
            .finish()
    }
}
