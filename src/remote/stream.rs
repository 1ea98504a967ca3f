//! A running HTTP shape stream.
//!
//! # Lifecycle
//!
//! ```text
//! catch-up (offset from last position, or -1) ──up-to-date──▶ live long-poll
//!        ▲                                                          │
//!        └──────────── must-refetch (409 / control) ◀───────────────┘
//!                      offset -1, buffer snapshot until up-to-date,
//!                      then one transaction: refetch callback + snapshot
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::apply::{apply_changes, prepare_changes, save_position, RowChange, StreamPosition};
use super::client::{FetchOutcome, ShapeClient};
use super::protocol::{ShapeRequest, ShapeResponse, INITIAL_OFFSET};
use crate::shape::{ShapeStream, StreamEvent, SubscriptionConfig, TransportError};

const EVENT_CAPACITY: usize = 64;

/// Delays between retries of transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Where the stream is and what it is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub handle: Option<String>,
    pub offset: String,
    pub cursor: Option<String>,
    pub up_to_date: bool,
    /// Snapshot rows held back during a refetch.
    pub refetch: Option<Vec<RowChange>>,
}

impl SyncCursor {
    pub fn new(position: Option<StreamPosition>) -> Self {
        let (handle, offset) = match position {
            Some(position) => (position.handle, position.offset),
            None => (None, INITIAL_OFFSET.to_string()),
        };
        Self {
            handle,
            offset,
            cursor: None,
            up_to_date: false,
            refetch: None,
        }
    }

    pub fn request<'a>(&'a self, config: &'a SubscriptionConfig) -> ShapeRequest<'a> {
        ShapeRequest {
            table: &config.table,
            where_clause: config.where_clause.as_deref(),
            columns: config.columns.as_deref(),
            handle: self.handle.as_deref(),
            offset: &self.offset,
            live: self.up_to_date,
            cursor: self.cursor.as_deref(),
        }
    }

    /// Start over from a fresh snapshot.
    pub fn reset(&mut self, handle: Option<String>) {
        self.handle = handle;
        self.offset = INITIAL_OFFSET.to_string();
        self.cursor = None;
        self.up_to_date = false;
        self.refetch = Some(Vec::new());
    }

    /// Take the new stream position from response headers.
    pub fn advance(&mut self, response: &ShapeResponse) {
        if let Some(handle) = &response.handle {
            self.handle = Some(handle.clone());
        }
        if let Some(offset) = &response.offset {
            self.offset = offset.clone();
        }
        if let Some(cursor) = &response.cursor {
            self.cursor = Some(cursor.clone());
        }
    }

    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            handle: self.handle.clone(),
            offset: self.offset.clone(),
        }
    }
}

/// State shared between the stream handle and its task.
pub(crate) struct StreamShared {
    shape_key: String,
    up_to_date: AtomicBool,
    handle: Mutex<Option<String>>,
    events: broadcast::Sender<StreamEvent>,
    stopped: AtomicBool,
    active: Arc<DashSet<String>>,
}

impl StreamShared {
    pub fn new(shape_key: String, active: Arc<DashSet<String>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            shape_key,
            up_to_date: AtomicBool::new(false),
            handle: Mutex::new(None),
            events,
            stopped: AtomicBool::new(false),
            active,
        })
    }

    fn publish(&self, event: StreamEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_handle(&self, handle: Option<String>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark stopped and release the shape key. Returns false if already stopped.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.active.remove(&self.shape_key);
        true
    }
}

/// The replication loop for one shape.
pub(crate) struct ShapeSync {
    client: ShapeClient,
    config: SubscriptionConfig,
    cursor: SyncCursor,
    shared: Arc<StreamShared>,
    retry: RetryPolicy,
    initial_sync_reported: bool,
}

impl ShapeSync {
    pub fn new(
        client: ShapeClient,
        config: SubscriptionConfig,
        position: Option<StreamPosition>,
        shared: Arc<StreamShared>,
        retry: RetryPolicy,
    ) -> Self {
        let cursor = SyncCursor::new(position);
        shared.set_handle(cursor.handle.clone());
        Self {
            client,
            config,
            cursor,
            shared,
            retry,
            initial_sync_reported: false,
        }
    }

    /// Issue one request and apply its outcome.
    pub async fn step(&mut self) -> Result<(), TransportError> {
        let outcome = {
            let request = self.cursor.request(&self.config);
            self.client.fetch(&request).await?
        };

        match outcome {
            FetchOutcome::MustRefetch { handle } => {
                self.begin_refetch(handle);
                Ok(())
            }
            FetchOutcome::Batch(response) => self.handle_batch(response),
        }
    }

    fn begin_refetch(&mut self, handle: Option<String>) {
        warn!(
            shape_key = %self.config.shape_key,
            handle = ?handle,
            "server requested refetch, resyncing shape"
        );
        self.cursor.reset(handle);
        self.shared.set_handle(self.cursor.handle.clone());
        self.shared.up_to_date.store(false, Ordering::SeqCst);
        self.shared.publish(StreamEvent::MustRefetch);
    }

    fn handle_batch(&mut self, response: ShapeResponse) -> Result<(), TransportError> {
        if response.must_refetch() {
            self.begin_refetch(response.handle.clone());
            return Ok(());
        }

        let up_to_date = response.is_up_to_date();
        self.cursor.advance(&response);
        self.shared.set_handle(self.cursor.handle.clone());
        let changes = prepare_changes(&response.into_changes(), &self.config.primary_key)?;

        let applied = match self.cursor.refetch.as_mut() {
            Some(buffer) => {
                buffer.extend(changes);
                if !up_to_date {
                    return Ok(());
                }
                self.commit_refetch()?
            }
            None => self.commit(&changes)?,
        };

        if applied > 0 {
            self.shared.publish(StreamEvent::Changes(applied));
        }
        if up_to_date {
            self.mark_up_to_date();
        }
        Ok(())
    }

    /// Apply a batch and record the new position in one transaction.
    fn commit(&self, changes: &[RowChange]) -> Result<usize, TransportError> {
        let position = self.cursor.position();
        let applied = self.config.db.transaction(|tx| {
            let applied = apply_changes(tx, &self.config.table, &self.config.primary_key, changes)?;
            save_position(tx, self.config.shape_key.as_str(), &position)?;
            Ok(applied)
        })?;
        Ok(applied)
    }

    /// Clear the shape's old rows and write the buffered snapshot atomically.
    fn commit_refetch(&mut self) -> Result<usize, TransportError> {
        let snapshot = self.cursor.refetch.take().unwrap_or_default();
        let position = self.cursor.position();
        let on_must_refetch = self.config.callbacks.on_must_refetch.clone();

        let applied = self.config.db.transaction(|tx| {
            on_must_refetch(tx)?;
            let applied =
                apply_changes(tx, &self.config.table, &self.config.primary_key, &snapshot)?;
            save_position(tx, self.config.shape_key.as_str(), &position)?;
            Ok(applied)
        })?;

        info!(
            shape_key = %self.config.shape_key,
            rows = applied,
            "refetched shape"
        );
        Ok(applied)
    }

    fn mark_up_to_date(&mut self) {
        self.cursor.up_to_date = true;
        if !self.shared.up_to_date.swap(true, Ordering::SeqCst) {
            debug!(shape_key = %self.config.shape_key, "shape up to date");
        }
        self.shared.publish(StreamEvent::UpToDate);
        if !self.initial_sync_reported {
            self.initial_sync_reported = true;
            (self.config.callbacks.on_initial_sync)();
        }
    }

    /// Keep replicating until stopped or a fatal error.
    pub async fn run(mut self) {
        let mut delay = self.retry.initial;
        while !self.shared.is_stopped() {
            match self.step().await {
                Ok(()) => delay = self.retry.initial,
                Err(e) if e.is_retriable() => {
                    warn!(
                        shape_key = %self.config.shape_key,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "shape request failed, retrying"
                    );
                    self.shared.publish(StreamEvent::Error(e.to_string()));
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next(delay);
                }
                Err(e) => {
                    error!(
                        shape_key = %self.config.shape_key,
                        error = %e,
                        "shape stream stopped"
                    );
                    self.shared.up_to_date.store(false, Ordering::SeqCst);
                    self.shared.publish(StreamEvent::Error(e.to_string()));
                    (self.config.callbacks.on_error)(&e);
                    return;
                }
            }
        }
    }
}

/// [`ShapeStream`] backed by a background [`ShapeSync`] task.
pub struct HttpShapeStream {
    shared: Arc<StreamShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpShapeStream {
    pub(crate) fn spawn(sync: ShapeSync) -> Self {
        let shared = sync.shared.clone();
        let task = tokio::spawn(sync.run());
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn shape_key(&self) -> &str {
        &self.shared.shape_key
    }
}

impl ShapeStream for HttpShapeStream {
    fn is_up_to_date(&self) -> bool {
        self.shared.up_to_date.load(Ordering::SeqCst)
    }

    fn shape_handle(&self) -> Option<String> {
        self.shared
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    fn unsubscribe(&self) {
        if !self.shared.stop() {
            return;
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        debug!(shape_key = %self.shared.shape_key, "stopped shape stream");
    }
}

impl Drop for HttpShapeStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
