//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use shapesync::db::{
    DatabaseError, DatabaseManager, DatabaseNaming, MemoryStorage, ReplicaDb, StorageBackend,
};
use shapesync::remote::{apply_changes, parse_messages, prepare_changes, Message};
use shapesync::schema::SchemaRegistry;
use shapesync::shape::{
    CoordinatorOptions, ReadinessTiming, ShapeCoordinator, ShapeStream, ShapeSubscriber,
    StreamEvent, SubscriptionConfig, TransportError,
};
use shapesync::SyncClient;

/// How new fake streams behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Caught up as soon as the subscription is created.
    UpToDate,
    /// Never catches up on its own.
    Lagging,
    /// Subscribing fails with a rejected request.
    Reject,
}

pub struct FakeStream {
    handle: String,
    up_to_date: AtomicBool,
    unsubscribed: AtomicBool,
    events: broadcast::Sender<StreamEvent>,
}

impl FakeStream {
    fn new(handle: String, up_to_date: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            handle,
            up_to_date: AtomicBool::new(up_to_date),
            unsubscribed: AtomicBool::new(false),
            events,
        })
    }

    /// Flip the flag and announce it in-band.
    pub fn catch_up(&self) {
        self.up_to_date.store(true, Ordering::SeqCst);
        let _ = self.events.send(StreamEvent::UpToDate);
    }

    /// Flip the flag without any event, so only polling can notice.
    pub fn catch_up_silently(&self) {
        self.up_to_date.store(true, Ordering::SeqCst);
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

impl ShapeStream for FakeStream {
    fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    fn shape_handle(&self) -> Option<String> {
        Some(self.handle.clone())
    }

    fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn unsubscribe(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
    }
}

/// Records every subscription and hands out [`FakeStream`]s.
pub struct FakeSubscriber {
    behavior: Mutex<Behavior>,
    delay: Option<Duration>,
    contended: AtomicUsize,
    calls: AtomicUsize,
    configs: Mutex<Vec<SubscriptionConfig>>,
    streams: Mutex<Vec<Arc<FakeStream>>>,
}

impl FakeSubscriber {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: None,
            contended: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            configs: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every subscribe call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer the next `n` subscribe calls with `AlreadySubscribing`.
    pub fn with_contention(self, n: usize) -> Self {
        self.contended.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Every subscribe call, including contended and rejected ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn configs(&self) -> Vec<SubscriptionConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn last_config(&self) -> SubscriptionConfig {
        self.configs().pop().expect("no subscription was created")
    }

    pub fn streams(&self) -> Vec<Arc<FakeStream>> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShapeSubscriber for FakeSubscriber {
    async fn subscribe(
        &self,
        config: SubscriptionConfig,
    ) -> Result<Arc<dyn ShapeStream>, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let contended = self
            .contended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if contended {
            return Err(TransportError::AlreadySubscribing(config.shape_key.to_string()));
        }

        let behavior = *self.behavior.lock().unwrap();
        if behavior == Behavior::Reject {
            return Err(TransportError::Rejected {
                status: 400,
                body: "invalid where clause".to_string(),
            });
        }

        let stream = FakeStream::new(format!("handle-{call}"), behavior == Behavior::UpToDate);
        if behavior == Behavior::UpToDate {
            (config.callbacks.on_initial_sync)();
        }
        self.configs.lock().unwrap().push(config);
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

pub fn options(timeout: Duration, poll_interval: Duration, backoff: Duration) -> CoordinatorOptions {
    CoordinatorOptions {
        readiness: ReadinessTiming {
            timeout,
            poll_interval,
        },
        contention_backoff: backoff,
    }
}

pub fn fast_options() -> CoordinatorOptions {
    options(
        Duration::from_millis(500),
        Duration::from_millis(10),
        Duration::from_millis(20),
    )
}

pub fn manager_with(storage: Arc<dyn StorageBackend>) -> DatabaseManager {
    DatabaseManager::new(
        storage,
        DatabaseNaming::new("shapesync", 1),
        SchemaRegistry::default(),
    )
}

/// Client over in-memory storage.
pub fn client_with(subscriber: Arc<FakeSubscriber>, options: CoordinatorOptions) -> SyncClient {
    SyncClient::new(
        manager_with(Arc::new(MemoryStorage::new())),
        ShapeCoordinator::new(subscriber, options),
    )
}

pub fn insert_document(db: &ReplicaDb, id: i64, search_space_id: i64, title: &str) {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO documents (id, search_space_id, title, document_type, created_at)
             VALUES (?1, ?2, ?3, 'FILE', '2024-01-01T00:00:00Z')",
            rusqlite::params![id, search_space_id, title],
        )?;
        Ok(())
    })
    .unwrap();
}

pub fn document_ids(db: &ReplicaDb) -> Vec<i64> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT id FROM documents ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    })
    .unwrap()
}

pub fn document_title(db: &ReplicaDb, id: i64) -> Option<String> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT title FROM documents WHERE id = ?")?;
        let mut rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    })
    .unwrap()
}

/// Run a forced resync the way a sync engine does: the shape's refetch
/// callback and the new snapshot in one transaction.
pub fn trigger_must_refetch(config: &SubscriptionConfig, snapshot: &str) -> Result<usize, DatabaseError> {
    let changes: Vec<_> = parse_messages(snapshot)
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            Message::Change(change) => Some(change),
            Message::Control { .. } => None,
        })
        .collect();
    let prepared = prepare_changes(&changes, &config.primary_key).unwrap();

    config.db.transaction(|tx| {
        (config.callbacks.on_must_refetch)(tx)?;
        apply_changes(tx, &config.table, &config.primary_key, &prepared)
    })
}
