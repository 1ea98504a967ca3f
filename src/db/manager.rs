//! Identity-scoped database lifecycle.
//!
//! A [`DatabaseManager`] holds at most one open [`Session`]. Acquiring for a new
//! identity tears the previous session down before the new database is opened,
//! and concurrent callers share a single in-flight acquisition.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::connection::ReplicaDb;
use super::error::{DatabaseError, DbResult};
use super::naming::{DatabaseName, DatabaseNaming, IdentityId};
use super::storage::StorageBackend;
use crate::schema::SchemaRegistry;
use crate::shape::ShapeRegistry;

type AcquireFuture = Shared<BoxFuture<'static, DbResult<Arc<Session>>>>;
type ReleaseFuture = Shared<BoxFuture<'static, CleanupOutcome>>;

/// An open database bound to one identity, with its shape cache.
#[derive(Debug)]
pub struct Session {
    identity: IdentityId,
    name: DatabaseName,
    db: ReplicaDb,
    shapes: Arc<ShapeRegistry>,
    schema: Arc<SchemaRegistry>,
}

impl Session {
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    pub fn db(&self) -> &ReplicaDb {
        &self.db
    }

    /// Shape handles established against this session.
    pub fn shapes(&self) -> &Arc<ShapeRegistry> {
        &self.shapes
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Whether release or an identity switch has closed this session.
    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}

/// What a best-effort teardown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Database that was torn down, if any was open.
    pub database: Option<String>,
    pub identity: Option<String>,
    pub shapes_unsubscribed: usize,
    pub closed: bool,
    pub deleted: bool,
    /// Failures encountered along the way. Teardown continues past them.
    pub errors: Vec<String>,
}

impl CleanupOutcome {
    /// Nothing was open.
    pub fn is_noop(&self) -> bool {
        self.database.is_none()
    }

    /// Every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn log(&self) {
        let Some(database) = &self.database else {
            debug!("release: no database open");
            return;
        };
        if self.is_clean() {
            info!(
                database = %database,
                shapes = self.shapes_unsubscribed,
                "released database"
            );
        } else {
            warn!(
                database = %database,
                shapes = self.shapes_unsubscribed,
                closed = self.closed,
                deleted = self.deleted,
                errors = ?self.errors,
                "released database with errors"
            );
        }
    }
}

/// The one acquisition or release currently running.
enum InFlight {
    Acquire {
        identity: IdentityId,
        future: AcquireFuture,
    },
    Release(ReleaseFuture),
}

impl InFlight {
    /// Resolves once the operation settles, whatever its result.
    fn settled(&self) -> BoxFuture<'static, ()> {
        match self {
            Self::Acquire { future, .. } => future.clone().map(|_| ()).boxed(),
            Self::Release(future) => future.clone().map(|_| ()).boxed(),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    active: Option<Arc<Session>>,
    in_flight: Option<InFlight>,
}

struct ManagerInner {
    storage: Arc<dyn StorageBackend>,
    naming: DatabaseNaming,
    schema: Arc<SchemaRegistry>,
    state: Mutex<ManagerState>,
}

enum Step {
    Join(IdentityId, AcquireFuture),
    Wait(BoxFuture<'static, ()>),
    Started(AcquireFuture),
}

enum ReleaseStep {
    Wait(BoxFuture<'static, ()>),
    Started(ReleaseFuture),
}

/// Owns the single open database for the current identity.
#[derive(Clone)]
pub struct DatabaseManager {
    inner: Arc<ManagerInner>,
}

impl DatabaseManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        naming: DatabaseNaming,
        schema: SchemaRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                storage,
                naming,
                schema: Arc::new(schema),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn naming(&self) -> &DatabaseNaming {
        &self.inner.naming
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.inner.schema
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.storage
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the session for `identity`, opening it if needed.
    ///
    /// A session open for another identity is torn down first. Callers that
    /// arrive while an acquisition is running wait for it; if it was for a
    /// different identity they then start their own.
    pub async fn acquire(&self, identity: &IdentityId) -> DbResult<Arc<Session>> {
        loop {
            let step = {
                let mut state = self.state();
                if let Some(in_flight) = &state.in_flight {
                    match in_flight {
                        InFlight::Acquire { identity, future } => {
                            Step::Join(identity.clone(), future.clone())
                        }
                        InFlight::Release(_) => Step::Wait(in_flight.settled()),
                    }
                } else if let Some(active) = state
                    .active
                    .as_ref()
                    .filter(|session| session.identity() == identity)
                {
                    return Ok(active.clone());
                } else {
                    let future = self.clone().provision(identity.clone()).boxed().shared();
                    // Finishes even if every caller goes away.
                    tokio::spawn(future.clone().map(|_| ()));
                    state.in_flight = Some(InFlight::Acquire {
                        identity: identity.clone(),
                        future: future.clone(),
                    });
                    Step::Started(future)
                }
            };

            match step {
                Step::Started(future) => return future.await,
                Step::Wait(settled) => settled.await,
                Step::Join(joined, future) => {
                    let result = future.await;
                    if joined == *identity {
                        return result;
                    }
                    debug!(
                        identity = %identity,
                        previous = %joined,
                        "waited for acquisition of another identity"
                    );
                }
            }
        }
    }

    async fn provision(self, identity: IdentityId) -> DbResult<Arc<Session>> {
        // The slot is cleared below, once the previous store is gone.
        let previous = self.state().active.clone();
        if let Some(previous) = previous {
            info!(
                from = %previous.identity(),
                to = %identity,
                "switching identity"
            );
            self.teardown(&previous).log();
        }

        let result = self.open_session(&identity);
        if result.is_ok() {
            self.purge_stale(&identity);
        }

        let mut state = self.state();
        state.in_flight = None;
        match result {
            Ok(session) => {
                state.active = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                state.active = None;
                warn!(identity = %identity, error = %e, "failed to open database");
                Err(e)
            }
        }
    }

    fn open_session(&self, identity: &IdentityId) -> DbResult<Arc<Session>> {
        let name = self.inner.naming.name_for(identity);
        let conn = self.inner.storage.open(name.as_str())?;
        let db = ReplicaDb::new(name.as_str(), conn);

        if let Err(e) = db.with_conn(|conn| Ok(self.inner.schema.register(conn)?)) {
            let _ = db.close();
            return Err(e);
        }

        info!(identity = %identity, database = %name, "opened database");
        Ok(Arc::new(Session {
            identity: identity.clone(),
            name,
            db,
            shapes: ShapeRegistry::new(),
            schema: self.inner.schema.clone(),
        }))
    }

    /// Delete every owned database that does not belong to `identity`.
    fn purge_stale(&self, identity: &IdentityId) {
        let stored = match self.inner.storage.list() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "failed to list stored databases");
                return;
            }
        };

        let stale = self
            .inner
            .naming
            .stale(identity, stored.iter().map(String::as_str));
        for name in stale {
            match self.inner.storage.delete(&name) {
                Ok(()) => info!(database = %name, "deleted stale database"),
                Err(e) => warn!(database = %name, error = %e, "failed to delete stale database"),
            }
        }
    }

    /// Unsubscribe shapes, close, then delete the store.
    fn teardown(&self, session: &Session) -> CleanupOutcome {
        let mut outcome = CleanupOutcome {
            database: Some(session.name().to_string()),
            identity: Some(session.identity().to_string()),
            shapes_unsubscribed: session.shapes().close(),
            ..CleanupOutcome::default()
        };

        match session.db().close() {
            Ok(()) => outcome.closed = true,
            Err(e) => outcome.errors.push(format!("close: {e}")),
        }

        match self.inner.storage.delete(session.name().as_str()) {
            Ok(()) => outcome.deleted = true,
            Err(e) => outcome.errors.push(format!("delete: {e}")),
        }

        outcome
    }

    /// Tear down the open session, if any.
    ///
    /// Waits for a running acquisition first so its result is torn down too.
    /// The teardown itself runs as the in-flight operation: acquisitions that
    /// arrive meanwhile wait for it, and the slot is cleared only after the
    /// store is deleted. Never fails; problems are reported in the outcome.
    pub async fn release(&self) -> CleanupOutcome {
        loop {
            let step = {
                let mut state = self.state();
                let running = state.in_flight.as_ref().map(InFlight::settled);
                match (running, state.active.clone()) {
                    (Some(settled), _) => ReleaseStep::Wait(settled),
                    (None, None) => return CleanupOutcome::default(),
                    (None, Some(session)) => {
                        let future = self.clone().finish_release(session).boxed().shared();
                        // Finishes even if the caller goes away.
                        tokio::spawn(future.clone().map(|_| ()));
                        state.in_flight = Some(InFlight::Release(future.clone()));
                        ReleaseStep::Started(future)
                    }
                }
            };

            match step {
                ReleaseStep::Started(future) => return future.await,
                ReleaseStep::Wait(settled) => settled.await,
            }
        }
    }

    async fn finish_release(self, session: Arc<Session>) -> CleanupOutcome {
        let outcome = self.teardown(&session);

        let mut state = self.state();
        if state
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &session))
        {
            state.active = None;
        }
        state.in_flight = None;
        outcome
    }

    /// The open session, if any.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.state().active.clone()
    }

    /// Wait for a running acquisition or release, then return the open session.
    pub async fn settled(&self) -> Option<Arc<Session>> {
        loop {
            let running = self.state().in_flight.as_ref().map(InFlight::settled);
            match running {
                Some(settled) => settled.await,
                None => return self.current(),
            }
        }
    }

    pub fn is_open_for(&self, identity: &IdentityId) -> bool {
        self.state()
            .active
            .as_ref()
            .is_some_and(|session| session.identity() == identity)
    }

    /// Open session, or [`DatabaseError::NotOpen`].
    pub fn require(&self) -> DbResult<Arc<Session>> {
        self.current().ok_or(DatabaseError::NotOpen)
    }
}
