//! Client facade: the one object applications hold.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::config::{Settings, SettingsError};
use crate::db::{
    CleanupOutcome, DatabaseError, DatabaseManager, DatabaseNaming, FileStorage, IdentityId,
    ReplicaDb, Session, StorageBackend,
};
use crate::remote::HttpShapeSubscriber;
use crate::schema::SchemaRegistry;
use crate::shape::{
    CoordinatorOptions, ShapeCoordinator, ShapeDescriptor, ShapeError, ShapeHandle,
    ShapeSubscriber,
};

/// Errors surfaced by [`SyncClient`].
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("no identity has been initialized")]
    NotInitialized,

    #[error("a global sync client is already installed")]
    GlobalAlreadyInstalled,
}

pub type SyncResult<T> = Result<T, SyncError>;

static GLOBAL: OnceCell<SyncClient> = OnceCell::new();

/// Active replica database plus shape subscriptions for the current identity.
#[derive(Clone)]
pub struct SyncClient {
    manager: DatabaseManager,
    coordinator: ShapeCoordinator,
}

impl SyncClient {
    pub fn new(manager: DatabaseManager, coordinator: ShapeCoordinator) -> Self {
        Self {
            manager,
            coordinator,
        }
    }

    /// Wire a client from settings with the given storage and subscriber.
    pub fn with_parts(
        settings: &Settings,
        storage: Arc<dyn StorageBackend>,
        subscriber: Arc<dyn ShapeSubscriber>,
    ) -> Self {
        let naming = DatabaseNaming::new(
            settings.storage.prefix.clone(),
            settings.storage.schema_version,
        );
        let schema = SchemaRegistry::new(settings.storage.schema_version);
        Self::new(
            DatabaseManager::new(storage, naming, schema),
            ShapeCoordinator::new(subscriber, CoordinatorOptions::from_settings(settings)),
        )
    }

    /// File-backed storage and the HTTP shape engine.
    pub fn from_settings(settings: &Settings) -> SyncResult<Self> {
        settings.validate()?;
        let storage = FileStorage::new(settings.storage.resolved_directory()?);
        let subscriber = HttpShapeSubscriber::from_settings(settings)?;
        Ok(Self::with_parts(
            settings,
            Arc::new(storage),
            Arc::new(subscriber),
        ))
    }

    pub fn manager(&self) -> &DatabaseManager {
        &self.manager
    }

    pub fn coordinator(&self) -> &ShapeCoordinator {
        &self.coordinator
    }

    /// Open (or return) the database for `identity`.
    pub async fn initialize(&self, identity: &str) -> SyncResult<Arc<Session>> {
        let identity = IdentityId::new(identity)?;
        Ok(self.manager.acquire(&identity).await?)
    }

    /// Current session, after any running acquisition or release settles.
    pub async fn session(&self) -> SyncResult<Arc<Session>> {
        self.manager.settled().await.ok_or(SyncError::NotInitialized)
    }

    /// Active database. Waits out an identity switch in progress.
    pub async fn database(&self) -> SyncResult<ReplicaDb> {
        Ok(self.session().await?.db().clone())
    }

    /// Subscribe to a shape in the current session.
    pub async fn sync_shape(&self, descriptor: ShapeDescriptor) -> SyncResult<Arc<ShapeHandle>> {
        let session = self.session().await?;
        Ok(self.coordinator.sync_shape(&session, &descriptor).await?)
    }

    pub fn is_initialized_for(&self, identity: &str) -> bool {
        IdentityId::new(identity).is_ok_and(|id| self.manager.is_open_for(&id))
    }

    pub fn current_identity(&self) -> Option<IdentityId> {
        self.manager
            .current()
            .map(|session| session.identity().clone())
    }

    /// Tear everything down. Never fails; the outcome is logged and returned.
    pub async fn release(&self) -> CleanupOutcome {
        let outcome = self.manager.release().await;
        outcome.log();
        outcome
    }
}

/// Install the process-wide client.
pub fn install_global(client: SyncClient) -> SyncResult<&'static SyncClient> {
    GLOBAL
        .set(client)
        .map_err(|_| SyncError::GlobalAlreadyInstalled)?;
    GLOBAL.get().ok_or(SyncError::NotInitialized)
}

/// The process-wide client, if installed.
pub fn global() -> Option<&'static SyncClient> {
    GLOBAL.get()
}
