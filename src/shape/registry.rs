//! Per-session cache of shape handles and pending establishment attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use uuid::Uuid;

use super::descriptor::CacheKey;
use super::error::{ShapeError, ShapeResult};
use super::handle::ShapeHandle;

pub(crate) type EstablishFuture = Shared<BoxFuture<'static, ShapeResult<Arc<ShapeHandle>>>>;

#[derive(Default)]
struct RegistryState {
    handles: HashMap<CacheKey, Arc<ShapeHandle>>,
    pending: HashMap<CacheKey, EstablishFuture>,
    closed: bool,
}

pub(crate) enum Lookup {
    Ready(Arc<ShapeHandle>),
    Pending(EstablishFuture),
    Closed,
}

/// Handles and pending attempts, keyed by [`CacheKey`].
///
/// At most one handle and one pending attempt exist per key.
#[derive(Default)]
pub struct ShapeRegistry {
    state: Mutex<RegistryState>,
}

impl ShapeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<ShapeHandle>> {
        self.state().handles.get(key).cloned()
    }

    /// Return the cached handle or pending attempt for `key`, or register the
    /// attempt built by `start` as pending. All under one lock acquisition.
    pub(crate) fn lookup_or_start(
        &self,
        key: &CacheKey,
        start: impl FnOnce() -> EstablishFuture,
    ) -> Lookup {
        let mut state = self.state();
        if state.closed {
            return Lookup::Closed;
        }
        if let Some(handle) = state.handles.get(key) {
            return Lookup::Ready(handle.clone());
        }
        if let Some(pending) = state.pending.get(key) {
            return Lookup::Pending(pending.clone());
        }
        let future = start();
        state.pending.insert(key.clone(), future.clone());
        Lookup::Pending(future)
    }

    /// Settle a pending attempt: drop the marker and cache a live handle.
    ///
    /// Fails with [`ShapeError::SessionClosed`] when the registry was closed in
    /// the meantime; the caller must then unsubscribe the handle.
    pub(crate) fn complete(
        &self,
        key: &CacheKey,
        result: &ShapeResult<Arc<ShapeHandle>>,
    ) -> ShapeResult<()> {
        let mut state = self.state();
        state.pending.remove(key);
        if state.closed {
            return Err(ShapeError::SessionClosed);
        }
        if let Ok(handle) = result {
            if !handle.is_placeholder() && !handle.is_unsubscribed() {
                state.handles.insert(key.clone(), handle.clone());
            }
        }
        Ok(())
    }

    /// Drop a handle from the cache if it is still the one stored under `key`.
    pub(crate) fn remove(&self, key: &CacheKey, id: Uuid) {
        let mut state = self.state();
        if state.handles.get(key).is_some_and(|h| h.id() == id) {
            state.handles.remove(key);
        }
    }

    /// Unsubscribe every cached handle and refuse new ones.
    ///
    /// Returns the number of handles unsubscribed.
    pub fn close(&self) -> usize {
        let handles: Vec<Arc<ShapeHandle>> = {
            let mut state = self.state();
            state.closed = true;
            state.handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.unsubscribe();
        }
        handles.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of attempts still being established.
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }
}

impl std::fmt::Debug for ShapeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ShapeRegistry")
            .field("handles", &state.handles.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}
