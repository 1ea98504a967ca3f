//! Shape subscriptions: deduplication, readiness and forced resync.
//!
//! # Flow
//!
//! ```text
//! sync_shape(descriptor)
//!   │ normalize ─▶ CacheKey
//!   ├─ cached handle?   ─▶ return it
//!   ├─ pending attempt? ─▶ await the shared attempt
//!   └─ establish
//!        ShapeSubscriber::subscribe(config + callbacks)
//!          AlreadySubscribing ─▶ backoff, re-check cache, retry once ─▶ placeholder
//!        spawn readiness driver (flag, callbacks, events, poll, deadline)
//!        cache handle, drop pending marker
//! ```

mod coordinator;
mod descriptor;
mod error;
mod handle;
mod readiness;
mod registry;
mod subscriber;

pub use coordinator::{CoordinatorOptions, ShapeCoordinator};
pub use descriptor::{
    is_identifier, normalize_filter, CacheKey, NormalizedShape, ShapeDescriptor, ShapeKey,
};
pub use error::{ShapeError, ShapeResult, TransportError};
pub use handle::ShapeHandle;
pub use readiness::{ReadinessEvent, ReadinessPhase, ReadinessTiming};
pub use registry::ShapeRegistry;
pub use subscriber::{
    ErrorFn, InitialSyncFn, MustRefetchFn, ShapeStream, ShapeSubscriber, StreamEvent,
    SubscriptionCallbacks, SubscriptionConfig,
};
