//! This is a library for keeping a web client's entity data consistent under
//! concurrent fetches, optimistic mutations, and realtime push events.
//! It was created for Roost, so it doesn't include much that was not needed for that project.
//!
//! Caching strategy:
//! 1. Every domain object ("entity") lives in one normalized store, keyed by `(kind, id)`. The UI never holds entity data itself, only keys.
//! 2. Reads go through a per-key fetch controller. If a fetch for a key is already in flight, later callers join it instead of issuing a duplicate request.
//! 3. Many single-id wants issued within one scheduling window are coalesced into a single batched network call, then fanned back out through the store.
//! 4. Mutations are applied to the store speculatively before the network call, with an inverse captured at apply time. On failure the inverse restores exactly the fields that were touched.
//! 5. A streaming session merges push events into materialized timelines: straight to the top when the user is caught up, into a queue when they've scrolled away.
//!
//! Sounds simple, but there are a few tricky parts that this library handles.
//! All of it assumes a single-threaded, event-loop execution environment
//! (wasm in practice), so shared state is `Rc<RefCell<..>>` and the one rule
//! is to never hold a borrow across an `.await`.

pub mod batch;
pub mod error;
pub mod fetch;
pub mod store;
pub mod streaming;
pub mod timeline;
pub mod transaction;

pub use batch::{BatchCoalescer, BatchFetcher, Scheduler};
pub use error::{FetchError, MutationError, StreamError, ValidationError};
pub use fetch::{CacheKey, EntityCache, EntityQuery, FetchStatus, ListKey, ResolveOptions};
pub use store::{NormalizedStore, StoreHandle, WriteMode};
pub use streaming::{
    ConnectionState, SignalListener, StreamEvent, StreamTransport, StreamingSession, Topic,
    TransportSignal,
};
pub use timeline::{TimelineKey, TimelineSet, TimelineSnapshot};
pub use transaction::{InversePatch, TransactionBuilder};

use std::fmt::Debug;
use std::hash::Hash;

/// An entity id, unique within an entity kind. Opaque to this library.
pub type EntityId = String;

slotmap::new_key_type! {
    /// Handle returned from subscribe calls; pass it back to unsubscribe.
    pub struct ListenerKey;
}

/// Core trait for the app's entity universe.
///
/// The app defines one enum covering every entity shape it knows about
/// (accounts, statuses, relationships, ...) and implements this for it.
/// Validation happens here, at the store boundary: a payload that fails to
/// parse is never written, so the store can only ever hold well-formed data.
pub trait Entity: Clone + Sized + 'static {
    /// The closed set of entity kinds. A plain fieldless enum in practice.
    type Kind: Copy + Eq + Hash + Debug + 'static;

    fn kind(&self) -> Self::Kind;

    fn id(&self) -> &str;

    /// Parse and validate a raw JSON payload into a typed entity.
    fn validate(kind: Self::Kind, raw: &serde_json::Value) -> Result<Self, ValidationError>;
}
