//! Per-key fetch lifecycle: at most one request in flight per key, joined by
//! every interested caller; freshness tracking; forced invalidation; and
//! rejection of responses that were superseded while still in the air.
//!
//! The store stays the source of truth: a query snapshot always reflects the
//! latest store value for the key, even when the fetch that populated it was
//! initiated by some other caller.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::FetchError;
use crate::store::{StoreHandle, WriteMode};
use crate::{Entity, EntityId};

/// Addresses a paginated collection, e.g. `(Accounts, "blocks")` or
/// `(Statuses, "group_media", Some(group_id))`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ListKey<K> {
    pub kind: K,
    pub name: &'static str,
    pub param: Option<EntityId>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum CacheKey<K> {
    Entity(K, EntityId),
    List(ListKey<K>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

type SharedFetch = Shared<LocalBoxFuture<'static, Result<(), FetchError>>>;

#[derive(Default)]
struct FetchSlot {
    status: FetchStatus,
    last_fetched_at: Option<DateTime<Utc>>,
    error: Option<FetchError>,
    unauthorized: bool,
    /// Bumped for every request issued (and by `invalidate`). A response
    /// only applies if its sequence still matches the latest issued one;
    /// anything older was superseded while in flight and is discarded.
    seq_issued: u64,
    seq_applied: u64,
    in_flight: Option<(u64, SharedFetch)>,
    /// Set while a batch fetch is driving this slot. There is no joinable
    /// future in that case; the batch settles the slot itself.
    batch_pending: bool,
}

impl FetchSlot {
    fn is_fresh(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        self.status == FetchStatus::Success
            && self.seq_applied == self.seq_issued
            && self
                .last_fetched_at
                .is_some_and(|at| now - at < stale_after)
    }
}

/// The hook-shaped result of a resolve: the latest store value plus the
/// fetch state for the key.
#[derive(Clone, Debug)]
pub struct EntityQuery<E> {
    pub data: Option<E>,
    pub status: FetchStatus,
    pub is_loading: bool,
    pub is_error: bool,
    pub is_unauthorized: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub error: Option<FetchError>,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolveOptions {
    /// When false the resolve is inert: no network activity, just a
    /// snapshot. Used to defer fetches until a dependency (e.g. an id) is
    /// actually known.
    pub enabled: bool,
    /// Overrides the cache-wide freshness window for this key.
    pub stale_after: Option<Duration>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after: None,
        }
    }
}

pub struct EntityCache<E: Entity> {
    store: StoreHandle<E>,
    slots: Rc<RefCell<FxHashMap<CacheKey<E::Kind>, FetchSlot>>>,
    stale_after: Duration,
}

impl<E: Entity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            slots: Rc::clone(&self.slots),
            stale_after: self.stale_after,
        }
    }
}

impl<E: Entity> EntityCache<E> {
    pub fn new(store: StoreHandle<E>, stale_after: Duration) -> Self {
        Self {
            store,
            slots: Rc::new(RefCell::new(FxHashMap::default())),
            stale_after,
        }
    }

    pub fn store(&self) -> &StoreHandle<E> {
        &self.store
    }

    /// Resolve one entity by key. The fetcher must be a pure function of the
    /// key — never a closure over mutable caller state — so any caller's
    /// fetcher is interchangeable with any other's for the same key.
    pub async fn resolve(
        &self,
        kind: E::Kind,
        id: &str,
        fetcher: impl FnOnce() -> LocalBoxFuture<'static, Result<Value, FetchError>>,
        opts: ResolveOptions,
    ) -> EntityQuery<E> {
        if !opts.enabled {
            return self.query(kind, id);
        }
        let key = CacheKey::Entity(kind, id.to_owned());
        let stale_after = opts.stale_after.unwrap_or(self.stale_after);

        let join = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.entry(key.clone()).or_default();
            if slot.is_fresh(stale_after, Utc::now()) {
                None
            } else if let Some((_, shared)) = &slot.in_flight {
                // Someone else is already fetching this key; join them.
                Some(shared.clone())
            } else if slot.batch_pending {
                // A batch fetch already covers this key; issuing another
                // request would duplicate it. The caller gets the loading
                // snapshot and the store notifies when the batch lands.
                None
            } else {
                slot.status = FetchStatus::Loading;
                slot.seq_issued += 1;
                let seq = slot.seq_issued;
                let shared = self
                    .apply_when_done(key.clone(), kind, id.to_owned(), seq, fetcher())
                    .shared();
                slot.in_flight = Some((seq, shared.clone()));
                Some(shared)
            }
        };

        if let Some(shared) = join {
            // Errors are recovered into the slot, not propagated; a failed
            // fetch degrades one widget, not the page.
            let _ = shared.await;
        }
        self.query(kind, id)
    }

    /// The completion half of a fetch, shared by every joined caller.
    fn apply_when_done(
        &self,
        key: CacheKey<E::Kind>,
        kind: E::Kind,
        id: EntityId,
        seq: u64,
        fut: LocalBoxFuture<'static, Result<Value, FetchError>>,
    ) -> LocalBoxFuture<'static, Result<(), FetchError>> {
        let slots = Rc::clone(&self.slots);
        let store = self.store.clone();
        async move {
            let result = fut.await;
            {
                let mut slots = slots.borrow_mut();
                let Some(slot) = slots.get_mut(&key) else {
                    return Ok(());
                };
                if slot.in_flight.as_ref().is_some_and(|(s, _)| *s == seq) {
                    slot.in_flight = None;
                }
                if seq < slot.seq_issued {
                    log::debug!("discarding superseded response for {key:?} (seq {seq})");
                    return Ok(());
                }
            }
            // Store writes flush subscriber callbacks, so no slot borrow may
            // be live here.
            let outcome = match result {
                Ok(raw) => store
                    .write(kind, &id, &raw, WriteMode::Merge)
                    .map(|_| ())
                    .map_err(FetchError::from),
                Err(err) => Err(err),
            };
            let mut slots = slots.borrow_mut();
            let Some(slot) = slots.get_mut(&key) else {
                return outcome;
            };
            match &outcome {
                Ok(()) => {
                    slot.status = FetchStatus::Success;
                    slot.last_fetched_at = Some(Utc::now());
                    slot.seq_applied = seq;
                    slot.error = None;
                    slot.unauthorized = false;
                }
                Err(err) => {
                    slot.status = FetchStatus::Error;
                    slot.unauthorized = matches!(err, FetchError::Unauthorized);
                    slot.error = Some(err.clone());
                }
            }
            outcome
        }
        .boxed_local()
    }

    /// Force the next resolve for this key to hit the network. A response
    /// from a request issued before the invalidation will be discarded even
    /// if it arrives afterwards.
    pub fn invalidate(&self, key: &CacheKey<E::Kind>) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.seq_issued += 1;
        slot.in_flight = None;
        slot.batch_pending = false;
        slot.last_fetched_at = None;
    }

    pub fn query(&self, kind: E::Kind, id: &str) -> EntityQuery<E> {
        let data = self.store.read(kind, id);
        let slots = self.slots.borrow();
        let key = CacheKey::Entity(kind, id.to_owned());
        match slots.get(&key) {
            Some(slot) => EntityQuery {
                data,
                status: slot.status,
                is_loading: slot.status == FetchStatus::Loading,
                is_error: slot.status == FetchStatus::Error,
                is_unauthorized: slot.unauthorized,
                last_fetched_at: slot.last_fetched_at,
                error: slot.error.clone(),
            },
            None => EntityQuery {
                data,
                status: FetchStatus::Idle,
                is_loading: false,
                is_error: false,
                is_unauthorized: false,
                last_fetched_at: None,
                error: None,
            },
        }
    }

    pub fn status(&self, key: &CacheKey<E::Kind>) -> FetchStatus {
        self.slots
            .borrow()
            .get(key)
            .map(|slot| slot.status)
            .unwrap_or_default()
    }

    // The batched coalescer drives slots for many ids at once, so it gets
    // direct access to the same state machine.

    /// Whether an id still needs a network fetch (not fresh, not in flight).
    pub(crate) fn needs_fetch(&self, key: &CacheKey<E::Kind>) -> bool {
        let slots = self.slots.borrow();
        match slots.get(key) {
            Some(slot) => {
                !slot.is_fresh(self.stale_after, Utc::now()) && slot.status != FetchStatus::Loading
            }
            None => true,
        }
    }

    pub(crate) fn mark_loading(&self, key: &CacheKey<E::Kind>) -> u64 {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.entry(key.clone()).or_default();
        slot.status = FetchStatus::Loading;
        slot.batch_pending = true;
        slot.seq_issued += 1;
        slot.seq_issued
    }

    /// Whether a response issued at `seq` was overtaken by a later request
    /// or an invalidation while it was in the air.
    pub(crate) fn is_superseded(&self, key: &CacheKey<E::Kind>, seq: u64) -> bool {
        self.slots
            .borrow()
            .get(key)
            .is_some_and(|slot| seq < slot.seq_issued)
    }

    pub(crate) fn apply_success(&self, key: &CacheKey<E::Kind>, seq: u64) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if seq < slot.seq_issued {
            return;
        }
        slot.batch_pending = false;
        slot.status = FetchStatus::Success;
        slot.last_fetched_at = Some(Utc::now());
        slot.seq_applied = seq;
        slot.error = None;
        slot.unauthorized = false;
    }

    pub(crate) fn apply_error(&self, key: &CacheKey<E::Kind>, seq: u64, error: FetchError) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if seq < slot.seq_issued {
            return;
        }
        slot.batch_pending = false;
        slot.status = FetchStatus::Error;
        slot.unauthorized = matches!(error, FetchError::Unauthorized);
        slot.error = Some(error);
    }
}
