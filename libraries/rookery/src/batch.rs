//! Coalesces many "give me entity X" wants issued within one scheduling
//! window into a single multi-id network call, then fans the results back
//! out through the store.
//!
//! Rendering N list rows that each need one relationship by id would
//! otherwise issue N requests. Ids are pooled per kind, not per list key, so
//! the same id wanted by two different lists in the same window is fetched
//! exactly once.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::FetchError;
use crate::fetch::{CacheKey, EntityCache, ListKey};
use crate::store::WriteMode;
use crate::{Entity, EntityId};

/// Where deferred work runs. On wasm this is
/// `wasm_bindgen_futures::spawn_local`; tests drive a `LocalPool` instead.
pub trait Scheduler {
    fn schedule(&self, task: LocalBoxFuture<'static, ()>);
}

pub type BatchFetcher<K> =
    Rc<dyn Fn(K, Vec<EntityId>) -> LocalBoxFuture<'static, Result<Vec<Value>, FetchError>>>;

struct PendingBatch<K> {
    ids: IndexSet<EntityId>,
    /// Sequence number handed out when each id was marked loading.
    seqs: FxHashMap<EntityId, u64>,
    list_keys: Vec<(ListKey<K>, u64)>,
    /// First fetcher registered in the window wins. Fetchers are required to
    /// be pure functions of `(kind, ids)`, so they are interchangeable.
    fetcher: BatchFetcher<K>,
}

struct BatchInner<E: Entity> {
    cache: EntityCache<E>,
    pending: RefCell<FxHashMap<E::Kind, PendingBatch<E::Kind>>>,
    scheduler: Rc<dyn Scheduler>,
}

pub struct BatchCoalescer<E: Entity> {
    inner: Rc<BatchInner<E>>,
}

impl<E: Entity> Clone for BatchCoalescer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Entity> BatchCoalescer<E> {
    pub fn new(cache: EntityCache<E>, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(BatchInner {
                cache,
                pending: RefCell::new(FxHashMap::default()),
                scheduler,
            }),
        }
    }

    /// Ask for a set of ids on behalf of a list. Ids that are already fresh
    /// or already being fetched are skipped; the rest join the window's
    /// pending batch. The flush is scheduled once per kind per window.
    pub fn request(&self, list_key: ListKey<E::Kind>, ids: &[EntityId], fetcher: BatchFetcher<E::Kind>) {
        let kind = list_key.kind;
        let cache = &self.inner.cache;

        let mut wanted: Vec<(EntityId, u64)> = Vec::new();
        for id in ids {
            let key = CacheKey::Entity(kind, id.clone());
            if cache.needs_fetch(&key) {
                let seq = cache.mark_loading(&key);
                wanted.push((id.clone(), seq));
            }
        }
        if wanted.is_empty() {
            return;
        }

        let list_seq = cache.mark_loading(&CacheKey::List(list_key.clone()));

        let first_in_window = {
            let mut pending = self.inner.pending.borrow_mut();
            match pending.get_mut(&kind) {
                Some(batch) => {
                    for (id, seq) in wanted {
                        batch.ids.insert(id.clone());
                        batch.seqs.insert(id, seq);
                    }
                    batch.list_keys.push((list_key, list_seq));
                    false
                }
                None => {
                    let mut batch = PendingBatch {
                        ids: IndexSet::new(),
                        seqs: FxHashMap::default(),
                        list_keys: vec![(list_key, list_seq)],
                        fetcher,
                    };
                    for (id, seq) in wanted {
                        batch.ids.insert(id.clone());
                        batch.seqs.insert(id, seq);
                    }
                    pending.insert(kind, batch);
                    true
                }
            }
        };

        // The flush re-borrows `pending`, so the borrow must be gone before
        // a synchronous scheduler could run it.
        if first_in_window {
            let inner = Rc::clone(&self.inner);
            self.inner
                .scheduler
                .schedule(Box::pin(async move { flush(inner, kind).await }));
        }
    }
}

async fn flush<E: Entity>(inner: Rc<BatchInner<E>>, kind: E::Kind) {
    let Some(batch) = inner.pending.borrow_mut().remove(&kind) else {
        return;
    };
    let ids: Vec<EntityId> = batch.ids.iter().cloned().collect();
    log::debug!("flushing batch of {} ids for {kind:?}", ids.len());

    let result = (batch.fetcher)(kind, ids.clone()).await;
    let cache = &inner.cache;

    match result {
        Ok(records) => {
            // Index the response by id, then settle each waiter against it.
            let mut by_id: FxHashMap<EntityId, Value> = FxHashMap::default();
            for raw in records {
                match raw.get("id").and_then(Value::as_str) {
                    Some(id) => {
                        by_id.insert(id.to_owned(), raw);
                    }
                    None => log::warn!("batch response record without an id field, dropping"),
                }
            }
            for id in &ids {
                let key = CacheKey::Entity(kind, id.clone());
                let seq = batch.seqs[id];
                // Same rule as the single-fetch path: a response that was
                // superseded while in the air must not clobber newer data.
                if cache.is_superseded(&key, seq) {
                    log::debug!("discarding superseded batch record for {key:?}");
                    continue;
                }
                match by_id.remove(id) {
                    Some(raw) => {
                        match cache.store().write(kind, id, &raw, WriteMode::Merge) {
                            Ok(_) => cache.apply_success(&key, seq),
                            Err(err) => cache.apply_error(&key, seq, err.into()),
                        }
                    }
                    // The caller must be able to tell "failed" from "still
                    // loading", so an absent id is an error, not a shrug.
                    None => cache.apply_error(&key, seq, FetchError::MissingFromBatch),
                }
            }
            for (list_key, list_seq) in batch.list_keys {
                cache.apply_success(&CacheKey::List(list_key), list_seq);
            }
        }
        Err(err) => {
            log::warn!("batch fetch for {kind:?} failed: {err}");
            for id in &ids {
                let key = CacheKey::Entity(kind, id.clone());
                cache.apply_error(&key, batch.seqs[id], err.clone());
            }
            for (list_key, list_seq) in batch.list_keys {
                cache.apply_error(&CacheKey::List(list_key), list_seq, err.clone());
            }
        }
    }
}
