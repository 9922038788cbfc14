//! The ordered id sequences a list renderer consumes, derived from paginated
//! fetches plus reconciled streaming arrivals.
//!
//! An id never appears twice in a timeline. Pages append to the tail in
//! server order; live arrivals go to the head when the user is caught up,
//! or into a side queue (with a count badge) when they've scrolled away, so
//! merging never yanks the scroll position out from under them.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::{EntityId, ListenerKey};

/// Identifies one timeline, e.g. `(Statuses, "home")` or
/// `(Statuses, "hashtag:rust")`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TimelineKey<K> {
    pub kind: K,
    pub name: String,
}

struct Timeline {
    item_ids: IndexSet<EntityId>,
    queued_ids: IndexSet<EntityId>,
    is_loading: bool,
    /// Whether any page has been appended yet. Until one has, live
    /// arrivals render as a partial view with unknown history below.
    page_loaded: bool,
    has_more: bool,
    next_cursor: Option<String>,
    at_top: bool,
    subscribers: usize,
}

impl Timeline {
    fn is_partial(&self) -> bool {
        !self.page_loaded && !self.item_ids.is_empty()
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            item_ids: IndexSet::new(),
            queued_ids: IndexSet::new(),
            is_loading: false,
            page_loaded: false,
            has_more: true,
            next_cursor: None,
            at_top: true,
            subscribers: 0,
        }
    }
}

/// What the renderer sees.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TimelineSnapshot {
    pub item_ids: Vec<EntityId>,
    pub queued_count: usize,
    pub is_loading: bool,
    pub is_partial: bool,
    pub has_more: bool,
    pub at_top: bool,
}

struct TimelineListener<K> {
    key: TimelineKey<K>,
    callback: Rc<dyn Fn()>,
}

struct TimelinesInner<K> {
    timelines: FxHashMap<TimelineKey<K>, Timeline>,
    listeners: SlotMap<ListenerKey, TimelineListener<K>>,
}

pub struct TimelineSet<K> {
    inner: Rc<RefCell<TimelinesInner<K>>>,
}

impl<K> Clone for TimelineSet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K> Default for TimelineSet<K>
where
    K: Copy + Eq + std::hash::Hash + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimelineSet<K>
where
    K: Copy + Eq + std::hash::Hash + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimelinesInner {
                timelines: FxHashMap::default(),
                listeners: SlotMap::with_key(),
            })),
        }
    }

    /// Create (on first subscription) or attach to a timeline. The callback
    /// fires after any change to it.
    pub fn subscribe(&self, key: TimelineKey<K>, callback: Rc<dyn Fn()>) -> ListenerKey {
        let mut inner = self.inner.borrow_mut();
        let timeline = inner.timelines.entry(key.clone()).or_default();
        timeline.subscribers += 1;
        inner.listeners.insert(TimelineListener { key, callback })
    }

    /// Detach. When the last subscriber leaves, the timeline's state is
    /// dropped entirely; a later subscribe starts from scratch.
    pub fn unsubscribe(&self, listener: ListenerKey) {
        let mut inner = self.inner.borrow_mut();
        let Some(TimelineListener { key, .. }) = inner.listeners.remove(listener) else {
            return;
        };
        if let Some(timeline) = inner.timelines.get_mut(&key) {
            timeline.subscribers = timeline.subscribers.saturating_sub(1);
            if timeline.subscribers == 0 {
                inner.timelines.remove(&key);
                log::debug!("dropping timeline {key:?} (no subscribers left)");
            }
        }
    }

    pub fn snapshot(&self, key: &TimelineKey<K>) -> Option<TimelineSnapshot> {
        let inner = self.inner.borrow();
        inner.timelines.get(key).map(|t| TimelineSnapshot {
            item_ids: t.item_ids.iter().cloned().collect(),
            queued_count: t.queued_ids.len(),
            is_loading: t.is_loading,
            is_partial: t.is_partial(),
            has_more: t.has_more,
            at_top: t.at_top,
        })
    }

    pub fn next_cursor(&self, key: &TimelineKey<K>) -> Option<String> {
        self.inner
            .borrow()
            .timelines
            .get(key)
            .and_then(|t| t.next_cursor.clone())
    }

    pub fn begin_loading(&self, key: &TimelineKey<K>) {
        self.mutate(key, |t| {
            t.is_loading = true;
            ((), true)
        });
    }

    pub fn finish_loading(&self, key: &TimelineKey<K>) {
        self.mutate(key, |t| {
            t.is_loading = false;
            ((), true)
        });
    }

    /// Append a fetched page at the tail, preserving server order. Ids the
    /// timeline already holds keep their first-seen position.
    pub fn append_page(&self, key: &TimelineKey<K>, ids: Vec<EntityId>, next_cursor: Option<String>) {
        self.mutate(key, |t| {
            for id in ids {
                t.queued_ids.shift_remove(&id);
                t.item_ids.insert(id);
            }
            t.page_loaded = true;
            t.has_more = next_cursor.is_some();
            t.next_cursor = next_cursor;
            t.is_loading = false;
            ((), true)
        });
    }

    /// A live arrival for this timeline: straight to the head when the view
    /// is at the top, queued otherwise. A duplicate id is a no-op.
    pub fn insert_live(&self, key: &TimelineKey<K>, id: EntityId) {
        self.mutate(key, |t| {
            if t.item_ids.contains(&id) || t.queued_ids.contains(&id) {
                return ((), false);
            }
            if t.at_top {
                t.item_ids.shift_insert(0, id);
            } else {
                t.queued_ids.insert(id);
            }
            ((), true)
        });
    }

    /// Move queued arrivals to the head, newest first, and clear the queue.
    /// This is the one operation allowed to reorder an id that is already
    /// materialized.
    pub fn dequeue(&self, key: &TimelineKey<K>) -> usize {
        self.mutate(key, |t| {
            let queued = std::mem::take(&mut t.queued_ids);
            let count = queued.len();
            // Queue holds arrival order (oldest first); inserting each at
            // the head leaves the newest arrival on top.
            for id in queued {
                t.item_ids.shift_remove(&id);
                t.item_ids.shift_insert(0, id);
            }
            (count, count > 0)
        })
        .unwrap_or(0)
    }

    /// Drop an id from every timeline of the given kind (entity deleted).
    pub fn remove_item(&self, kind: K, id: &str) {
        let keys: Vec<TimelineKey<K>> = {
            let inner = self.inner.borrow();
            inner
                .timelines
                .iter()
                .filter(|(key, t)| {
                    key.kind == kind
                        && (t.item_ids.contains(id) || t.queued_ids.contains(id))
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in keys {
            self.mutate(&key, |t| {
                let a = t.item_ids.shift_remove(id);
                let b = t.queued_ids.shift_remove(id);
                ((), a || b)
            });
        }
    }

    /// Track whether the user is scrolled to the top ("caught up"). Live
    /// arrivals route on this.
    pub fn set_at_top(&self, key: &TimelineKey<K>, at_top: bool) {
        self.mutate(key, |t| {
            if t.at_top == at_top {
                return ((), false);
            }
            t.at_top = at_top;
            ((), true)
        });
    }

    pub fn queued_count(&self, key: &TimelineKey<K>) -> usize {
        self.inner
            .borrow()
            .timelines
            .get(key)
            .map(|t| t.queued_ids.len())
            .unwrap_or(0)
    }

    /// Run a mutation against one timeline, then notify its listeners with
    /// no borrow held. The closure returns `(result, changed)`; listeners
    /// only fire when something changed. `None` means the timeline doesn't
    /// exist (nobody is subscribed — the event is dropped).
    fn mutate<R>(
        &self,
        key: &TimelineKey<K>,
        f: impl FnOnce(&mut Timeline) -> (R, bool),
    ) -> Option<R> {
        let (result, due) = {
            let mut inner = self.inner.borrow_mut();
            let timeline = inner.timelines.get_mut(key)?;
            let (result, changed) = f(timeline);
            let due: Vec<Rc<dyn Fn()>> = if changed {
                inner
                    .listeners
                    .values()
                    .filter(|l| l.key == *key)
                    .map(|l| Rc::clone(&l.callback))
                    .collect()
            } else {
                Vec::new()
            };
            (result, due)
        };
        for callback in due {
            callback();
        }
        Some(result)
    }
}
