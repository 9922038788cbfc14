//! Timeline naming, paging, and the glue between the REST pages and the
//! engine's materialized timelines.
//!
//! Timeline names double as identifiers everywhere: `home`, `public:local`,
//! `hashtag:rust`, `list:7`, `group:12`. Each maps to one REST endpoint and
//! (for most) one streaming topic.

use std::rc::Rc;

use rookery::{EntityId, FetchError, StoreHandle, TimelineKey, TimelineSet, Topic};
use serde_json::Value;

use crate::api::ApiClient;
use crate::entities::{EntityKind, RoostEntity, nested_records};

pub fn timeline_key(name: &str) -> TimelineKey<EntityKind> {
    TimelineKey {
        kind: EntityKind::Statuses,
        name: name.to_owned(),
    }
}

/// The streaming topic whose creations feed this timeline.
pub fn topic_for(name: &str) -> Topic {
    // The home timeline rides the per-user stream; everything else shares
    // its name with its topic.
    if name == "home" {
        Topic("user".to_owned())
    } else {
        Topic(name.to_owned())
    }
}

/// REST path for one page of a timeline, oldest-first continuation by
/// `max_id`.
pub fn page_path(name: &str, max_id: Option<&str>) -> String {
    let base = if name == "home" {
        "/api/v1/timelines/home".to_owned()
    } else if name == "public:local" {
        "/api/v1/timelines/public?local=true".to_owned()
    } else if name == "public" {
        "/api/v1/timelines/public".to_owned()
    } else if let Some(tag) = name.strip_prefix("hashtag:") {
        format!("/api/v1/timelines/tag/{tag}")
    } else if let Some(list_id) = name.strip_prefix("list:") {
        format!("/api/v1/timelines/list/{list_id}")
    } else if let Some(group_id) = name.strip_prefix("group:") {
        format!("/api/v1/timelines/group/{group_id}")
    } else {
        format!("/api/v1/timelines/{name}")
    };
    match max_id {
        Some(max_id) if base.contains('?') => format!("{base}&max_id={max_id}"),
        Some(max_id) => format!("{base}?max_id={max_id}"),
        None => base,
    }
}

pub struct TimelineService<C> {
    store: StoreHandle<RoostEntity>,
    timelines: TimelineSet<EntityKind>,
    api: Rc<C>,
}

impl<C: ApiClient> TimelineService<C> {
    pub fn new(
        store: StoreHandle<RoostEntity>,
        timelines: TimelineSet<EntityKind>,
        api: Rc<C>,
    ) -> Self {
        Self {
            store,
            timelines,
            api,
        }
    }

    /// Fetch the next page of a timeline, normalize every status (and its
    /// embedded account) into the store, and append the ids. Returns how
    /// many statuses the page carried.
    pub async fn load_more(&self, name: &str) -> Result<usize, FetchError> {
        let key = timeline_key(name);
        let cursor = self.timelines.next_cursor(&key);
        self.timelines.begin_loading(&key);

        let page = match self.api.fetch_page(page_path(name, cursor.as_deref())).await {
            Ok(page) => page,
            Err(err) => {
                self.timelines.finish_loading(&key);
                return Err(err);
            }
        };

        let mut ids: Vec<EntityId> = Vec::with_capacity(page.items.len());
        for raw in &page.items {
            match self.normalize_status(raw) {
                Ok(id) => ids.push(id),
                // One bad status must not sink the page.
                Err(err) => log::warn!("dropping invalid status from {name}: {err}"),
            }
        }

        let count = ids.len();
        self.timelines.append_page(&key, ids, page.next_cursor);
        Ok(count)
    }

    /// Write one status payload and everything embedded in it.
    fn normalize_status(&self, raw: &Value) -> Result<EntityId, FetchError> {
        for (kind, nested) in nested_records(EntityKind::Statuses, raw) {
            let Some(id) = nested.get("id").and_then(Value::as_str).map(str::to_owned) else {
                continue;
            };
            if let Err(err) = self
                .store
                .write(kind, &id, &nested, rookery::WriteMode::Merge)
            {
                log::warn!("dropping invalid embedded {kind:?} {id}: {err}");
            }
        }
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(rookery::ValidationError::InvalidId)
            .map_err(FetchError::from)?;
        self.store
            .write(EntityKind::Statuses, &id, raw, rookery::WriteMode::Merge)
            .map_err(FetchError::from)?;
        Ok(id)
    }
}
