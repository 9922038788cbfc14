#![deny(clippy::string_slice)]

mod actions;
mod api;
mod entities;
mod streaming_ws;
mod timelines;
mod utils;

pub use api::{Page, ServerConfig};
pub use entities::{
    Account, BookmarkFolder, EntityKind, Group, GroupRelationship, Relationship, RoostEntity,
    Status,
};

use std::rc::Rc;
use std::sync::LazyLock;

use chrono::Duration;
use futures::future::LocalBoxFuture;
use rookery::{
    BatchCoalescer, BatchFetcher, CacheKey, ConnectionState, EntityCache, ListKey, ListenerKey,
    ResolveOptions, Scheduler, StoreHandle, StreamTransport, StreamingSession, TimelineSet,
    WriteMode,
};
use slotmap::{Key, KeyData};
use wasm_bindgen::prelude::*;

use crate::actions::Actions;
use crate::api::{ApiClient, RestClient};
use crate::timelines::{TimelineService, timeline_key, topic_for};

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
#[allow(clippy::declare_interior_mutable_const)]
const LOGGER: LazyLock<()> = LazyLock::new(|| {
    utils::set_panic_hook();

    wasm_logger::init(wasm_logger::Config::default());
    log::info!("Logging initialized");
});

/// Defers coalesced work to the end of the current microtask queue, so every
/// request made during one render tick lands in the same batch.
struct MicrotaskScheduler;

impl Scheduler for MicrotaskScheduler {
    fn schedule(&self, task: LocalBoxFuture<'static, ()>) {
        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(task);
        #[cfg(not(target_arch = "wasm32"))]
        futures::executor::block_on(task);
    }
}

#[cfg(target_arch = "wasm32")]
fn new_transport(
    config: &ServerConfig,
    api: &Rc<RestClient>,
) -> Rc<dyn StreamTransport<EntityKind>> {
    let streaming_url = config.streaming_url.clone();
    let api = Rc::clone(api);
    Rc::new(streaming_ws::WebSocketTransport::new(move || {
        match api.access_token() {
            Some(token) => format!("{streaming_url}/api/v1/streaming?access_token={token}"),
            None => format!("{streaming_url}/api/v1/streaming"),
        }
    }))
}

#[cfg(not(target_arch = "wasm32"))]
fn new_transport(
    _config: &ServerConfig,
    _api: &Rc<RestClient>,
) -> Rc<dyn StreamTransport<EntityKind>> {
    Rc::new(streaming_ws::NullTransport)
}

/// What a JS hook reads for one entity key.
#[derive(serde::Serialize)]
struct QuerySnapshot {
    data: Option<serde_json::Value>,
    is_loading: bool,
    is_error: bool,
    is_unauthorized: bool,
    error: Option<String>,
}

/// Relationship records go stale fast (another device can follow/unfollow),
/// so they get a much shorter freshness window than content does.
fn staleness_for(kind: EntityKind) -> Option<Duration> {
    match kind {
        EntityKind::Relationships | EntityKind::GroupRelationships => Some(Duration::seconds(60)),
        _ => None,
    }
}

#[wasm_bindgen]
pub struct Roost {
    // btw, we should never hold a borrow across an .await. by avoiding this,
    // we guarantee the absence of "borrow while locked" panics
    store: StoreHandle<RoostEntity>,
    cache: EntityCache<RoostEntity>,
    coalescer: BatchCoalescer<RoostEntity>,
    timelines: TimelineSet<EntityKind>,
    session: StreamingSession<RoostEntity>,
    api: Rc<RestClient>,
    actions: Actions<RestClient>,
    timeline_service: TimelineService<RestClient>,
}

fn to_js_err(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn to_js<T: serde::Serialize>(value: &T) -> JsValue {
    serde_wasm_bindgen::to_value(value).unwrap_or(JsValue::NULL)
}

fn call_js(callback: &js_sys::Function) {
    #[cfg(target_arch = "wasm32")]
    {
        let _ = callback.call0(&JsValue::NULL);
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        let _ = callback;
    }
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Roost {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(constructor))]
    pub fn new(config: ServerConfig, access_token: Option<String>) -> Roost {
        // used to only initialize the logger once
        #[allow(clippy::borrow_interior_mutable_const)]
        *LOGGER;

        let api = Rc::new(RestClient::new(config.base_url.clone(), access_token));
        let store: StoreHandle<RoostEntity> = StoreHandle::new();
        let cache = EntityCache::new(store.clone(), Duration::minutes(5));
        let coalescer = BatchCoalescer::new(cache.clone(), Rc::new(MicrotaskScheduler));
        let timelines: TimelineSet<EntityKind> = TimelineSet::new();
        let transport = new_transport(&config, &api);
        let session = StreamingSession::new(store.clone(), timelines.clone(), transport);
        let actions = Actions::new(store.clone(), Rc::clone(&api));
        let timeline_service =
            TimelineService::new(store.clone(), timelines.clone(), Rc::clone(&api));

        Roost {
            store,
            cache,
            coalescer,
            timelines,
            session,
            api,
            actions,
            timeline_service,
        }
    }

    // =======
    // entities
    // =======

    /// Resolve one entity: fresh cache answers immediately, an in-flight
    /// fetch is joined, anything else goes to the network.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn resolve_entity(&self, kind: EntityKind, id: String) -> JsValue {
        let api = Rc::clone(&self.api);
        let fetch_id = id.clone();
        let fetcher = move || api.fetch_entity(kind, &fetch_id);
        let opts = ResolveOptions {
            stale_after: staleness_for(kind),
            ..Default::default()
        };
        let query = self.cache.resolve(kind, &id, fetcher, opts).await;
        to_js(&QuerySnapshot {
            data: self.store.read_raw(kind, &id),
            is_loading: query.is_loading,
            is_error: query.is_error,
            is_unauthorized: query.is_unauthorized,
            error: query.error.map(|e| e.to_string()),
        })
    }

    /// The current snapshot for a key, without touching the network.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_entity(&self, kind: EntityKind, id: String) -> JsValue {
        let query = self.cache.query(kind, &id);
        to_js(&QuerySnapshot {
            data: self.store.read_raw(kind, &id),
            is_loading: query.is_loading,
            is_error: query.is_error,
            is_unauthorized: query.is_unauthorized,
            error: query.error.map(|e| e.to_string()),
        })
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn invalidate_entity(&self, kind: EntityKind, id: String) {
        self.cache.invalidate(&CacheKey::Entity(kind, id));
    }

    /// Hydrate relationships for every account id a just-rendered page
    /// mentions. Calls from the same tick coalesce into one request.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn request_relationships(&self, ids: Vec<String>) {
        self.request_batch(EntityKind::Relationships, "relationships", ids);
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn request_group_relationships(&self, ids: Vec<String>) {
        self.request_batch(EntityKind::GroupRelationships, "group_relationships", ids);
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe_to_entity(
        &self,
        kind: EntityKind,
        id: Option<String>,
        callback: js_sys::Function,
    ) -> u64 {
        self.store
            .subscribe(kind, id, Rc::new(move || call_js(&callback)))
            .data()
            .as_ffi()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe_entity(&self, key: u64) {
        self.store.unsubscribe(ListenerKey::from(KeyData::from_ffi(key)));
    }

    // =======
    // timelines
    // =======

    /// Mount a timeline: materialize it, watch it, and bind its streaming
    /// topic. The callback fires after every change.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe_to_timeline(&self, name: String, callback: js_sys::Function) -> u64 {
        let key = timeline_key(&name);
        let listener = self
            .timelines
            .subscribe(key.clone(), Rc::new(move || call_js(&callback)));
        if let Err(err) = self.session.subscribe(topic_for(&name), key) {
            log::warn!("could not subscribe stream topic for {name}: {err}");
        }
        listener.data().as_ffi()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe_timeline(&self, key: u64, name: String) {
        self.timelines
            .unsubscribe(ListenerKey::from(KeyData::from_ffi(key)));
        // Last watcher gone: stop the topic too.
        if self.timelines.snapshot(&timeline_key(&name)).is_none()
            && let Err(err) = self.session.unsubscribe(&topic_for(&name))
        {
            log::warn!("could not unsubscribe stream topic for {name}: {err}");
        }
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn timeline_snapshot(&self, name: String) -> JsValue {
        match self.timelines.snapshot(&timeline_key(&name)) {
            Some(snapshot) => to_js(&snapshot),
            None => JsValue::NULL,
        }
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn load_more(&self, name: String) -> Result<usize, JsValue> {
        self.timeline_service
            .load_more(&name)
            .await
            .map_err(to_js_err)
    }

    /// Report whether the user is scrolled to the top of this timeline.
    /// Live arrivals go straight in when they are, and queue when not.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_at_top(&self, name: String, at_top: bool) {
        self.timelines.set_at_top(&timeline_key(&name), at_top);
    }

    /// Merge the queued arrivals in; returns how many there were.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn dequeue(&self, name: String) -> usize {
        self.timelines.dequeue(&timeline_key(&name))
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn queued_count(&self, name: String) -> usize {
        self.timelines.queued_count(&timeline_key(&name))
    }

    // =======
    // streaming
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn connect_streaming(&self) -> Result<(), JsValue> {
        self.session.connect().map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_streaming_enabled(&self, enabled: bool) -> Result<(), JsValue> {
        self.session.set_enabled(enabled).map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn connection_state(&self) -> String {
        match self.session.connection_state() {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
        .to_owned()
    }

    /// Swap credentials (login/logout). The REST client picks the token up
    /// immediately; the stream reconnects to pick it up too.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_access_token(&self, token: Option<String>) {
        self.api.set_access_token(token);
        if let Err(err) = self.session.reconnect() {
            log::warn!("stream reconnect after credential change failed: {err}");
        }
    }

    // =======
    // optimistic actions
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn follow(&self, account_id: String) -> Result<(), JsValue> {
        self.actions.follow(&account_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn unfollow(&self, account_id: String) -> Result<(), JsValue> {
        self.actions.unfollow(&account_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn favourite(&self, status_id: String) -> Result<(), JsValue> {
        self.actions.favourite(&status_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn unfavourite(&self, status_id: String) -> Result<(), JsValue> {
        self.actions.unfavourite(&status_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn bookmark(
        &self,
        status_id: String,
        folder_id: Option<String>,
    ) -> Result<(), JsValue> {
        self.actions
            .bookmark(&status_id, folder_id)
            .await
            .map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn unbookmark(&self, status_id: String) -> Result<(), JsValue> {
        self.actions.unbookmark(&status_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn join_group(&self, group_id: String) -> Result<(), JsValue> {
        self.actions.join_group(&group_id).await.map_err(to_js_err)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn leave_group(&self, group_id: String) -> Result<(), JsValue> {
        self.actions.leave_group(&group_id).await.map_err(to_js_err)
    }
}

impl Roost {
    fn request_batch(&self, kind: EntityKind, list_name: &'static str, ids: Vec<String>) {
        let api = Rc::clone(&self.api);
        let fetcher: BatchFetcher<EntityKind> = Rc::new(move |kind, ids| api.fetch_batch(kind, ids));
        self.coalescer.request(
            ListKey {
                kind,
                name: list_name,
                param: None,
            },
            &ids,
            fetcher,
        );
    }

    /// Direct store access for code living on the Rust side of the boundary.
    pub fn store(&self) -> &StoreHandle<RoostEntity> {
        &self.store
    }
}

// A write helper for the app shell: seed entities the server delivered out
// of band (e.g. the verified credentials payload at boot).
#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Roost {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn import_entity(&self, kind: EntityKind, entity: JsValue) -> Result<(), JsValue> {
        let raw: serde_json::Value =
            serde_wasm_bindgen::from_value(entity).map_err(|e| to_js_err(format!("{e}")))?;
        let id = raw
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| to_js_err("entity payload has no id"))?;
        self.store
            .write(kind, &id, &raw, WriteMode::Merge)
            .map_err(to_js_err)?;
        Ok(())
    }
}
