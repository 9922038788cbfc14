//! Merges push events from a streaming transport into the store and into
//! materialized timelines.
//!
//! The transport owns the socket, retry, and backoff; this module owns what
//! happens to each event once it arrives, plus replaying subscriptions when
//! the transport (re)connects. Each event is handled as a discrete
//! run-to-completion task, so store writes inside one handler are atomic
//! with respect to every other handler.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap};
use serde_json::Value;

use crate::error::StreamError;
use crate::store::{StoreHandle, WriteMode};
use crate::timeline::{TimelineKey, TimelineSet};
use crate::{Entity, EntityId};

/// A named stream, e.g. `public:local`, `user`, `list:7`, `hashtag:rust`.
/// Opaque here; the app decides the naming scheme.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Topic(pub String);

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug)]
pub enum StreamEvent<K> {
    /// A newly created item belonging to the topic's timeline.
    Update { kind: K, raw: Value },
    /// An edit to an existing item; patches the store but never inserts
    /// into a timeline.
    StatusUpdate { kind: K, raw: Value },
    Delete { kind: K, id: EntityId },
}

#[derive(Clone, Debug)]
pub enum TransportSignal<K> {
    Connected,
    Disconnected,
    Event { topic: Topic, event: StreamEvent<K> },
}

pub type SignalListener<K> = Rc<dyn Fn(TransportSignal<K>)>;

/// The collaborator seam for the socket itself. `connect` registers the
/// session's listener; after that the transport pushes signals in whatever
/// order it receives them, including `Connected` again after an automatic
/// reconnect.
pub trait StreamTransport<K> {
    fn connect(&self, listener: SignalListener<K>) -> Result<(), StreamError>;
    fn subscribe(&self, topic: &Topic) -> Result<(), StreamError>;
    fn unsubscribe(&self, topic: &Topic) -> Result<(), StreamError>;
    fn close(&self);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

struct SessionState<K> {
    connection: ConnectionState,
    enabled: bool,
    subscriptions: FxHashMap<Topic, TimelineKey<K>>,
    /// Ids we have seen a delete for. A creation arriving after the delete
    /// (out-of-order delivery, or replayed history after a reconnect) is
    /// dropped: delete always wins. Reordering only spans a bounded window
    /// around the delete, so the set is capped; the oldest entries age out.
    tombstones: IndexSet<(K, EntityId), FxBuildHasher>,
}

const TOMBSTONE_CAP: usize = 512;

struct SessionInner<E: Entity> {
    store: StoreHandle<E>,
    timelines: TimelineSet<E::Kind>,
    transport: Rc<dyn StreamTransport<E::Kind>>,
    state: RefCell<SessionState<E::Kind>>,
}

pub struct StreamingSession<E: Entity> {
    inner: Rc<SessionInner<E>>,
}

impl<E: Entity> Clone for StreamingSession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Entity> StreamingSession<E> {
    pub fn new(
        store: StoreHandle<E>,
        timelines: TimelineSet<E::Kind>,
        transport: Rc<dyn StreamTransport<E::Kind>>,
    ) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                store,
                timelines,
                transport,
                state: RefCell::new(SessionState {
                    connection: ConnectionState::Disconnected,
                    enabled: true,
                    subscriptions: FxHashMap::default(),
                    tombstones: IndexSet::default(),
                }),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().connection
    }

    pub fn connect(&self) -> Result<(), StreamError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.enabled {
                return Ok(());
            }
            state.connection = ConnectionState::Connecting;
        }
        let inner = Rc::clone(&self.inner);
        self.inner
            .transport
            .connect(Rc::new(move |signal| handle_signal(&inner, signal)))
    }

    /// Subscribe a topic and bind it to the timeline its creations feed.
    pub fn subscribe(&self, topic: Topic, timeline: TimelineKey<E::Kind>) -> Result<(), StreamError> {
        let connected = {
            let mut state = self.inner.state.borrow_mut();
            state.subscriptions.insert(topic.clone(), timeline);
            state.connection == ConnectionState::Connected
        };
        if connected {
            self.inner.transport.subscribe(&topic)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &Topic) -> Result<(), StreamError> {
        let connected = {
            let mut state = self.inner.state.borrow_mut();
            state.subscriptions.remove(topic);
            state.connection == ConnectionState::Connected
        };
        if connected {
            self.inner.transport.unsubscribe(topic)?;
        }
        Ok(())
    }

    /// Swap a topic's parameters in place: unsubscribe the old topic and
    /// subscribe the new one against the same timeline.
    pub fn resubscribe(
        &self,
        old_topic: &Topic,
        new_topic: Topic,
        timeline: TimelineKey<E::Kind>,
    ) -> Result<(), StreamError> {
        self.unsubscribe(old_topic)?;
        self.subscribe(new_topic, timeline)
    }

    /// Tear the connection down and bring it back up; on the next
    /// `Connected` signal every still-registered subscription is replayed.
    /// Used when credentials change.
    pub fn reconnect(&self) -> Result<(), StreamError> {
        self.inner.transport.close();
        self.inner.state.borrow_mut().connection = ConnectionState::Disconnected;
        self.connect()
    }

    /// While disabled (e.g. logged out) nothing is processed and nothing is
    /// retained beyond the subscription identities needed to resume.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), StreamError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.enabled == enabled {
                return Ok(());
            }
            state.enabled = enabled;
            if !enabled {
                state.connection = ConnectionState::Disconnected;
                state.tombstones.clear();
            }
        }
        if enabled {
            self.connect()
        } else {
            self.inner.transport.close();
            Ok(())
        }
    }
}

fn handle_signal<E: Entity>(inner: &Rc<SessionInner<E>>, signal: TransportSignal<E::Kind>) {
    match signal {
        TransportSignal::Connected => {
            let topics: Vec<Topic> = {
                let mut state = inner.state.borrow_mut();
                if !state.enabled {
                    return;
                }
                state.connection = ConnectionState::Connected;
                state.subscriptions.keys().cloned().collect()
            };
            log::info!("stream connected, replaying {} subscription(s)", topics.len());
            for topic in topics {
                if let Err(err) = inner.transport.subscribe(&topic) {
                    log::warn!("failed to replay subscription to {topic}: {err}");
                }
            }
        }
        TransportSignal::Disconnected => {
            inner.state.borrow_mut().connection = ConnectionState::Disconnected;
            log::info!("stream disconnected");
        }
        TransportSignal::Event { topic, event } => {
            let (enabled, timeline) = {
                let state = inner.state.borrow();
                (state.enabled, state.subscriptions.get(&topic).cloned())
            };
            if !enabled {
                return;
            }
            handle_event(inner, timeline, event);
        }
    }
}

fn handle_event<E: Entity>(
    inner: &Rc<SessionInner<E>>,
    timeline: Option<TimelineKey<E::Kind>>,
    event: StreamEvent<E::Kind>,
) {
    match event {
        StreamEvent::Update { kind, raw } => {
            let Some(id) = raw.get("id").and_then(Value::as_str).map(str::to_owned) else {
                log::warn!("stream update without an id field, dropping");
                return;
            };
            if inner
                .state
                .borrow()
                .tombstones
                .contains(&(kind, id.clone()))
            {
                log::debug!("dropping update for tombstoned {kind:?}/{id}");
                return;
            }
            match inner.store.write(kind, &id, &raw, WriteMode::Merge) {
                Ok(_) => {
                    if let Some(timeline) = timeline
                        && timeline.kind == kind
                    {
                        inner.timelines.insert_live(&timeline, id);
                    }
                }
                Err(err) => log::warn!("stream update for {kind:?}/{id} failed validation: {err}"),
            }
        }
        StreamEvent::StatusUpdate { kind, raw } => {
            let Some(id) = raw.get("id").and_then(Value::as_str).map(str::to_owned) else {
                log::warn!("stream edit without an id field, dropping");
                return;
            };
            if let Err(err) = inner.store.write(kind, &id, &raw, WriteMode::Merge) {
                log::warn!("stream edit for {kind:?}/{id} failed validation: {err}");
            }
        }
        StreamEvent::Delete { kind, id } => {
            {
                let mut state = inner.state.borrow_mut();
                state.tombstones.insert((kind, id.clone()));
                while state.tombstones.len() > TOMBSTONE_CAP {
                    state.tombstones.shift_remove_index(0);
                }
            }
            inner.store.remove(kind, &id);
            inner.timelines.remove_item(kind, &id);
        }
    }
}
