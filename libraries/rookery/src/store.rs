//! The normalized store: one flat map of `kind → id → entity`, the single
//! source of truth for entity data in memory. Everything else in this crate
//! (and in the app) holds keys into it, never references.
//!
//! Writes are shallow JSON merges. A partial update (say, a relationship
//! refresh) overwrites only the fields it carries, so it never discards
//! fields populated by an earlier, more complete fetch. The merged object is
//! re-validated before commit; a payload that fails validation is dropped.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use slotmap::SlotMap;

use crate::error::ValidationError;
use crate::{Entity, EntityId, ListenerKey};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteMode {
    /// Shallow-merge the patch into the existing record (the default).
    Merge,
    /// Discard the existing record wholesale and start from the patch.
    Replace,
}

#[derive(Clone)]
struct Record<E> {
    entity: E,
    raw: Map<String, Value>,
}

struct Listener<K> {
    kind: K,
    /// `None` subscribes to every id of the kind.
    id: Option<EntityId>,
    callback: Rc<dyn Fn()>,
}

pub struct NormalizedStore<E: Entity> {
    slices: FxHashMap<E::Kind, im::HashMap<EntityId, Record<E>>>,
    listeners: SlotMap<ListenerKey, Listener<E::Kind>>,
    /// Keys written since the last notification flush.
    pending: Vec<(E::Kind, EntityId)>,
}

impl<E: Entity> Default for NormalizedStore<E> {
    fn default() -> Self {
        Self {
            slices: FxHashMap::default(),
            listeners: SlotMap::with_key(),
            pending: Vec::new(),
        }
    }
}

fn as_object(raw: &Value) -> Result<&Map<String, Value>, ValidationError> {
    raw.as_object().ok_or(ValidationError::NotAnObject {
        found: json_type_name(raw),
    })
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl<E: Entity> NormalizedStore<E> {
    /// Merge (or replace) a record. Returns whether anything changed.
    ///
    /// The merged object is validated before commit, and the validated
    /// entity must agree with the key it is stored under.
    pub fn write(
        &mut self,
        kind: E::Kind,
        id: &str,
        patch: &Value,
        mode: WriteMode,
    ) -> Result<bool, ValidationError> {
        let patch = as_object(patch)?;
        let existing = self
            .slices
            .get(&kind)
            .and_then(|slice| slice.get(id))
            .filter(|_| mode == WriteMode::Merge);

        let merged = match existing {
            Some(record) => {
                let mut merged = record.raw.clone();
                for (field, value) in patch {
                    merged.insert(field.clone(), value.clone());
                }
                merged
            }
            None => patch.clone(),
        };

        self.commit(kind, id, merged)
    }

    /// Validate a batch of full records and merge each one in. Payloads
    /// carry their own ids. Any invalid payload aborts the whole batch
    /// before anything is written.
    pub fn write_many(&mut self, kind: E::Kind, records: &[Value]) -> Result<usize, ValidationError> {
        for raw in records {
            as_object(raw)?;
            E::validate(kind, raw)?;
        }
        let mut written = 0;
        for raw in records {
            let entity = E::validate(kind, raw)?;
            let id = entity.id().to_owned();
            if self.write(kind, &id, raw, WriteMode::Merge)? {
                written += 1;
            }
        }
        Ok(written)
    }

    fn commit(
        &mut self,
        kind: E::Kind,
        id: &str,
        merged: Map<String, Value>,
    ) -> Result<bool, ValidationError> {
        let value = Value::Object(merged);
        let entity = E::validate(kind, &value)?;
        if entity.id() != id {
            return Err(ValidationError::InvalidId);
        }
        let Value::Object(merged) = value else {
            unreachable!()
        };

        let slice = self.slices.entry(kind).or_default();
        let changed = slice.get(id).is_none_or(|record| record.raw != merged);
        if changed {
            slice.insert(id.to_owned(), Record { entity, raw: merged });
            self.pending.push((kind, id.to_owned()));
        }
        Ok(changed)
    }

    pub fn read(&self, kind: E::Kind, id: &str) -> Option<E> {
        self.slices
            .get(&kind)
            .and_then(|slice| slice.get(id))
            .map(|record| record.entity.clone())
    }

    pub fn read_raw(&self, kind: E::Kind, id: &str) -> Option<Value> {
        self.slices
            .get(&kind)
            .and_then(|slice| slice.get(id))
            .map(|record| Value::Object(record.raw.clone()))
    }

    pub fn contains(&self, kind: E::Kind, id: &str) -> bool {
        self.slices
            .get(&kind)
            .is_some_and(|slice| slice.contains_key(id))
    }

    /// Explicit deletion; nothing in this crate removes entities implicitly.
    pub fn remove(&mut self, kind: E::Kind, id: &str) -> bool {
        let removed = self
            .slices
            .get_mut(&kind)
            .and_then(|slice| slice.remove(id))
            .is_some();
        if removed {
            self.pending.push((kind, id.to_owned()));
        }
        removed
    }

    /// Put individual top-level fields back to earlier values; `None` means
    /// the field did not exist. Used by transaction rollback, which must not
    /// disturb fields it never touched.
    pub(crate) fn restore_fields(
        &mut self,
        kind: E::Kind,
        id: &str,
        fields: &[(String, Option<Value>)],
    ) -> Result<bool, ValidationError> {
        let Some(record) = self.slices.get(&kind).and_then(|slice| slice.get(id)) else {
            // The record was removed in the interim; nothing to restore onto.
            return Ok(false);
        };
        let mut merged = record.raw.clone();
        for (field, value) in fields {
            match value {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }
        self.commit(kind, id, merged)
    }

    pub fn subscribe(
        &mut self,
        kind: E::Kind,
        id: Option<EntityId>,
        callback: Rc<dyn Fn()>,
    ) -> ListenerKey {
        self.listeners.insert(Listener { kind, id, callback })
    }

    pub fn unsubscribe(&mut self, key: ListenerKey) {
        self.listeners.remove(key);
    }

    /// Take the callbacks owed for writes since the last flush. The caller
    /// invokes them after releasing its borrow of the store, because many of
    /// them will call straight back into code that borrows it again.
    pub fn drain_notifications(&mut self) -> Vec<Rc<dyn Fn()>> {
        let pending = std::mem::take(&mut self.pending);
        let mut due: Vec<Rc<dyn Fn()>> = Vec::new();
        for (kind, id) in pending {
            for listener in self.listeners.values() {
                if listener.kind == kind
                    && listener.id.as_ref().is_none_or(|want| *want == id)
                {
                    due.push(Rc::clone(&listener.callback));
                }
            }
        }
        due
    }
}

/// Shared handle to the store. Everything that writes goes through here so
/// subscriber callbacks run in the same task as the write, with no borrow
/// still held.
pub struct StoreHandle<E: Entity> {
    inner: Rc<RefCell<NormalizedStore<E>>>,
}

impl<E: Entity> Clone for StoreHandle<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Entity> Default for StoreHandle<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> StoreHandle<E> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(NormalizedStore::default())),
        }
    }

    pub fn write(
        &self,
        kind: E::Kind,
        id: &str,
        patch: &Value,
        mode: WriteMode,
    ) -> Result<bool, ValidationError> {
        let result = self.inner.borrow_mut().write(kind, id, patch, mode);
        self.flush();
        result
    }

    pub fn write_many(&self, kind: E::Kind, records: &[Value]) -> Result<usize, ValidationError> {
        let result = self.inner.borrow_mut().write_many(kind, records);
        self.flush();
        result
    }

    pub fn remove(&self, kind: E::Kind, id: &str) -> bool {
        let removed = self.inner.borrow_mut().remove(kind, id);
        self.flush();
        removed
    }

    pub fn read(&self, kind: E::Kind, id: &str) -> Option<E> {
        self.inner.borrow().read(kind, id)
    }

    pub fn read_raw(&self, kind: E::Kind, id: &str) -> Option<Value> {
        self.inner.borrow().read_raw(kind, id)
    }

    pub fn contains(&self, kind: E::Kind, id: &str) -> bool {
        self.inner.borrow().contains(kind, id)
    }

    pub fn subscribe(
        &self,
        kind: E::Kind,
        id: Option<EntityId>,
        callback: Rc<dyn Fn()>,
    ) -> ListenerKey {
        self.inner.borrow_mut().subscribe(kind, id, callback)
    }

    pub fn unsubscribe(&self, key: ListenerKey) {
        self.inner.borrow_mut().unsubscribe(key);
    }

    pub(crate) fn restore_fields(
        &self,
        kind: E::Kind,
        id: &str,
        fields: &[(String, Option<Value>)],
    ) -> Result<bool, ValidationError> {
        let result = self.inner.borrow_mut().restore_fields(kind, id, fields);
        self.flush();
        result
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<NormalizedStore<E>>> {
        &self.inner
    }

    /// Flush pending subscriber notifications, avoiding RefCell re-borrows
    /// during callbacks. Callbacks may themselves write, so loop until quiet.
    pub(crate) fn flush(&self) {
        loop {
            let due = self.inner.borrow_mut().drain_notifications();
            if due.is_empty() {
                break;
            }
            for callback in due {
                callback();
            }
        }
    }
}
