//! Optimistic transactions: apply a speculative patch to one or more store
//! entries now, get back an inverse that restores exactly the touched
//! fields, and reconcile (or roll back) once the network call resolves.
//!
//! The inverse is captured from the pre-mutation values at apply time, not
//! read fresh at failure time, so rollback stays correct even when unrelated
//! fields of the same entity were updated in the interim.

use serde_json::{Map, Value};

use crate::error::MutationError;
use crate::store::{StoreHandle, json_type_name};
use crate::{Entity, EntityId};

enum PatchSpec {
    /// A plain shallow patch object.
    Object(Map<String, Value>),
    /// Computed from the current raw record, for read-modify-write patches
    /// like bumping a follower count.
    Computed(Box<dyn FnOnce(&Map<String, Value>) -> Map<String, Value>>),
}

pub struct TransactionBuilder<K> {
    patches: Vec<(K, EntityId, PatchSpec)>,
}

impl<K> Default for TransactionBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TransactionBuilder<K> {
    pub fn new() -> Self {
        Self {
            patches: Vec::new(),
        }
    }

    /// Add a shallow patch. `patch` must be a JSON object.
    pub fn patch(mut self, kind: K, id: impl Into<EntityId>, patch: Value) -> Self {
        let object = match patch {
            Value::Object(object) => object,
            other => {
                // Surfaced as a validation failure at apply time; recorded
                // here so the builder stays infallible.
                let mut object = Map::new();
                object.insert("__non_object_patch".to_owned(), other);
                object
            }
        };
        self.patches.push((kind, id.into(), PatchSpec::Object(object)));
        self
    }

    /// Add a patch computed from the entity's current raw fields.
    pub fn patch_with(
        mut self,
        kind: K,
        id: impl Into<EntityId>,
        f: impl FnOnce(&Map<String, Value>) -> Map<String, Value> + 'static,
    ) -> Self {
        self.patches
            .push((kind, id.into(), PatchSpec::Computed(Box::new(f))));
        self
    }
}

/// The captured pre-mutation values of every field a transaction touched.
/// `None` means the field did not exist before.
#[derive(Debug)]
pub struct InversePatch<K> {
    entries: Vec<(K, EntityId, Vec<(String, Option<Value>)>)>,
}

impl<E: Entity> StoreHandle<E> {
    /// Apply a transaction's patches synchronously and atomically: every
    /// patched record is merged and re-validated first, and only if all of
    /// them pass is anything committed. Subscribers never observe a partial
    /// apply.
    pub fn apply_transaction(
        &self,
        tx: TransactionBuilder<E::Kind>,
    ) -> Result<InversePatch<E::Kind>, MutationError> {
        struct Staged<K> {
            kind: K,
            id: EntityId,
            merged: Map<String, Value>,
            inverse: Vec<(String, Option<Value>)>,
        }

        let mut staged: Vec<Staged<E::Kind>> = Vec::new();
        {
            let store = self.inner().borrow();
            for (kind, id, spec) in tx.patches {
                // Two patches to the same record in one transaction stack:
                // the later one reads the earlier one's staged result.
                let already_staged = staged
                    .iter()
                    .rev()
                    .find(|s: &&Staged<E::Kind>| s.kind == kind && s.id == id)
                    .map(|s| s.merged.clone());
                let raw = match already_staged {
                    Some(raw) => raw,
                    None => match store.read_raw(kind, &id) {
                        Some(Value::Object(raw)) => raw,
                        _ => {
                            return Err(MutationError::MissingEntity {
                                kind: format!("{kind:?}"),
                                id,
                            });
                        }
                    },
                };
                let patch = match spec {
                    PatchSpec::Object(object) => object,
                    PatchSpec::Computed(f) => f(&raw),
                };
                if let Some(bad) = patch.get("__non_object_patch") {
                    return Err(crate::ValidationError::NotAnObject {
                        found: json_type_name(bad),
                    }
                    .into());
                }

                let mut merged = raw.clone();
                let mut inverse = Vec::with_capacity(patch.len());
                for (field, value) in patch {
                    inverse.push((field.clone(), raw.get(&field).cloned()));
                    merged.insert(field, value);
                }
                let candidate = Value::Object(merged);
                E::validate(kind, &candidate).map_err(MutationError::from)?;
                let Value::Object(merged) = candidate else {
                    unreachable!()
                };
                staged.push(Staged {
                    kind,
                    id,
                    merged,
                    inverse,
                });
            }
        }

        // All patches validated; commit the lot. A commit can only fail on
        // validation, which the staging pass already ruled out.
        let mut entries = Vec::with_capacity(staged.len());
        {
            let mut store = self.inner().borrow_mut();
            for item in staged {
                store
                    .write(
                        item.kind,
                        &item.id,
                        &Value::Object(item.merged),
                        crate::WriteMode::Replace,
                    )
                    .map_err(MutationError::from)?;
                entries.push((item.kind, item.id, item.inverse));
            }
        }
        self.flush();

        Ok(InversePatch { entries })
    }
}

impl<K> InversePatch<K> {
    /// Restore the captured fields, leaving everything else as it is now.
    /// Used when the network call behind an optimistic mutation fails.
    pub fn revert<E>(self, store: &StoreHandle<E>)
    where
        E: Entity<Kind = K>,
        K: Copy + std::fmt::Debug,
    {
        for (kind, id, fields) in self.entries {
            if let Err(err) = store.restore_fields(kind, &id, &fields) {
                // Can only happen if interim writes made the restored shape
                // invalid; leave the record alone rather than corrupt it.
                log::error!("rollback of {kind:?}/{id} failed validation: {err}");
            }
        }
    }
}
