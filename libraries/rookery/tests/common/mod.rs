//! A miniature entity universe for exercising the engine: users, posts, and
//! the follow-links between users.
#![allow(dead_code)]

use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use rookery::{Entity, Scheduler, ValidationError};
use serde_json::{Value, json};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Kind {
    Users,
    Posts,
    Links,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TestEntity {
    User {
        id: String,
        name: Option<String>,
        followers: i64,
    },
    Post {
        id: String,
        body: String,
    },
    Link {
        id: String,
        following: bool,
    },
}

fn object_of(raw: &Value) -> Result<&serde_json::Map<String, Value>, ValidationError> {
    raw.as_object()
        .ok_or(ValidationError::NotAnObject { found: "non-object" })
}

fn id_of(obj: &serde_json::Map<String, Value>) -> Result<String, ValidationError> {
    obj.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .ok_or(ValidationError::InvalidId)
}

impl Entity for TestEntity {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        match self {
            TestEntity::User { .. } => Kind::Users,
            TestEntity::Post { .. } => Kind::Posts,
            TestEntity::Link { .. } => Kind::Links,
        }
    }

    fn id(&self) -> &str {
        match self {
            TestEntity::User { id, .. }
            | TestEntity::Post { id, .. }
            | TestEntity::Link { id, .. } => id,
        }
    }

    fn validate(kind: Kind, raw: &Value) -> Result<Self, ValidationError> {
        let obj = object_of(raw)?;
        let id = id_of(obj)?;
        match kind {
            Kind::Users => {
                let followers = match obj.get("followers") {
                    None => 0,
                    Some(v) => v
                        .as_i64()
                        .ok_or_else(|| ValidationError::Schema("followers must be an integer".into()))?,
                };
                let name = match obj.get("name") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        v.as_str()
                            .ok_or_else(|| ValidationError::Schema("name must be a string".into()))?
                            .to_owned(),
                    ),
                };
                Ok(TestEntity::User { id, name, followers })
            }
            Kind::Posts => {
                let body = obj
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(TestEntity::Post { id, body })
            }
            Kind::Links => {
                let following = match obj.get("following") {
                    None => false,
                    Some(v) => v
                        .as_bool()
                        .ok_or_else(|| ValidationError::Schema("following must be a bool".into()))?,
                };
                Ok(TestEntity::Link { id, following })
            }
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn user(id: &str, name: &str, followers: i64) -> Value {
    json!({ "id": id, "name": name, "followers": followers })
}

pub fn post(id: &str, body: &str) -> Value {
    json!({ "id": id, "body": body })
}

pub fn link(id: &str, following: bool) -> Value {
    json!({ "id": id, "following": following })
}

/// Runs scheduled work on a `LocalPool`, standing in for the wasm
/// microtask queue.
pub struct PoolScheduler(pub futures::executor::LocalSpawner);

impl Scheduler for PoolScheduler {
    fn schedule(&self, task: LocalBoxFuture<'static, ()>) {
        self.0.spawn_local(task).expect("spawn on local pool");
    }
}
