//! The entity universe of the app: everything the server can hand us that we
//! keep in the normalized store. Each payload is validated here, at the store
//! boundary, so nothing downstream ever sees a malformed record.
//!
//! Server payloads routinely carry more fields than we model; serde ignores
//! the extras, but the store still keeps the full raw object so merges never
//! lose them.

use rookery::{Entity, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, tsify::Tsify,
)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum EntityKind {
    Accounts,
    Statuses,
    Relationships,
    Groups,
    GroupRelationships,
    BookmarkFolders,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub statuses_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Statuses arrive with their author embedded; normalization peels this
    /// off into the Accounts slice (see [`nested_records`]).
    #[serde(default)]
    pub account: Option<Box<Account>>,
    #[serde(default)]
    pub reblogs_count: i64,
    #[serde(default)]
    pub favourites_count: i64,
    #[serde(default)]
    pub favourited: bool,
    #[serde(default)]
    pub reblogged: bool,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub bookmark_folder: Option<String>,
}

/// Keyed by the *account* id it describes, which is how the server hands
/// them back too.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Relationship {
    pub id: String,
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub followed_by: bool,
    #[serde(default)]
    pub requested: bool,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub muting: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub members_count: i64,
}

/// Keyed by group id, like [`Relationship`] is keyed by account id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct GroupRelationship {
    pub id: String,
    #[serde(default)]
    pub member: bool,
    #[serde(default)]
    pub requested: bool,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct BookmarkFolder {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoostEntity {
    Account(Account),
    Status(Status),
    Relationship(Relationship),
    Group(Group),
    GroupRelationship(GroupRelationship),
    BookmarkFolder(BookmarkFolder),
}

fn schema(err: serde_json::Error) -> ValidationError {
    ValidationError::Schema(err.to_string())
}

impl Entity for RoostEntity {
    type Kind = EntityKind;

    fn kind(&self) -> EntityKind {
        match self {
            RoostEntity::Account(_) => EntityKind::Accounts,
            RoostEntity::Status(_) => EntityKind::Statuses,
            RoostEntity::Relationship(_) => EntityKind::Relationships,
            RoostEntity::Group(_) => EntityKind::Groups,
            RoostEntity::GroupRelationship(_) => EntityKind::GroupRelationships,
            RoostEntity::BookmarkFolder(_) => EntityKind::BookmarkFolders,
        }
    }

    fn id(&self) -> &str {
        match self {
            RoostEntity::Account(a) => &a.id,
            RoostEntity::Status(s) => &s.id,
            RoostEntity::Relationship(r) => &r.id,
            RoostEntity::Group(g) => &g.id,
            RoostEntity::GroupRelationship(r) => &r.id,
            RoostEntity::BookmarkFolder(f) => &f.id,
        }
    }

    fn validate(kind: EntityKind, raw: &Value) -> Result<Self, ValidationError> {
        let obj = raw.as_object().ok_or(ValidationError::NotAnObject {
            found: match raw {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            },
        })?;
        if obj
            .get("id")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty)
        {
            return Err(ValidationError::InvalidId);
        }
        match kind {
            EntityKind::Accounts => serde_json::from_value::<Account>(raw.clone())
                .map(RoostEntity::Account)
                .map_err(schema),
            EntityKind::Statuses => serde_json::from_value::<Status>(raw.clone())
                .map(RoostEntity::Status)
                .map_err(schema),
            EntityKind::Relationships => serde_json::from_value::<Relationship>(raw.clone())
                .map(RoostEntity::Relationship)
                .map_err(schema),
            EntityKind::Groups => serde_json::from_value::<Group>(raw.clone())
                .map(RoostEntity::Group)
                .map_err(schema),
            EntityKind::GroupRelationships => {
                serde_json::from_value::<GroupRelationship>(raw.clone())
                    .map(RoostEntity::GroupRelationship)
                    .map_err(schema)
            }
            EntityKind::BookmarkFolders => serde_json::from_value::<BookmarkFolder>(raw.clone())
                .map(RoostEntity::BookmarkFolder)
                .map_err(schema),
        }
    }
}

/// Entities embedded inside a payload of `kind` that should be written to
/// their own store slices when the payload is normalized.
pub fn nested_records(kind: EntityKind, raw: &Value) -> Vec<(EntityKind, Value)> {
    let mut nested = Vec::new();
    if kind == EntityKind::Statuses {
        if let Some(account) = raw.get("account").filter(|a| a.is_object()) {
            nested.push((EntityKind::Accounts, account.clone()));
        }
        // A reblog wraps the original status (and its author) wholesale.
        if let Some(reblog) = raw.get("reblog").filter(|r| r.is_object()) {
            nested.push((EntityKind::Statuses, reblog.clone()));
            nested.extend(nested_records(EntityKind::Statuses, reblog));
        }
    }
    nested
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_with_embedded_account_validates() {
        let raw = json!({
            "id": "101",
            "content": "<p>hi</p>",
            "account": { "id": "7", "acct": "magpie@example.social" },
            "favourites_count": 2,
        });
        let entity = RoostEntity::validate(EntityKind::Statuses, &raw).unwrap();
        let RoostEntity::Status(status) = entity else {
            panic!("expected a status");
        };
        assert_eq!(status.account.unwrap().acct, "magpie@example.social");
        assert_eq!(status.favourites_count, 2);
        assert!(!status.bookmarked);
    }

    #[test]
    fn missing_id_is_rejected() {
        let raw = json!({ "acct": "nobody" });
        assert_eq!(
            RoostEntity::validate(EntityKind::Accounts, &raw),
            Err(ValidationError::InvalidId)
        );
    }

    #[test]
    fn nested_records_peels_accounts_out_of_statuses() {
        let raw = json!({
            "id": "101",
            "account": { "id": "7" },
            "reblog": { "id": "90", "account": { "id": "8" } },
        });
        let nested = nested_records(EntityKind::Statuses, &raw);
        assert_eq!(nested.len(), 3);
        assert_eq!(nested[0].0, EntityKind::Accounts);
        assert_eq!(nested[1].0, EntityKind::Statuses);
        assert_eq!(nested[2].0, EntityKind::Accounts);
        assert_eq!(nested[2].1["id"], "8");
    }
}
