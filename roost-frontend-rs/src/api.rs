//! The REST side of the server: one client, one trait seam so tests can
//! substitute a scripted server.
//!
//! Error mapping happens here and nowhere else: 401/403 become the
//! `Unauthorized` flag, everything else network-shaped becomes
//! `Network(..)` with enough text to debug from the console.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use rookery::{EntityId, FetchError, MutationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::EntityKind;

#[derive(Clone, Debug, Serialize, Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct ServerConfig {
    pub base_url: String,
    pub streaming_url: String,
}

/// One page of a paginated collection. `next_cursor` is the `max_id` to ask
/// for the page after this one; `None` means the server is out of items.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

pub trait ApiClient {
    fn fetch_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> LocalBoxFuture<'static, Result<Value, FetchError>>;

    /// Fetch many entities of one kind in a single request. The response
    /// carries one object per id, in any order.
    fn fetch_batch(
        &self,
        kind: EntityKind,
        ids: Vec<EntityId>,
    ) -> LocalBoxFuture<'static, Result<Vec<Value>, FetchError>>;

    fn fetch_page(&self, path: String) -> LocalBoxFuture<'static, Result<Page, FetchError>>;

    /// POST an action endpoint, returning the server's authoritative payload.
    fn post_action(&self, path: String) -> LocalBoxFuture<'static, Result<Value, MutationError>>;
}

pub fn entity_path(kind: EntityKind, id: &str) -> String {
    match kind {
        EntityKind::Accounts => format!("/api/v1/accounts/{id}"),
        EntityKind::Statuses => format!("/api/v1/statuses/{id}"),
        EntityKind::Relationships => format!("/api/v1/accounts/relationships?id[]={id}"),
        EntityKind::Groups => format!("/api/v1/groups/{id}"),
        EntityKind::GroupRelationships => format!("/api/v1/groups/relationships?id[]={id}"),
        EntityKind::BookmarkFolders => format!("/api/v1/bookmark_folders/{id}"),
    }
}

fn batch_path(kind: EntityKind, ids: &[EntityId]) -> String {
    let query: Vec<String> = ids.iter().map(|id| format!("id[]={id}")).collect();
    let query = query.join("&");
    match kind {
        EntityKind::Relationships => format!("/api/v1/accounts/relationships?{query}"),
        EntityKind::GroupRelationships => format!("/api/v1/groups/relationships?{query}"),
        EntityKind::Accounts => format!("/api/v1/accounts?{query}"),
        EntityKind::Groups => format!("/api/v1/groups?{query}"),
        EntityKind::Statuses => format!("/api/v1/statuses?{query}"),
        EntityKind::BookmarkFolders => format!("/api/v1/bookmark_folders?{query}"),
    }
}

/// The relationship endpoints answer with an array even for a single id.
fn unwraps_from_array(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Relationships | EntityKind::GroupRelationships
    )
}

pub const PAGE_LIMIT: usize = 20;

pub struct RestClient {
    base_url: String,
    access_token: Rc<RefCell<Option<String>>>,
}

impl RestClient {
    pub fn new(base_url: String, access_token: Option<String>) -> Self {
        Self {
            base_url,
            access_token: Rc::new(RefCell::new(access_token)),
        }
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.borrow_mut() = token;
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.borrow().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn get_json(url: String, token: Option<String>) -> Result<Value, FetchError> {
    let client = fetch_happen::Client;
    let mut request = client.get(&url);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let response = request
        .send()
        .await
        .map_err(|e| FetchError::Network(format!("{e:?}")))?;
    let status = response.status();
    if status == 401 || status == 403 {
        return Err(FetchError::Unauthorized);
    }
    if !response.ok() {
        return Err(FetchError::Network(format!("HTTP {status} from {url}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| FetchError::Network(format!("{e:?}")))?;
    serde_json::from_str(&body).map_err(|e| FetchError::Network(format!("bad JSON body: {e}")))
}

async fn post_json(url: String, token: Option<String>) -> Result<Value, MutationError> {
    let client = fetch_happen::Client;
    let mut request = client.post(&url);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let response = request
        .send()
        .await
        .map_err(|e| MutationError::Network(format!("{e:?}")))?;
    let status = response.status();
    if status == 409 || status == 422 {
        let body = response.text().await.unwrap_or_default();
        return Err(MutationError::Conflict(body));
    }
    if !response.ok() {
        return Err(MutationError::Network(format!("HTTP {status} from {url}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| MutationError::Network(format!("{e:?}")))?;
    serde_json::from_str(&body).map_err(|e| MutationError::Network(format!("bad JSON body: {e}")))
}

impl ApiClient for RestClient {
    fn fetch_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> LocalBoxFuture<'static, Result<Value, FetchError>> {
        let url = self.url(&entity_path(kind, id));
        let token = self.access_token();
        async move {
            let body = get_json(url, token).await?;
            if unwraps_from_array(kind) {
                match body {
                    Value::Array(mut items) if !items.is_empty() => Ok(items.remove(0)),
                    _ => Err(FetchError::MissingFromBatch),
                }
            } else {
                Ok(body)
            }
        }
        .boxed_local()
    }

    fn fetch_batch(
        &self,
        kind: EntityKind,
        ids: Vec<EntityId>,
    ) -> LocalBoxFuture<'static, Result<Vec<Value>, FetchError>> {
        let url = self.url(&batch_path(kind, &ids));
        let token = self.access_token();
        async move {
            match get_json(url, token).await? {
                Value::Array(items) => Ok(items),
                other => Err(FetchError::Network(format!(
                    "expected an array, got {other}"
                ))),
            }
        }
        .boxed_local()
    }

    fn fetch_page(&self, path: String) -> LocalBoxFuture<'static, Result<Page, FetchError>> {
        let url = self.url(&path);
        let token = self.access_token();
        async move {
            let items = match get_json(url, token).await? {
                Value::Array(items) => items,
                other => {
                    return Err(FetchError::Network(format!(
                        "expected an array, got {other}"
                    )));
                }
            };
            // Cursor by max_id: a short page means the server ran dry.
            let next_cursor = if items.len() < PAGE_LIMIT {
                None
            } else {
                items
                    .last()
                    .and_then(|item| item.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            };
            Ok(Page { items, next_cursor })
        }
        .boxed_local()
    }

    fn post_action(&self, path: String) -> LocalBoxFuture<'static, Result<Value, MutationError>> {
        let url = self.url(&path);
        let token = self.access_token();
        post_json(url, token).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_paths_follow_the_api_shape() {
        assert_eq!(
            entity_path(EntityKind::Accounts, "7"),
            "/api/v1/accounts/7"
        );
        assert_eq!(
            entity_path(EntityKind::Relationships, "7"),
            "/api/v1/accounts/relationships?id[]=7"
        );
        assert_eq!(
            batch_path(EntityKind::Relationships, &["7".into(), "9".into()]),
            "/api/v1/accounts/relationships?id[]=7&id[]=9"
        );
    }
}
