//! User-initiated mutations, applied optimistically: the store changes the
//! moment the user acts, the network call runs behind it, and the captured
//! inverse rolls the store back if the call fails. On success the server's
//! authoritative payload is merged over the guess, which is a no-op when the
//! guess was right.

use std::rc::Rc;

use rookery::{MutationError, StoreHandle, TransactionBuilder, WriteMode};
use serde_json::{Map, Value, json};

use crate::api::ApiClient;
use crate::entities::{EntityKind, RoostEntity};

pub struct Actions<C> {
    store: StoreHandle<RoostEntity>,
    api: Rc<C>,
}

fn bump(field: &'static str, by: i64) -> impl FnOnce(&Map<String, Value>) -> Map<String, Value> {
    move |raw| {
        let current = raw.get(field).and_then(Value::as_i64).unwrap_or(0);
        let mut patch = Map::new();
        patch.insert(field.to_owned(), json!(current + by));
        patch
    }
}

impl<C: ApiClient> Actions<C> {
    pub fn new(store: StoreHandle<RoostEntity>, api: Rc<C>) -> Self {
        Self { store, api }
    }

    /// Run one optimistic mutation to completion: apply the transaction,
    /// POST the endpoint, and either merge the authoritative payload over
    /// the guess or roll the guess back.
    async fn optimistic(
        &self,
        tx: TransactionBuilder<EntityKind>,
        path: String,
        reconcile: Option<(EntityKind, String)>,
    ) -> Result<(), MutationError> {
        let inverse = self.store.apply_transaction(tx)?;
        match self.api.post_action(path).await {
            Ok(raw) => {
                if let Some((kind, id)) = reconcile
                    && let Err(err) = self.store.write(kind, &id, &raw, WriteMode::Merge)
                {
                    // The optimistic state stands; the response was junk.
                    log::warn!("discarding invalid payload for {kind:?}/{id}: {err}");
                }
                Ok(())
            }
            Err(err) => {
                inverse.revert(&self.store);
                Err(err)
            }
        }
    }

    pub async fn follow(&self, account_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(
                    EntityKind::Relationships,
                    account_id,
                    json!({ "following": true, "requested": false }),
                )
                .patch_with(EntityKind::Accounts, account_id, bump("followers_count", 1)),
            format!("/api/v1/accounts/{account_id}/follow"),
            Some((EntityKind::Relationships, account_id.to_owned())),
        )
        .await
    }

    pub async fn unfollow(&self, account_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(
                    EntityKind::Relationships,
                    account_id,
                    json!({ "following": false, "requested": false }),
                )
                .patch_with(EntityKind::Accounts, account_id, bump("followers_count", -1)),
            format!("/api/v1/accounts/{account_id}/unfollow"),
            Some((EntityKind::Relationships, account_id.to_owned())),
        )
        .await
    }

    pub async fn bookmark(
        &self,
        status_id: &str,
        folder_id: Option<String>,
    ) -> Result<(), MutationError> {
        let path = match &folder_id {
            Some(folder) => format!("/api/v1/statuses/{status_id}/bookmark?folder_id={folder}"),
            None => format!("/api/v1/statuses/{status_id}/bookmark"),
        };
        self.optimistic(
            TransactionBuilder::new().patch(
                EntityKind::Statuses,
                status_id,
                json!({ "bookmarked": true, "bookmark_folder": folder_id }),
            ),
            path,
            Some((EntityKind::Statuses, status_id.to_owned())),
        )
        .await
    }

    pub async fn unbookmark(&self, status_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new().patch(
                EntityKind::Statuses,
                status_id,
                json!({ "bookmarked": false, "bookmark_folder": null }),
            ),
            format!("/api/v1/statuses/{status_id}/unbookmark"),
            Some((EntityKind::Statuses, status_id.to_owned())),
        )
        .await
    }

    pub async fn favourite(&self, status_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(EntityKind::Statuses, status_id, json!({ "favourited": true }))
                .patch_with(EntityKind::Statuses, status_id, bump("favourites_count", 1)),
            format!("/api/v1/statuses/{status_id}/favourite"),
            Some((EntityKind::Statuses, status_id.to_owned())),
        )
        .await
    }

    pub async fn unfavourite(&self, status_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(EntityKind::Statuses, status_id, json!({ "favourited": false }))
                .patch_with(EntityKind::Statuses, status_id, bump("favourites_count", -1)),
            format!("/api/v1/statuses/{status_id}/unfavourite"),
            Some((EntityKind::Statuses, status_id.to_owned())),
        )
        .await
    }

    pub async fn join_group(&self, group_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(
                    EntityKind::GroupRelationships,
                    group_id,
                    json!({ "member": true, "requested": false }),
                )
                .patch_with(EntityKind::Groups, group_id, bump("members_count", 1)),
            format!("/api/v1/groups/{group_id}/join"),
            Some((EntityKind::GroupRelationships, group_id.to_owned())),
        )
        .await
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<(), MutationError> {
        self.optimistic(
            TransactionBuilder::new()
                .patch(
                    EntityKind::GroupRelationships,
                    group_id,
                    json!({ "member": false, "requested": false }),
                )
                .patch_with(EntityKind::Groups, group_id, bump("members_count", -1)),
            format!("/api/v1/groups/{group_id}/leave"),
            Some((EntityKind::GroupRelationships, group_id.to_owned())),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use futures::FutureExt;
    use futures::executor::block_on;
    use futures::future::LocalBoxFuture;
    use rookery::{EntityId, FetchError};

    use super::*;
    use crate::api::Page;
    use crate::entities::{Account, Relationship};

    /// Answers `post_action` from a scripted queue and records the paths hit.
    #[derive(Default)]
    struct MockApi {
        responses: RefCell<VecDeque<Result<Value, MutationError>>>,
        paths: RefCell<Vec<String>>,
    }

    impl MockApi {
        fn respond_with(&self, result: Result<Value, MutationError>) {
            self.responses.borrow_mut().push_back(result);
        }
    }

    impl ApiClient for MockApi {
        fn fetch_entity(
            &self,
            _kind: EntityKind,
            _id: &str,
        ) -> LocalBoxFuture<'static, Result<Value, FetchError>> {
            unimplemented!("not used by actions")
        }

        fn fetch_batch(
            &self,
            _kind: EntityKind,
            _ids: Vec<EntityId>,
        ) -> LocalBoxFuture<'static, Result<Vec<Value>, FetchError>> {
            unimplemented!("not used by actions")
        }

        fn fetch_page(&self, _path: String) -> LocalBoxFuture<'static, Result<Page, FetchError>> {
            unimplemented!("not used by actions")
        }

        fn post_action(
            &self,
            path: String,
        ) -> LocalBoxFuture<'static, Result<Value, MutationError>> {
            self.paths.borrow_mut().push(path);
            let result = self
                .responses
                .borrow_mut()
                .pop_front()
                .expect("unscripted post");
            async move { result }.boxed_local()
        }
    }

    fn store_with_account() -> StoreHandle<RoostEntity> {
        let store = StoreHandle::new();
        store
            .write(
                EntityKind::Accounts,
                "7",
                &json!({ "id": "7", "acct": "magpie", "followers_count": 10 }),
                WriteMode::Merge,
            )
            .unwrap();
        store
            .write(
                EntityKind::Relationships,
                "7",
                &json!({ "id": "7", "following": false }),
                WriteMode::Merge,
            )
            .unwrap();
        store
    }

    fn relationship(store: &StoreHandle<RoostEntity>) -> Relationship {
        match store.read(EntityKind::Relationships, "7").unwrap() {
            RoostEntity::Relationship(r) => r,
            other => panic!("expected a relationship, got {other:?}"),
        }
    }

    fn account(store: &StoreHandle<RoostEntity>) -> Account {
        match store.read(EntityKind::Accounts, "7").unwrap() {
            RoostEntity::Account(a) => a,
            other => panic!("expected an account, got {other:?}"),
        }
    }

    #[test]
    fn follow_applies_before_the_call_and_sticks_on_success() {
        let store = store_with_account();
        let api = Rc::new(MockApi::default());
        api.respond_with(Ok(json!({ "id": "7", "following": true, "followed_by": true })));
        let actions = Actions::new(store.clone(), Rc::clone(&api));

        block_on(actions.follow("7")).unwrap();

        assert_eq!(
            *api.paths.borrow(),
            vec!["/api/v1/accounts/7/follow".to_string()]
        );
        let rel = relationship(&store);
        assert!(rel.following);
        // The server knew something our guess didn't.
        assert!(rel.followed_by);
        assert_eq!(account(&store).followers_count, 11);
    }

    #[test]
    fn follow_rolls_back_on_failure() {
        let store = store_with_account();
        let api = Rc::new(MockApi::default());
        api.respond_with(Err(MutationError::Network("offline".into())));
        let actions = Actions::new(store.clone(), Rc::clone(&api));

        let err = block_on(actions.follow("7")).unwrap_err();
        assert_eq!(err, MutationError::Network("offline".into()));

        assert!(!relationship(&store).following);
        assert_eq!(account(&store).followers_count, 10);
    }

    #[test]
    fn rollback_spares_unrelated_interim_changes() {
        let store = store_with_account();

        // The same transaction `follow` applies, but with an unrelated
        // refresh landing between apply and rollback.
        let inverse = store
            .apply_transaction(
                TransactionBuilder::new()
                    .patch(EntityKind::Relationships, "7", json!({ "following": true }))
                    .patch_with(EntityKind::Accounts, "7", bump("followers_count", 1)),
            )
            .unwrap();
        store
            .write(
                EntityKind::Accounts,
                "7",
                &json!({ "id": "7", "statuses_count": 99 }),
                WriteMode::Merge,
            )
            .unwrap();
        inverse.revert(&store);

        let account = account(&store);
        assert_eq!(account.followers_count, 10);
        assert_eq!(account.statuses_count, 99);
    }

    #[test]
    fn acting_on_an_unloaded_entity_is_an_error() {
        let store: StoreHandle<RoostEntity> = StoreHandle::new();
        let api = Rc::new(MockApi::default());
        let actions = Actions::new(store, Rc::clone(&api));

        let err = block_on(actions.follow("404")).unwrap_err();
        assert!(matches!(err, MutationError::MissingEntity { .. }));
        // Nothing was posted.
        assert!(api.paths.borrow().is_empty());
    }

    #[test]
    fn bookmark_tracks_the_folder() {
        let store: StoreHandle<RoostEntity> = StoreHandle::new();
        store
            .write(
                EntityKind::Statuses,
                "101",
                &json!({ "id": "101", "content": "hi" }),
                WriteMode::Merge,
            )
            .unwrap();
        let api = Rc::new(MockApi::default());
        api.respond_with(Ok(json!({ "id": "101", "bookmarked": true })));
        let actions = Actions::new(store.clone(), Rc::clone(&api));

        block_on(actions.bookmark("101", Some("fld-1".into()))).unwrap();

        assert_eq!(
            *api.paths.borrow(),
            vec!["/api/v1/statuses/101/bookmark?folder_id=fld-1".to_string()]
        );
        match store.read(EntityKind::Statuses, "101").unwrap() {
            RoostEntity::Status(status) => {
                assert!(status.bookmarked);
                assert_eq!(status.bookmark_folder, Some("fld-1".into()));
            }
            other => panic!("expected a status, got {other:?}"),
        }
    }
}
