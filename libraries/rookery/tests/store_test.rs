mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{Kind, TestEntity, post, user};
use rookery::{StoreHandle, ValidationError, WriteMode};
use serde_json::json;

#[test]
fn merge_preserves_fields_from_earlier_writes() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();

    store
        .write(Kind::Users, "1", &json!({"id": "1", "name": "magpie"}), WriteMode::Merge)
        .unwrap();
    store
        .write(Kind::Users, "1", &json!({"id": "1", "followers": 3}), WriteMode::Merge)
        .unwrap();

    // A partial refresh must not discard fields from the fuller write.
    assert_eq!(
        store.read(Kind::Users, "1"),
        Some(TestEntity::User {
            id: "1".into(),
            name: Some("magpie".into()),
            followers: 3,
        })
    );
}

#[test]
fn replace_discards_the_previous_record() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();

    store
        .write(Kind::Users, "1", &user("1", "magpie", 9), WriteMode::Merge)
        .unwrap();
    store
        .write(Kind::Users, "1", &json!({"id": "1", "followers": 1}), WriteMode::Replace)
        .unwrap();

    assert_eq!(
        store.read(Kind::Users, "1"),
        Some(TestEntity::User {
            id: "1".into(),
            name: None,
            followers: 1,
        })
    );
}

#[test]
fn invalid_payload_is_not_written() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    store
        .write(Kind::Users, "1", &user("1", "magpie", 9), WriteMode::Merge)
        .unwrap();

    let err = store
        .write(Kind::Users, "1", &json!({"id": "1", "followers": "lots"}), WriteMode::Merge)
        .unwrap_err();
    assert!(matches!(err, ValidationError::Schema(_)));

    // Stale beats corrupt: the earlier record is untouched.
    assert_eq!(
        store.read(Kind::Users, "1"),
        Some(TestEntity::User {
            id: "1".into(),
            name: Some("magpie".into()),
            followers: 9,
        })
    );
}

#[test]
fn id_mismatch_is_rejected() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    let err = store
        .write(Kind::Users, "1", &user("2", "imposter", 0), WriteMode::Merge)
        .unwrap_err();
    assert_eq!(err, ValidationError::InvalidId);
    assert!(!store.contains(Kind::Users, "1"));
}

#[test]
fn subscribers_are_notified_in_the_same_task() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    let seen = Rc::new(Cell::new(0));

    let seen_by_listener = Rc::clone(&seen);
    let key = store.subscribe(
        Kind::Posts,
        Some("7".into()),
        Rc::new(move || seen_by_listener.set(seen_by_listener.get() + 1)),
    );

    store
        .write(Kind::Posts, "7", &post("7", "hello"), WriteMode::Merge)
        .unwrap();
    assert_eq!(seen.get(), 1);

    // Writes to other ids of the kind don't reach an id-scoped listener.
    store
        .write(Kind::Posts, "8", &post("8", "other"), WriteMode::Merge)
        .unwrap();
    assert_eq!(seen.get(), 1);

    // A write that changes nothing stays quiet.
    store
        .write(Kind::Posts, "7", &post("7", "hello"), WriteMode::Merge)
        .unwrap();
    assert_eq!(seen.get(), 1);

    store.unsubscribe(key);
    store
        .write(Kind::Posts, "7", &post("7", "changed"), WriteMode::Merge)
        .unwrap();
    assert_eq!(seen.get(), 1);
}

#[test]
fn kind_wide_subscription_sees_every_id() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    let seen = Rc::new(Cell::new(0));

    let seen_by_listener = Rc::clone(&seen);
    store.subscribe(
        Kind::Posts,
        None,
        Rc::new(move || seen_by_listener.set(seen_by_listener.get() + 1)),
    );

    store
        .write(Kind::Posts, "1", &post("1", "a"), WriteMode::Merge)
        .unwrap();
    store
        .write(Kind::Posts, "2", &post("2", "b"), WriteMode::Merge)
        .unwrap();
    assert_eq!(seen.get(), 2);
}

#[test]
fn remove_is_explicit_and_notifies() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    store
        .write(Kind::Posts, "7", &post("7", "hello"), WriteMode::Merge)
        .unwrap();

    let seen = Rc::new(Cell::new(0));
    let seen_by_listener = Rc::clone(&seen);
    store.subscribe(
        Kind::Posts,
        Some("7".into()),
        Rc::new(move || seen_by_listener.set(seen_by_listener.get() + 1)),
    );

    assert!(store.remove(Kind::Posts, "7"));
    assert_eq!(store.read(Kind::Posts, "7"), None);
    assert_eq!(seen.get(), 1);
    assert!(!store.remove(Kind::Posts, "7"));
}

#[test]
fn write_many_validates_the_whole_batch_first() {
    let store: StoreHandle<TestEntity> = StoreHandle::new();
    let err = store
        .write_many(
            Kind::Users,
            &[user("1", "a", 0), json!({"id": "", "name": "broken"})],
        )
        .unwrap_err();
    assert_eq!(err, ValidationError::InvalidId);
    assert!(!store.contains(Kind::Users, "1"));

    let written = store
        .write_many(Kind::Users, &[user("1", "a", 0), user("2", "b", 1)])
        .unwrap();
    assert_eq!(written, 2);
}
