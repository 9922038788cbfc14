mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::Kind;
use rookery::{EntityId, TimelineKey, TimelineSet};

fn home() -> TimelineKey<Kind> {
    TimelineKey {
        kind: Kind::Posts,
        name: "home".into(),
    }
}

fn ids(items: &[&str]) -> Vec<EntityId> {
    items.iter().map(|s| s.to_string()).collect()
}

fn subscribed() -> (TimelineSet<Kind>, Rc<Cell<usize>>) {
    let timelines = TimelineSet::new();
    let notified = Rc::new(Cell::new(0));
    let notified_by_listener = Rc::clone(&notified);
    timelines.subscribe(
        home(),
        Rc::new(move || notified_by_listener.set(notified_by_listener.get() + 1)),
    );
    (timelines, notified)
}

#[test]
fn pages_append_in_order_and_never_duplicate() {
    let (timelines, _) = subscribed();

    timelines.append_page(&home(), ids(&["3", "2", "1"]), Some("cursor-a".into()));
    // The next page overlaps the first; "1" keeps its position.
    timelines.append_page(&home(), ids(&["1", "0"]), None);

    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["3", "2", "1", "0"]));
    assert!(!snapshot.has_more);
    assert_eq!(timelines.next_cursor(&home()), None);
}

#[test]
fn live_arrival_goes_to_the_head_when_caught_up() {
    let (timelines, _) = subscribed();
    timelines.append_page(&home(), ids(&["2", "1"]), None);

    timelines.insert_live(&home(), "3".into());

    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["3", "2", "1"]));
    assert_eq!(snapshot.queued_count, 0);
}

#[test]
fn live_arrival_queues_when_scrolled_away() {
    let (timelines, _) = subscribed();
    timelines.append_page(&home(), ids(&["2", "1"]), None);
    timelines.set_at_top(&home(), false);

    timelines.insert_live(&home(), "3".into());
    timelines.insert_live(&home(), "4".into());

    // The rendered list is untouched; only the badge count moves.
    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["2", "1"]));
    assert_eq!(snapshot.queued_count, 2);
}

#[test]
fn dequeue_materializes_newest_first() {
    let (timelines, _) = subscribed();
    timelines.append_page(&home(), ids(&["1"]), None);
    timelines.set_at_top(&home(), false);
    timelines.insert_live(&home(), "2".into());
    timelines.insert_live(&home(), "3".into());

    timelines.set_at_top(&home(), true);
    assert_eq!(timelines.dequeue(&home()), 2);

    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["3", "2", "1"]));
    assert_eq!(snapshot.queued_count, 0);
}

#[test]
fn live_only_content_is_marked_partial() {
    let (timelines, _) = subscribed();

    // Arrivals before any page has loaded: renderable, but with unknown
    // history below them.
    timelines.insert_live(&home(), "3".into());
    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["3"]));
    assert!(snapshot.is_partial);

    // The first real page fills the gap in.
    timelines.append_page(&home(), ids(&["3", "2", "1"]), None);
    assert!(!timelines.snapshot(&home()).unwrap().is_partial);
}

#[test]
fn duplicate_live_arrival_is_a_no_op() {
    let (timelines, notified) = subscribed();
    timelines.append_page(&home(), ids(&["2", "1"]), None);
    timelines.set_at_top(&home(), false);
    timelines.insert_live(&home(), "3".into());
    let before = notified.get();

    // Already materialized, and already queued: neither moves anything.
    timelines.insert_live(&home(), "1".into());
    timelines.insert_live(&home(), "3".into());

    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["2", "1"]));
    assert_eq!(snapshot.queued_count, 1);
    assert_eq!(notified.get(), before);
}

#[test]
fn remove_drops_the_id_from_list_and_queue() {
    let (timelines, _) = subscribed();
    timelines.append_page(&home(), ids(&["2", "1"]), None);
    timelines.set_at_top(&home(), false);
    timelines.insert_live(&home(), "3".into());

    timelines.remove_item(Kind::Posts, "1");
    timelines.remove_item(Kind::Posts, "3");

    let snapshot = timelines.snapshot(&home()).unwrap();
    assert_eq!(snapshot.item_ids, ids(&["2"]));
    assert_eq!(snapshot.queued_count, 0);
}

#[test]
fn listeners_fire_per_change_and_not_otherwise() {
    let (timelines, notified) = subscribed();

    timelines.append_page(&home(), ids(&["1"]), None);
    assert_eq!(notified.get(), 1);

    // Setting the flag it already has stays quiet.
    timelines.set_at_top(&home(), true);
    assert_eq!(notified.get(), 1);

    timelines.set_at_top(&home(), false);
    assert_eq!(notified.get(), 2);

    // Dequeueing an empty queue stays quiet too.
    assert_eq!(timelines.dequeue(&home()), 0);
    assert_eq!(notified.get(), 2);
}

#[test]
fn state_is_dropped_with_the_last_subscriber() {
    let timelines: TimelineSet<Kind> = TimelineSet::new();
    let first = timelines.subscribe(home(), Rc::new(|| {}));
    let second = timelines.subscribe(home(), Rc::new(|| {}));
    timelines.append_page(&home(), ids(&["1"]), None);

    timelines.unsubscribe(first);
    assert!(timelines.snapshot(&home()).is_some());

    timelines.unsubscribe(second);
    assert!(timelines.snapshot(&home()).is_none());

    // Arrivals for a timeline nobody watches are dropped, not buffered.
    timelines.insert_live(&home(), "2".into());
    assert!(timelines.snapshot(&home()).is_none());

    // A fresh subscription starts from scratch.
    timelines.subscribe(home(), Rc::new(|| {}));
    let snapshot = timelines.snapshot(&home()).unwrap();
    assert!(snapshot.item_ids.is_empty());
    assert!(snapshot.has_more);
}
