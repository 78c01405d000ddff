//! The six workspace-level scenarios from spec.md §8, driven directly
//! against the sync core's crates rather than through `Repo` — each one
//! is a property of `SyncTree`/`TransactionsTree`/`PushIdGenerator`/
//! `OnDisconnectManager` in isolation, not of any one crate's API surface.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use submerge_eval::{listener, Event, EventType, SyncTree};
use submerge_lang::{Name, OrderBy, Path, PushIdGenerator, QueryFilter, Scalar, Tsd};
use submerge_net::Scheduler;
use submerge_test::FakeClock;
use submerge_txn::{content_hash, Outcome, TransactionsTree};
use submerge_vers::OnDisconnectManager;

fn leaf(n: f64) -> Tsd {
    Tsd::leaf(Scalar::Num(ordered_float::OrderedFloat(n)))
}

fn node(children: Vec<(&str, Tsd)>) -> Tsd {
    Tsd::Node {
        children: children.into_iter().map(|(n, t)| (Name::new(n), t)).collect(),
        priority: None,
    }
}

/// S1: addListener("value", /a); applyServerOverwrite(/a, {x:1}) → {x:1}.
/// applyUserOverwrite(/a/x, 2, writeId=0) → {x:2}. applyAck(/a/x, 0, false,
/// i.e. reject) → back to {x:1}.
#[test]
fn s1_listen_then_local_set_then_reject() {
    let mut tree = SyncTree::new();
    let mut sched = Scheduler::new();
    let path = Path::from_wire("/a").unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    tree.add_listener(
        &path,
        &QueryFilter::unfiltered(),
        EventType::Value,
        &mut sched,
        listener(move |e| seen2.borrow_mut().push(e)),
    );
    sched.drain();
    seen.borrow_mut().clear();

    tree.apply_server_overwrite(&path, None, node(vec![("x", leaf(1.0))]));
    assert_eq!(seen.borrow_mut().drain(..).collect::<Vec<_>>(), vec![Event::Value(node(vec![("x", leaf(1.0))]))]);

    let path_x = Path::from_wire("/a/x").unwrap();
    tree.apply_user_overwrite(0, path_x.clone(), leaf(2.0));
    assert_eq!(seen.borrow_mut().drain(..).collect::<Vec<_>>(), vec![Event::Value(node(vec![("x", leaf(2.0))]))]);

    tree.apply_reject(0, &path_x);
    assert_eq!(seen.borrow_mut().drain(..).collect::<Vec<_>>(), vec![Event::Value(node(vec![("x", leaf(1.0))]))]);
}

/// S2: orderBy=value, limit=2, children {a:3,b:1,c:2,d:4} → window {b,c}.
#[test]
fn s2_filter_window_keeps_the_lowest_two_by_value() {
    let mut tree = SyncTree::new();
    let mut sched = Scheduler::new();
    let path = Path::from_wire("/r").unwrap();
    let filter = QueryFilter { order_by: OrderBy::Value, limit: Some(2), ..QueryFilter::unfiltered() };
    tree.add_listener(&path, &filter, EventType::Value, &mut sched, listener(|_| {}));
    sched.drain();

    let children: BTreeMap<Name, Tsd> = vec![
        (Name::new("a"), leaf(3.0)),
        (Name::new("b"), leaf(1.0)),
        (Name::new("c"), leaf(2.0)),
        (Name::new("d"), leaf(4.0)),
    ]
    .into_iter()
    .collect();
    tree.apply_server_overwrite(&path, Some(&filter), Tsd::Node { children, priority: None });

    let rendered = tree.cached_value(&path, &filter).unwrap();
    let names: Vec<&str> = rendered.children().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

/// S3: T at /n update(x -> x+1); {n:5} first attempt produces 6, rejected
/// stale; server pushes {n:7}; rerun produces 8; second attempt commits.
#[test]
fn s3_transaction_reruns_after_stale_rejection_then_commits() {
    let mut txns = TransactionsTree::new(25);
    let path = Path::from_wire("/n").unwrap();

    txns.start(
        0,
        &path,
        Box::new(|current: &Tsd| match current {
            Tsd::Leaf { value: Scalar::Num(n), .. } => Some(leaf(n.0 + 1.0)),
            _ => None,
        }),
    );

    let first = leaf(5.0);
    let result = txns.stage(&path, &first);
    assert!(result.done.is_empty());
    let send = result.send.expect("a ready transaction must produce a put");
    assert_eq!(send.data, leaf(6.0));
    assert_eq!(send.expected_hash, content_hash(&first));

    let (reset, done) = txns.stale(&path);
    assert_eq!(reset, vec![0]);
    assert!(done.is_empty());

    let second = leaf(7.0);
    let result = txns.stage(&path, &second);
    assert!(result.done.is_empty());
    let send = result.send.expect("the rerun must produce a put");
    assert_eq!(send.data, leaf(8.0));
    assert_eq!(send.expected_hash, content_hash(&second));

    assert_eq!(txns.ack(&path), vec![(0, Outcome::Committed(leaf(8.0)))]);
}

/// S4: two push IDs generated in the same millisecond are strictly
/// increasing and share their timestamp prefix.
#[test]
fn s4_push_ids_within_one_millisecond_are_strictly_increasing() {
    let mut gen = PushIdGenerator::new(FakeClock::new(1_000));
    let id1 = gen.next();
    let id2 = gen.next();
    assert_eq!(&id1.as_str()[..8], &id2.as_str()[..8]);
    assert!(id1 < id2);
}

/// S5: remember(/a, {x:1}); remember(/a/y, 2) → connection drops → SyncTree
/// sees both as server overwrites, sparse tree empties out.
#[test]
fn s5_on_disconnect_replays_remembered_writes_on_drop() {
    let mut mgr = OnDisconnectManager::new();
    let mut sync_tree = SyncTree::new();
    let mut txns = TransactionsTree::new(25);

    let path_a = Path::from_wire("/a").unwrap();
    let path_y = Path::from_wire("/a/y").unwrap();
    mgr.put(&path_a, node(vec![("x", leaf(1.0))]));
    mgr.put(&path_y, leaf(2.0));

    let mut sched = Scheduler::new();
    let seen_a = Rc::new(RefCell::new(Vec::new()));
    let seen_a2 = seen_a.clone();
    sync_tree.add_listener(
        &path_a,
        &QueryFilter::unfiltered(),
        EventType::Value,
        &mut sched,
        listener(move |e| seen_a2.borrow_mut().push(e)),
    );
    sched.drain();
    seen_a.borrow_mut().clear();

    mgr.run(&mut sync_tree, &mut txns, 1_000);

    assert!(mgr.is_empty());
    assert_eq!(
        seen_a.borrow_mut().drain(..).collect::<Vec<_>>(),
        vec![Event::Value(node(vec![("x", leaf(1.0)), ("y", leaf(2.0))]))]
    );
}

/// S6: /r = {a:1,b:2}; applyServerMerge(/r, {b:3,c:4}) emits child_changed(b)
/// and child_added(c), in whichever relative order spec.md §4.2's "removals,
/// moves, additions, changes, value" ordering puts them (additions first),
/// followed by one value event for the whole rendered node.
#[test]
fn s6_merge_emits_child_added_and_child_changed_then_value() {
    let mut tree = SyncTree::new();
    let mut sched = Scheduler::new();
    let path = Path::from_wire("/r").unwrap();
    tree.apply_server_overwrite(&path, None, node(vec![("a", leaf(1.0)), ("b", leaf(2.0))]));

    let seen = Rc::new(RefCell::new(Vec::new()));
    for ty in [EventType::ChildAdded, EventType::ChildChanged, EventType::Value] {
        let seen2 = seen.clone();
        tree.add_listener(&path, &QueryFilter::unfiltered(), ty, &mut sched, listener(move |e| seen2.borrow_mut().push(e)));
    }
    sched.drain();
    seen.borrow_mut().clear();

    let changed: BTreeMap<Name, Tsd> =
        vec![(Name::new("b"), leaf(3.0)), (Name::new("c"), leaf(4.0))].into_iter().collect();
    tree.apply_server_merge(&path, None, &changed);

    assert_eq!(
        seen.borrow_mut().drain(..).collect::<Vec<_>>(),
        vec![
            Event::ChildAdded { name: Name::new("c"), value: leaf(4.0) },
            Event::ChildChanged { name: Name::new("b"), value: leaf(3.0) },
            Event::Value(node(vec![("a", leaf(1.0)), ("b", leaf(3.0)), ("c", leaf(4.0))])),
        ]
    );
}
