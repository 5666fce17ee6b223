use crate::*;
use hostfile::MemHostFile;
use std::cell::RefCell;
use std::rc::Rc;

fn new_tree() -> BTree<MemHostFile> {
    let cache = Rc::new(RefCell::new(PageCache::new(MemHostFile::new(), 256)));
    BTree::create(cache).unwrap()
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:06}").into_bytes()
}

#[test]
fn insert_then_find_round_trips() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    let cursor = tree.find(b"a").unwrap().unwrap();
    assert_eq!(cursor.value(), b"1");
    assert!(tree.find(b"missing").unwrap().is_none());
}

#[test]
fn insert_is_rejected_for_oversize_key() {
    let mut tree = new_tree();
    let huge = vec![0u8; common::MAX_ENTRY_LEN + 1];
    let err = tree.insert(&huge, b"v", |_| true).unwrap_err();
    assert!(matches!(err, common::CoreError::OversizeEntry));
}

#[test]
fn replace_policy_false_leaves_existing_value() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    match tree.insert(b"a", b"2", |_| false).unwrap() {
        InsertOutcome::Unchanged { cursor } => assert_eq!(cursor.value(), b"1"),
        _ => panic!("expected Unchanged"),
    }
    assert_eq!(tree.find(b"a").unwrap().unwrap().value(), b"1");
}

#[test]
fn replace_policy_true_overwrites_and_reports_old_value() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    match tree.insert(b"a", b"2", |_| true).unwrap() {
        InsertOutcome::Replaced { old } => assert_eq!(old, b"1"),
        _ => panic!("expected Replaced"),
    }
    assert_eq!(tree.find(b"a").unwrap().unwrap().value(), b"2");
}

#[test]
fn begin_and_next_iterate_in_key_order() {
    let mut tree = new_tree();
    for i in [5u32, 1, 3, 2, 4] {
        tree.insert(&key(i), b"v", |_| true).unwrap();
    }
    let mut seen = Vec::new();
    let mut cursor = tree.begin(b"").unwrap();
    while let Some(c) = cursor {
        seen.push(c.key().to_vec());
        cursor = tree.next(&c).unwrap();
    }
    let expected: Vec<Vec<u8>> = (1..=5).map(key).collect();
    assert_eq!(seen, expected);
}

#[test]
fn begin_past_the_end_returns_none() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    assert!(tree.begin(b"z").unwrap().is_none());
}

#[test]
fn stale_cursor_is_rejected_after_a_mutation() {
    let mut tree = new_tree();
    tree.insert(&key(1), b"v", |_| true).unwrap();
    tree.insert(&key(2), b"v", |_| true).unwrap();
    let cursor = tree.find(&key(1)).unwrap().unwrap();
    tree.insert(&key(3), b"v", |_| true).unwrap();
    let err = tree.next(&cursor).unwrap_err();
    assert!(matches!(err, common::CoreError::StaleCursor));
}

#[test]
fn many_inserts_force_leaf_splits_and_all_keys_remain_findable() {
    let mut tree = new_tree();
    let value = vec![b'x'; 80];
    for i in 0..400u32 {
        tree.insert(&key(i), &value, |_| true).unwrap();
    }
    for i in 0..400u32 {
        let cursor = tree.find(&key(i)).unwrap().unwrap_or_else(|| panic!("missing key {i}"));
        assert_eq!(cursor.value(), value.as_slice());
    }

    let mut count = 0;
    let mut cursor = tree.begin(b"").unwrap();
    let mut last_key: Option<Vec<u8>> = None;
    while let Some(c) = cursor {
        if let Some(last) = &last_key {
            assert!(last.as_slice() < c.key(), "iteration must stay in ascending key order");
        }
        last_key = Some(c.key().to_vec());
        count += 1;
        cursor = tree.next(&c).unwrap();
    }
    assert_eq!(count, 400);
}

#[test]
fn remove_missing_key_returns_none() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    assert_eq!(tree.remove(b"missing").unwrap(), None);
}

#[test]
fn remove_returns_old_value_and_drops_the_key() {
    let mut tree = new_tree();
    tree.insert(b"a", b"1", |_| true).unwrap();
    assert_eq!(tree.remove(b"a").unwrap(), Some(b"1".to_vec()));
    assert!(tree.find(b"a").unwrap().is_none());
}

#[test]
fn inserting_then_removing_everything_leaves_an_empty_iterable_tree() {
    let mut tree = new_tree();
    let value = vec![b'y'; 80];
    for i in 0..400u32 {
        tree.insert(&key(i), &value, |_| true).unwrap();
    }
    for i in 0..400u32 {
        assert_eq!(tree.remove(&key(i)).unwrap(), Some(value.clone()));
    }
    assert!(tree.begin(b"").unwrap().is_none());
    for i in 0..400u32 {
        assert!(tree.find(&key(i)).unwrap().is_none());
    }
}

#[test]
fn removing_half_the_keys_triggers_merges_without_losing_survivors() {
    let mut tree = new_tree();
    let value = vec![b'z'; 100];
    for i in 0..400u32 {
        tree.insert(&key(i), &value, |_| true).unwrap();
    }
    for i in (0..400u32).step_by(2) {
        tree.remove(&key(i)).unwrap();
    }
    for i in 0..400u32 {
        let found = tree.find(&key(i)).unwrap();
        if i % 2 == 0 {
            assert!(found.is_none(), "key {i} should have been removed");
        } else {
            assert_eq!(found.unwrap().value(), value.as_slice());
        }
    }
}

#[test]
fn rename_moves_the_value_to_a_new_key() {
    let mut tree = new_tree();
    tree.insert(b"old", b"payload", |_| true).unwrap();
    match tree.rename(b"old", b"new").unwrap() {
        RenameOutcome::Renamed { replaced } => assert!(replaced.is_none()),
        RenameOutcome::NotFound => panic!("expected a rename"),
    }
    assert!(tree.find(b"old").unwrap().is_none());
    assert_eq!(tree.find(b"new").unwrap().unwrap().value(), b"payload");
}

#[test]
fn rename_reports_the_value_it_overwrote() {
    let mut tree = new_tree();
    tree.insert(b"old", b"a", |_| true).unwrap();
    tree.insert(b"new", b"b", |_| true).unwrap();
    match tree.rename(b"old", b"new").unwrap() {
        RenameOutcome::Renamed { replaced } => assert_eq!(replaced, Some(b"b".to_vec())),
        RenameOutcome::NotFound => panic!("expected a rename"),
    }
    assert_eq!(tree.find(b"new").unwrap().unwrap().value(), b"a");
}

#[test]
fn rename_of_a_missing_key_is_reported_as_not_found() {
    let mut tree = new_tree();
    assert!(matches!(tree.rename(b"missing", b"new").unwrap(), RenameOutcome::NotFound));
}

#[test]
fn freed_pages_accumulate_across_root_collapse() {
    let mut tree = new_tree();
    let value = vec![b'w'; 100];
    for i in 0..400u32 {
        tree.insert(&key(i), &value, |_| true).unwrap();
    }
    // drain whatever freeing happened during inserts (normally none, since
    // insert only ever allocates).
    tree.take_freed_pages();

    for i in 0..400u32 {
        tree.remove(&key(i)).unwrap();
    }
    let freed = tree.take_freed_pages();
    assert!(!freed.is_empty(), "collapsing back to a single leaf must free internal pages");
}
