//! Cross-module scenarios (spec.md §8 "Testable properties"), exercising
//! the jar/cache/bucket/btree/items/setop/merge modules together rather
//! than in isolation.

use persist_btree::bucket::Bucket;
use persist_btree::btree::BTree;
use persist_btree::cache::{CacheConfig, PickleCache};
use persist_btree::items::{BTreeItems, Entry, ItemKind};
use persist_btree::jar::{Jar, MemoryJar};
use persist_btree::merge;
use persist_btree::setop;
use persist_btree::{Error, Oid};
use std::cell::RefCell;
use std::rc::Rc;

fn new_tree() -> (
    Rc<RefCell<BTree<i64, i64>>>,
    Rc<dyn Jar>,
    Rc<RefCell<PickleCache<RefCell<BTree<i64, i64>>>>>,
    Rc<RefCell<PickleCache<RefCell<Bucket<i64, i64>>>>>,
) {
    let jar: Rc<dyn Jar> = Rc::new(MemoryJar::new());
    let tcache = Rc::new(RefCell::new(PickleCache::new(CacheConfig::default())));
    let bcache = Rc::new(RefCell::new(PickleCache::new(CacheConfig::default())));
    let root = Rc::new(RefCell::new(BTree::new_mapping()));
    BTree::place_in_jar(&root, &jar, &tcache, &bcache).unwrap();
    (root, jar, tcache, bcache)
}

#[test]
fn insert_1_to_200_splits_and_stays_ordered() {
    let (tree, _jar, _tcache, _bcache) = new_tree();
    for i in 1..=200i64 {
        BTree::insert(&tree, i, Some(i * i), false).unwrap();
    }
    assert_eq!(BTree::key_count(&tree).unwrap(), 200);
    for i in 1..=200i64 {
        assert_eq!(BTree::get(&tree, &i).unwrap(), i * i);
    }
    let keys: Vec<i64> = BTreeItems::keys(&tree)
        .unwrap()
        .map(|r| match r.unwrap() {
            Entry::Key(k) => k,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(keys, (1..=200).collect::<Vec<_>>());
}

#[test]
fn range_iteration_honors_exclude_flags() {
    let (tree, _jar, _tcache, _bcache) = new_tree();
    for i in 1..=100i64 {
        BTree::insert(&tree, i, Some(i), false).unwrap();
    }
    let inclusive: Vec<i64> = BTreeItems::range(&tree, Some(&40), Some(&60), false, false, ItemKind::Key)
        .unwrap()
        .map(|r| match r.unwrap() {
            Entry::Key(k) => k,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(inclusive, (40..=60).collect::<Vec<_>>());

    let exclusive: Vec<i64> = BTreeItems::range(&tree, Some(&40), Some(&60), true, true, ItemKind::Key)
        .unwrap()
        .map(|r| match r.unwrap() {
            Entry::Key(k) => k,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(exclusive, (41..=59).collect::<Vec<_>>());
}

#[test]
fn set_algebra_union_intersection_difference() {
    let a: Vec<i64> = vec![1, 2, 3, 4, 5];
    let b: Vec<i64> = vec![3, 4, 5, 6, 7];
    assert_eq!(setop::union(&a, Some(&b)), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(setop::intersection(&a, Some(&b)), vec![3, 4, 5]);
    assert_eq!(setop::difference(&a, Some(&b)), vec![1, 2]);
    assert_eq!(setop::difference(&b, Some(&a)), vec![6, 7]);
    // `None` stands in for the empty set (spec.md §4.5).
    assert_eq!(setop::union(&a, None), a);
    assert_eq!(setop::difference(&a, None), a);
    assert_eq!(setop::intersection(&a, None), Vec::<i64>::new());
}

#[test]
fn weighted_intersection_combines_overlapping_values() {
    let a: Vec<(i64, f64)> = vec![(1, 2.0), (2, 4.0), (3, 6.0)];
    let b: Vec<(i64, f64)> = vec![(2, 10.0), (3, 20.0), (4, 30.0)];
    let result = setop::weighted_intersection(&a, 0.5, Some(&b), 0.25);
    // key 2: 4.0*0.5 + 10.0*0.25 = 4.5; key 3: 6.0*0.5 + 20.0*0.25 = 8.0
    assert_eq!(result, vec![(2, 4.5), (3, 8.0)]);

    let union_result = setop::weighted_union(&a, 1.0, Some(&b), 1.0);
    assert_eq!(union_result, vec![(1, 2.0), (2, 14.0), (3, 26.0), (4, 30.0)]);
}

#[test]
fn three_way_merge_resolves_disjoint_edits_and_flags_real_conflicts() {
    let mut old = Bucket::<i64, i64>::new_mapping();
    old.set(1, Some(10), false).unwrap();
    old.set(2, Some(20), false).unwrap();

    let mut committed = Bucket::<i64, i64>::new_mapping();
    committed.set(1, Some(10), false).unwrap();
    committed.set(2, Some(99), false).unwrap(); // committed edited key 2

    let mut new = Bucket::<i64, i64>::new_mapping();
    new.set(1, Some(10), false).unwrap();
    new.set(2, Some(20), false).unwrap();
    new.set(3, Some(30), false).unwrap(); // new added key 3

    let merged = merge::bucket_merge(&mut old, &mut committed, &mut new).unwrap();
    assert_eq!(merged, vec![(1, 10), (2, 99), (3, 30)]);

    // Now make both sides edit key 2 differently: unresolvable.
    let mut old2 = Bucket::<i64, i64>::new_mapping();
    old2.set(2, Some(20), false).unwrap();
    let mut committed2 = Bucket::<i64, i64>::new_mapping();
    committed2.set(2, Some(21), false).unwrap();
    let mut new2 = Bucket::<i64, i64>::new_mapping();
    new2.set(2, Some(22), false).unwrap();

    let err = merge::bucket_merge(&mut old2, &mut committed2, &mut new2).unwrap_err();
    assert!(matches!(err, Error::Conflict { reason: merge::reason::MODIFY_MODIFY, .. }));
}

#[test]
fn cache_gc_reclaims_resident_buckets_under_pressure() {
    let mut cache: PickleCache<RefCell<Bucket<i64, i64>>> =
        PickleCache::new(CacheConfig { target_size: 100, drain_resistance: 0 });

    for i in 0..1000u64 {
        let mut bucket = Bucket::<i64, i64>::new_mapping();
        bucket.set(i as i64, Some(i as i64), false).unwrap();
        let bucket_rc = Rc::new(RefCell::new(bucket));
        cache.insert(Oid(i + 1), bucket_rc).unwrap();
    }
    assert_eq!(cache.non_ghost_count(), 1000);

    let evicted = cache.incrgc(None).unwrap();
    assert_eq!(evicted, 900);
    assert_eq!(cache.non_ghost_count(), 100);
}
