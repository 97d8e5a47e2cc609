use rand::prelude::*;
use rand::rngs::StdRng;

use super::*;

/// Small geometry so structural churn happens with few keys.
type SmallTree = BPTree<u64, u64, 8, 8>;

#[test]
fn geometry_defaults() {
    // Word-sized keys: 15 keys plus child ref and counter stay
    // within two cache lines; leaves bottom out at the floor.
    assert_eq!(DEFAULT_NODE_CAPACITY, 15);
    assert_eq!(DEFAULT_LEAF_CAPACITY, 8);
    assert_eq!(node_capacity(16), MIN_BRANCHING_FACTOR);
    assert!(leaf_capacity(8, 64) >= MIN_BRANCHING_FACTOR);
}

#[test]
fn empty_tree() {
    let tree: BPTree<u64, u64> = BPTree::new();
    assert!(tree.is_empty());
    assert_eq!(tree.len(), 0);
    assert!(tree.search(&1).is_none());
    assert!(tree.stats().is_zero());
    assert!(tree.iter().next().is_none());
    assert!(!tree.cursor_first().valid());
    tree.verify();
}

#[test]
fn insert_search_remove_round_trip() {
    let mut tree = SmallTree::new();
    let keys = [50u64, 10, 90, 30, 70, 20, 80, 40, 60, 0];
    for &k in &keys {
        assert_eq!(tree.insert(k, k * 2), None);
        tree.verify();
    }
    assert_eq!(tree.len(), keys.len());
    for &k in &keys {
        assert_eq!(tree.search(&k), Some(&(k * 2)));
    }
    assert!(tree.search(&55).is_none());

    // Replacement returns the old value.
    assert_eq!(tree.insert(30, 999), Some(60));
    assert_eq!(tree.search(&30), Some(&999));
    assert_eq!(tree.len(), keys.len());

    for &k in &keys {
        assert_eq!(tree.remove(&k).is_some(), true);
        assert!(tree.search(&k).is_none());
        tree.verify();
    }
    assert!(tree.is_empty());
    assert!(tree.stats().is_zero());
}

#[test]
fn in_order_traversal_is_sorted() {
    let mut tree = SmallTree::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut keys: Vec<u64> = (0..500).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(k, k);
    }
    tree.verify();

    let forward: Vec<u64> = tree.iter().map(|(k, _)| *k).collect();
    let expected: Vec<u64> = (0..500).collect();
    assert_eq!(forward, expected);

    let backward: Vec<u64> = tree.iter().rev().map(|(k, _)| *k).collect();
    let mut reversed = expected.clone();
    reversed.reverse();
    assert_eq!(backward, reversed);
    assert_eq!(tree.iter().len(), 500);
}

#[test]
fn search_or_insert_constructs_once() {
    let mut tree: BPTree<u64, Vec<u64>> = BPTree::new();
    tree.search_or_insert_with(5, Vec::new).push(1);
    tree.search_or_insert_with(5, Vec::new).push(2);
    assert_eq!(tree.search(&5), Some(&vec![1, 2]));
    assert_eq!(tree.len(), 1);

    // The by-value form keeps an existing value too.
    tree.search_or_insert(5, vec![9]);
    assert_eq!(tree.search(&5), Some(&vec![1, 2]));
}

#[test]
fn cursors_step_and_clamp() {
    let mut tree = SmallTree::new();
    for k in 0..100 {
        tree.insert(k, k);
    }

    let mut cursor = tree.cursor_first();
    let mut seen = Vec::new();
    while cursor.valid() {
        seen.push(*tree.cursor_entry(&cursor).unwrap().0);
        tree.cursor_next(&mut cursor);
    }
    assert_eq!(seen, (0..100).collect::<Vec<u64>>());

    let mut cursor = tree.cursor_last();
    assert_eq!(tree.cursor_entry(&cursor).unwrap().0, &99);
    tree.cursor_prev(&mut cursor);
    assert_eq!(tree.cursor_entry(&cursor).unwrap().0, &98);

    // In-leaf arithmetic clamps at the leaf bounds.
    let mut cursor = tree.cursor_find(&0);
    tree.cursor_advance_in_leaf(&mut cursor, 1_000);
    let clamped = *tree.cursor_entry(&cursor).unwrap().0;
    assert!(clamped < 8, "clamped slot stays in the first leaf");
    tree.cursor_rewind_in_leaf(&mut cursor, 1_000);
    assert_eq!(tree.cursor_entry(&cursor).unwrap().0, &0);

    let mut cursor = tree.cursor_find(&55);
    assert!(cursor.valid());
    assert_eq!(tree.replace(&cursor, 777), Some(55));
    assert_eq!(tree.search(&55), Some(&777));
    tree.cursor_next(&mut cursor);
    assert!(tree.cursor_find(&1_000).valid() == false);
}

#[test]
fn root_collapse_steps_back_down() {
    let mut tree = SmallTree::new();
    // Grow until the tree has two inner levels.
    let mut k = 0u64;
    while tree.height() < 2 {
        tree.insert(k, k);
        k += 1;
    }
    tree.verify();
    let total = k;

    // Delete from the top; the tree must hand back its levels and
    // end empty.
    let mut saw_height_one = false;
    let mut saw_height_zero = false;
    for k in (0..total).rev() {
        assert!(tree.remove(&k).is_some());
        tree.verify();
        match tree.height() {
            1 => saw_height_one = true,
            0 => {
                // A height-0 tree is a single leaf in a single
                // group, which is both first and last of the chain.
                if !tree.is_empty() {
                    assert_eq!(tree.stats().leaf_groups, 1);
                    saw_height_zero = true;
                }
            }
            _ => {}
        }
    }
    assert!(saw_height_one && saw_height_zero);
    assert!(tree.is_empty());
    assert!(tree.stats().is_zero());
}

#[test]
fn torture_ascending_insert_random_search_random_delete() {
    let mut tree = SmallTree::new();
    const COUNT: u64 = 10_000;

    for k in 0..COUNT {
        tree.insert(k, k + 1);
        if k % 1_000 == 0 {
            tree.verify();
        }
    }
    tree.verify();
    assert_eq!(tree.len(), COUNT as usize);

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..COUNT {
        let k = rng.gen_range(0..COUNT);
        assert_eq!(tree.search(&k), Some(&(k + 1)));
    }

    let mut order: Vec<u64> = (0..COUNT).collect();
    order.shuffle(&mut rng);
    for (i, k) in order.into_iter().enumerate() {
        assert_eq!(tree.remove(&k), Some(k + 1));
        if i % 1_000 == 0 {
            tree.verify();
        }
    }
    tree.verify();
    assert!(tree.is_empty());
    assert!(tree.stats().is_zero(), "stats must return to zero");
}

#[test]
fn random_churn_matches_reference_model() {
    let mut tree = SmallTree::new();
    let mut model = std::collections::BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(1234);

    for step in 0..4_000 {
        let k = rng.gen_range(0..512u64);
        if rng.gen_bool(0.6) {
            assert_eq!(tree.insert(k, k), model.insert(k, k));
        } else {
            assert_eq!(tree.remove(&k), model.remove(&k));
        }
        if step % 256 == 0 {
            tree.verify();
            let ours: Vec<u64> = tree.iter().map(|(k, _)| *k).collect();
            let theirs: Vec<u64> = model.keys().copied().collect();
            assert_eq!(ours, theirs);
        }
    }
    assert_eq!(tree.len(), model.len());
}

#[test]
fn clear_and_swap() {
    let mut a = SmallTree::new();
    let mut b = SmallTree::new();
    for k in 0..64 {
        a.insert(k, k);
    }
    a.swap(&mut b);
    assert!(a.is_empty());
    assert_eq!(b.len(), 64);
    b.verify();

    b.clear();
    assert!(b.is_empty());
    assert!(b.stats().is_zero());
    b.verify();
    // The cleared tree is immediately reusable.
    b.insert(1, 1);
    assert_eq!(b.search(&1), Some(&1));
}

#[test]
fn values_drop_exactly_once() {
    use std::rc::Rc;

    // Rc counts double-drops and leaks: every clone handed to the
    // tree must come back or die with it.
    let token = Rc::new(());
    {
        let mut tree: BPTree<u64, Rc<()>, 8, 8> = BPTree::new();
        for k in 0..200 {
            tree.insert(k, Rc::clone(&token));
        }
        for k in 100..200 {
            drop(tree.remove(&k));
        }
        assert_eq!(Rc::strong_count(&token), 101);
    }
    assert_eq!(Rc::strong_count(&token), 1);
}
