//! Property-based tests, differential against `BTreeMap` as the oracle.
//!
//! Key sets are generated prefix-free (no key is a proper prefix of
//! another), which is the caller-side contract of the tree.

use std::collections::BTreeMap;

use artree::Tree;
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

/// A prefix-free set of keys, each 1..=12 bytes.
///
/// Generated keys are sorted and any key extending a kept key is dropped;
/// lexicographic order puts a prefix right before its extensions, so
/// checking against the last kept key suffices.
fn prefix_free_keys(max_count: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::hash_set(prop::collection::vec(any::<u8>(), 1..=12), 0..=max_count)
        .prop_map(|set| {
            let mut keys: Vec<Vec<u8>> = set.into_iter().collect();
            keys.sort();
            let mut kept: Vec<Vec<u8>> = Vec::with_capacity(keys.len());
            for key in keys {
                if kept.last().is_some_and(|prev| key.starts_with(prev)) {
                    continue;
                }
                kept.push(key);
            }
            kept
        })
}

/// An optional scan bound.
fn bound() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 1..=12))
}

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, u64),
    Remove(usize),
    Get(usize),
}

/// A prefix-free key pool plus a random op sequence over it.
fn ops_with_pool() -> impl Strategy<Value = (Vec<Vec<u8>>, Vec<Op>)> {
    prefix_free_keys(16)
        .prop_filter("need at least one key", |keys| !keys.is_empty())
        .prop_flat_map(|keys| {
            let len = keys.len();
            let op = prop_oneof![
                3 => (0..len, any::<u64>()).prop_map(|(i, v)| Op::Insert(i, v)),
                2 => (0..len).prop_map(Op::Get),
                1 => (0..len).prop_map(Op::Remove),
            ];
            (Just(keys), prop::collection::vec(op, 0..=64))
        })
}

fn build(keys: &[Vec<u8>]) -> (Tree<u64>, BTreeMap<Vec<u8>, u64>) {
    let tree = Tree::new();
    let mut oracle = BTreeMap::new();
    for (i, key) in keys.iter().enumerate() {
        tree.insert(key, i as u64);
        oracle.insert(key.clone(), i as u64);
    }
    (tree, oracle)
}

fn collect_forward(tree: &Tree<u64>, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Vec<u8>> {
    let mut scan = tree.scan(start, end);
    let mut keys = Vec::new();
    while scan.next() {
        keys.push(scan.key().to_vec());
    }
    keys
}

fn collect_reverse(tree: &Tree<u64>, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Vec<u8>> {
    let mut scan = tree.scan(start, end).reverse();
    let mut keys = Vec::new();
    while scan.next() {
        keys.push(scan.key().to_vec());
    }
    keys
}

// ============================================================================
//  Point operations
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every inserted key resolves to its latest value.
    #[test]
    fn get_matches_oracle(keys in prefix_free_keys(64)) {
        let (tree, oracle) = build(&keys);
        for (key, value) in &oracle {
            prop_assert_eq!(tree.get(key), Some(*value));
        }
    }

    /// Inserting everything and deleting everything leaves nothing.
    #[test]
    fn insert_delete_roundtrip(keys in prefix_free_keys(64)) {
        let (tree, oracle) = build(&keys);
        for key in oracle.keys() {
            tree.remove(key);
            prop_assert_eq!(tree.get(key), None);
        }
        prop_assert!(tree.is_empty());
    }

    /// Deleting half the keys leaves exactly the other half.
    #[test]
    fn partial_delete_keeps_the_rest(keys in prefix_free_keys(64)) {
        let (tree, oracle) = build(&keys);
        for (i, key) in oracle.keys().enumerate() {
            if i % 2 == 0 {
                tree.remove(key);
            }
        }
        for (i, (key, value)) in oracle.iter().enumerate() {
            let want = (i % 2 != 0).then_some(*value);
            prop_assert_eq!(tree.get(key), want);
        }
    }

    /// The structural dump depends only on the operation sequence.
    #[test]
    fn dump_is_deterministic(keys in prefix_free_keys(32)) {
        let (a, _) = build(&keys);
        let (b, _) = build(&keys);
        prop_assert_eq!(a.dump(), b.dump());
    }

    /// A random op interleaving behaves like the map oracle.
    #[test]
    fn ops_match_oracle((pool, ops) in ops_with_pool()) {
        let tree: Tree<u64> = Tree::new();
        let mut oracle: BTreeMap<&[u8], u64> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Insert(i, v) => {
                    tree.insert(&pool[i], v);
                    oracle.insert(&pool[i], v);
                }
                Op::Remove(i) => {
                    tree.remove(&pool[i]);
                    oracle.remove(pool[i].as_slice());
                }
                Op::Get(i) => {
                    prop_assert_eq!(tree.get(&pool[i]), oracle.get(pool[i].as_slice()).copied());
                }
            }
        }
        prop_assert_eq!(tree.is_empty(), oracle.is_empty());
        for (key, value) in oracle {
            prop_assert_eq!(tree.get(key), Some(value));
        }
    }
}

// ============================================================================
//  Iteration
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Unbounded forward iteration emits every key in ascending order;
    /// reverse emits the mirror image.
    #[test]
    fn iteration_is_ordered(keys in prefix_free_keys(64)) {
        let (tree, oracle) = build(&keys);
        let ascending: Vec<Vec<u8>> = oracle.keys().cloned().collect();

        prop_assert_eq!(collect_forward(&tree, None, None), ascending.clone());

        let mut descending = ascending;
        descending.reverse();
        prop_assert_eq!(collect_reverse(&tree, None, None), descending);
    }

    /// Bounded scans emit exactly the oracle's window: forward
    /// `start < k <= end`, reverse `start <= k < end`.
    #[test]
    fn range_scans_match_oracle(
        keys in prefix_free_keys(64),
        start in bound(),
        end in bound(),
    ) {
        let (tree, oracle) = build(&keys);

        let forward_want: Vec<Vec<u8>> = oracle
            .keys()
            .filter(|k| start.as_ref().map_or(true, |s| *k > s))
            .filter(|k| end.as_ref().map_or(true, |e| *k <= e))
            .cloned()
            .collect();
        prop_assert_eq!(
            collect_forward(&tree, start.as_deref(), end.as_deref()),
            forward_want
        );

        let mut reverse_want: Vec<Vec<u8>> = oracle
            .keys()
            .filter(|k| start.as_ref().map_or(true, |s| *k >= s))
            .filter(|k| end.as_ref().map_or(true, |e| *k < e))
            .cloned()
            .collect();
        reverse_want.reverse();
        prop_assert_eq!(
            collect_reverse(&tree, start.as_deref(), end.as_deref()),
            reverse_want
        );
    }
}
