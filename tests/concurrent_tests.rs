//! Concurrency tests: contended updates, disjoint insert/delete, single-key
//! linearizability, and scans racing writers.
//!
//! These are probabilistic by nature; they run enough operations that the
//! interesting interleavings (restarts, splits under contention, collapse
//! racing a scan) show up reliably in practice.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use artree::Tree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn keyed(prefix: u8, i: u64) -> [u8; 9] {
    let mut key = [prefix; 9];
    key[1..].copy_from_slice(&i.to_be_bytes());
    key
}

// =============================================================================
// Contended writers
// =============================================================================

#[test]
fn concurrent_updates_to_sibling_keys() {
    common::init_tracing();
    const UPDATES: u64 = 1_000;
    let keys: [&[u8]; 5] = [b"aabd", b"aabe", b"abcd", b"aedd", b"aqdd"];
    let tree: Tree<u64> = Tree::new();

    thread::scope(|s| {
        for key in keys {
            let tree = &tree;
            s.spawn(move || {
                for i in 1..=UPDATES {
                    tree.insert(key, i);
                }
            });
        }
    });

    for key in keys {
        assert_eq!(tree.get(key), Some(UPDATES), "key {key:?}");
    }
}

#[test]
fn concurrent_disjoint_inserts_all_land() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 2_000;
    let tree: Tree<u64> = Tree::new();

    thread::scope(|s| {
        for t in 0..THREADS {
            let tree = &tree;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = keyed(t as u8, i);
                    tree.insert(&key, t * PER_THREAD + i);
                }
            });
        }
    });

    let mut missing = 0;
    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = keyed(t as u8, i);
            if tree.get(&key) != Some(t * PER_THREAD + i) {
                missing += 1;
            }
        }
    }
    assert_eq!(missing, 0);
}

#[test]
fn concurrent_deletes_empty_the_tree() {
    const WORKERS: usize = 8;
    let mut rng = StdRng::seed_from_u64(42);
    let mut unique = HashSet::new();
    while unique.len() < 10_000 {
        let mut key = [0u8; 10];
        rng.fill(&mut key[..]);
        unique.insert(key);
    }
    let keys: Vec<[u8; 10]> = unique.into_iter().collect();

    let tree: Tree<u64> = Tree::new();
    for key in &keys {
        tree.insert(key, 0);
    }

    thread::scope(|s| {
        for chunk in keys.chunks(keys.len() / WORKERS + 1) {
            let tree = &tree;
            s.spawn(move || {
                for key in chunk {
                    tree.remove(key);
                }
            });
        }
    });

    assert!(tree.is_empty());
}

#[test]
fn disjoint_insert_and_delete_do_not_interfere() {
    const COUNT: u64 = 3_000;
    let tree: Tree<u64> = Tree::new();
    for i in 0..COUNT {
        tree.insert(&keyed(0xBB, i), i);
    }

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..COUNT {
                tree.insert(&keyed(0xAA, i), i);
            }
        });
        s.spawn(|| {
            for i in 0..COUNT {
                tree.remove(&keyed(0xBB, i));
            }
        });
    });

    for i in 0..COUNT {
        assert_eq!(tree.get(&keyed(0xAA, i)), Some(i), "inserted key lost");
        assert_eq!(tree.get(&keyed(0xBB, i)), None, "deleted key survived");
    }
}

#[test]
fn mixed_random_insert_delete_settles_clean() {
    const OPS: usize = 5_000;
    let mut rng = StdRng::seed_from_u64(0xfeed);
    let pool: Vec<[u8; 8]> = (0..100)
        .map(|_| {
            let mut key = [0u8; 8];
            rng.fill(&mut key[..]);
            key
        })
        .collect();

    let tree: Tree<u64> = Tree::new();
    thread::scope(|s| {
        let pool = &pool;
        let tree = &tree;
        s.spawn(move || {
            let mut rng = StdRng::seed_from_u64(1);
            for _ in 0..OPS {
                let key = &pool[rng.gen_range(0..pool.len())];
                tree.insert(key, 1);
            }
        });
        s.spawn(move || {
            let mut rng = StdRng::seed_from_u64(2);
            for _ in 0..OPS {
                let key = &pool[rng.gen_range(0..pool.len())];
                tree.remove(key);
            }
        });
    });

    for key in &pool {
        tree.remove(key);
    }
    for key in &pool {
        assert_eq!(tree.get(key), None);
    }
    assert!(tree.is_empty());
}

// =============================================================================
// Single-key linearizability
// =============================================================================

#[test]
fn single_key_reads_are_monotone() {
    const KEY: &[u8] = b"counter\0";
    const UPDATES: u64 = 20_000;

    let tree: Tree<u64> = Tree::new();
    tree.insert(KEY, 0);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=UPDATES {
                tree.insert(KEY, i);
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            // A writer that replaces values 0..=N in order must never be
            // observed going backwards, and never absent.
            let mut last = 0;
            while !done.load(Ordering::Acquire) {
                let value = tree.get(KEY).expect("key is never deleted");
                assert!(value >= last, "read {value} after having read {last}");
                last = value;
            }
            assert!(last <= UPDATES);
        });
    });

    assert_eq!(tree.get(KEY), Some(UPDATES));
}

// =============================================================================
// Scans racing writers
// =============================================================================

#[test]
fn scan_observes_expansion_ahead_of_it() {
    let tree: Tree<u64> = Tree::new();
    tree.insert(b"aaba", 1);
    tree.insert(b"aabb", 2);

    let mut scan = tree.iter();
    assert!(scan.next());
    assert_eq!(scan.key(), b"aaba");

    // Splits the root prefix while the scan holds a checkpoint on it.
    tree.insert(b"aaca", 3);

    assert!(scan.next());
    assert_eq!(scan.key(), b"aabb");
    assert!(scan.next());
    assert_eq!(scan.key(), b"aaca");
    assert!(!scan.next());
}

#[test]
fn scan_stays_sorted_under_concurrent_inserts() {
    const COUNT: u64 = 4_000;
    let tree: Tree<u64> = Tree::new();
    for i in (0..COUNT).step_by(2) {
        tree.insert(&keyed(0x01, i), i);
    }

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for i in (1..COUNT).step_by(2) {
                tree.insert(&keyed(0x01, i), i);
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let mut scan = tree.iter();
                let mut last: Option<Vec<u8>> = None;
                while scan.next() {
                    let key = scan.key().to_vec();
                    if let Some(prev) = &last {
                        assert!(*prev < key, "scan emitted {prev:02x?} then {key:02x?}");
                    }
                    last = Some(key);
                }
            }
        });
    });

    // Everything that was ever inserted is present at quiescence.
    let mut scan = tree.iter();
    let mut count = 0;
    while scan.next() {
        count += 1;
    }
    assert_eq!(count, COUNT);
}

#[test]
fn scan_stays_sorted_under_concurrent_deletes() {
    const COUNT: u64 = 4_000;
    let tree: Tree<u64> = Tree::new();
    for i in 0..COUNT {
        tree.insert(&keyed(0x02, i), i);
    }

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for i in (0..COUNT).step_by(3) {
                tree.remove(&keyed(0x02, i));
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let mut scan = tree.iter();
                let mut last: Option<Vec<u8>> = None;
                while scan.next() {
                    let key = scan.key().to_vec();
                    if let Some(prev) = &last {
                        assert!(*prev < key, "scan emitted {prev:02x?} then {key:02x?}");
                    }
                    last = Some(key);
                }
            }
        });
    });

    for i in 0..COUNT {
        let want = (i % 3 != 0).then_some(i);
        assert_eq!(tree.get(&keyed(0x02, i)), want);
    }
}
