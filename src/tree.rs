//! Filepath: src/tree.rs
//!
//! The tree facade: root ownership, point operations, structural dump.
//!
//! [`Tree`] owns the root reference and a root [`OLock`] covering it, plus
//! the `seize` collector that defers freeing of unlinked nodes until no
//! optimistic reader can still validate against them. All operations take
//! `&self` and may be called from any number of threads.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use seize::{Collector, Guard as _, LocalGuard};

use crate::iter::Scan;
use crate::node::{leaf_insert, walk_node, Leaf, LeafInsert, Lookup, NodeRef};
use crate::olock::OLock;
use crate::reclaim::{free_subtree, retire_leaf};

/// A concurrent ordered map from byte strings to values.
///
/// The index is an adaptive radix tree: inner nodes pick one of four
/// layouts to match their fan-out, single-child runs are path-compressed,
/// and leaves are created lazily when keys diverge. Readers are optimistic
/// (no locks, restart on version conflict); writers lock at most two nodes
/// on one path.
///
/// # Keys
///
/// Keys are arbitrary byte strings of length >= 1, copied on insert. No key
/// may be a proper prefix of another key in the same tree; callers arrange
/// this with a terminator byte (e.g. `\0`) or fixed-length encodings.
/// Violations leave lookups and iteration undefined for the affected keys
/// and may panic, but never corrupt the structure.
///
/// # Values
///
/// Values are stored inline in leaves and never mutated in place; an insert
/// over an existing key replaces the whole leaf. Reads hand out `&V` tied
/// to a [`guard`](Tree::guard), or clones via [`get`](Tree::get). Wrap
/// large values in `Arc` to make cloning cheap.
///
/// # Example
///
/// ```rust
/// use artree::Tree;
///
/// let tree = Tree::new();
/// tree.insert(b"hello\0", 1u64);
/// tree.insert(b"world\0", 2);
///
/// assert_eq!(tree.get(b"hello\0"), Some(1));
/// assert_eq!(tree.get(b"missing\0"), None);
///
/// tree.remove(b"hello\0");
/// assert_eq!(tree.get(b"hello\0"), None);
/// ```
pub struct Tree<V> {
    pub(crate) lock: OLock,
    root: AtomicUsize,
    pub(crate) collector: Collector,
    _marker: PhantomData<V>,
}

// SAFETY: the tree owns its nodes and values; all shared mutation goes
// through the lock/version protocol and seize defers reclamation.
unsafe impl<V: Send> Send for Tree<V> {}
// SAFETY: as above; handing out `&V` across threads additionally needs
// `V: Sync`, inserting through `&self` needs `V: Send`.
unsafe impl<V: Send + Sync> Sync for Tree<V> {}

impl<V> Default for Tree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Tree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<V> Tree<V> {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: OLock::new(),
            root: AtomicUsize::new(0),
            collector: Collector::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn root(&self) -> Option<NodeRef<V>> {
        NodeRef::from_bits(self.root.load(Ordering::Acquire))
    }

    /// Requires the root lock (write) or exclusive ownership.
    pub(crate) fn set_root(&self, root: Option<NodeRef<V>>) {
        self.root
            .store(root.map_or(0, NodeRef::bits), Ordering::Release);
    }

    /// `true` when the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root().is_none()
    }

    /// Pin this thread for reads; see [`get_with_guard`](Self::get_with_guard).
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Insert `key` with `value`, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty, or on a key that is a proper prefix of an
    /// existing key (see the type-level docs).
    pub fn insert(&self, key: &[u8], value: V) {
        assert!(!key.is_empty(), "keys must have length >= 1");
        let guard = self.collector.enter();
        let leaf = NodeRef::from_leaf(Box::new(Leaf::new(key, value)));

        loop {
            let (version, _) = self.lock.read_lock();
            match self.root() {
                None => {
                    if self.lock.upgrade(version, None) {
                        continue;
                    }
                    self.set_root(Some(leaf));
                    self.lock.unlock();
                    return;
                }
                Some(root) if root.is_leaf() => {
                    if self.lock.upgrade(version, None) {
                        continue;
                    }
                    // SAFETY: root lock held; guard pins the old leaf.
                    match unsafe { leaf_insert(root, leaf, key, 0) } {
                        LeafInsert::Updated(replacement) => {
                            self.set_root(Some(replacement));
                            self.lock.unlock();
                            // SAFETY: unlinked under the root lock above.
                            unsafe { retire_leaf(&guard, root) };
                        }
                        LeafInsert::Expanded(replacement) => {
                            self.set_root(Some(replacement));
                            self.lock.unlock();
                        }
                    }
                    return;
                }
                Some(root) => {
                    // SAFETY: guard held across the descent.
                    let restart = unsafe {
                        root.as_inner()
                            .insert(leaf, key, 0, &self.lock, version, &guard)
                    };
                    if restart {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Look up `key`, cloning the value out.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        let guard = self.collector.enter();
        self.get_with_guard(key, &guard).cloned()
    }

    /// Look up `key`, borrowing the value for as long as `guard` is held.
    ///
    /// The guard must come from [`guard`](Self::guard) on this tree.
    #[must_use]
    pub fn get_with_guard<'g>(&self, key: &[u8], guard: &'g LocalGuard<'_>) -> Option<&'g V> {
        debug_assert!(guard.collector() == &self.collector);

        loop {
            let (version, _) = self.lock.read_lock();
            let root = self.root();
            if self.lock.read_unlock(version, None) {
                continue;
            }
            match root {
                None => return None,
                Some(root) if root.is_leaf() => {
                    // SAFETY: the root pointer was validated above and the
                    // guard pins the leaf.
                    let leaf = unsafe { root.as_leaf() };
                    return leaf.matches(key).then_some(&leaf.value);
                }
                Some(root) => {
                    // SAFETY: guard held across the descent.
                    match unsafe { root.as_inner().get(key, 0, &self.lock, version) } {
                        Lookup::Restart => continue,
                        // SAFETY: guard pins the leaf for 'g.
                        Lookup::Found(leaf) => return Some(unsafe { &(*leaf).value }),
                        Lookup::Missing => return None,
                    }
                }
            }
        }
    }

    /// Remove `key` if present; absence is a no-op.
    pub fn remove(&self, key: &[u8]) {
        let guard = self.collector.enter();

        loop {
            let (version, _) = self.lock.read_lock();
            match self.root() {
                None => {
                    if self.lock.read_unlock(version, None) {
                        continue;
                    }
                    return;
                }
                Some(root) if root.is_leaf() => {
                    // SAFETY: guard pins the leaf.
                    if unsafe { root.as_leaf() }.matches(key) {
                        if self.lock.upgrade(version, None) {
                            continue;
                        }
                        self.set_root(None);
                        self.lock.unlock();
                        // SAFETY: unlinked under the root lock above.
                        unsafe { retire_leaf(&guard, root) };
                    } else if self.lock.read_unlock(version, None) {
                        continue;
                    }
                    return;
                }
                Some(root) => {
                    let replace_root = |replacement: NodeRef<V>| {
                        // Invoked while the collapsing child holds our root
                        // lock (upgraded from `version`).
                        self.set_root(Some(replacement));
                    };
                    // SAFETY: guard held across the descent.
                    let restart = unsafe {
                        root.as_inner()
                            .remove(key, 0, &self.lock, version, &replace_root, &guard)
                    };
                    if restart {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Iterate the whole tree in ascending key order.
    #[must_use]
    pub fn iter(&self) -> Scan<'_, V> {
        self.scan(None, None)
    }

    /// Iterate keys in `start < k <= end` in ascending order (either bound
    /// may be absent). [`Scan::reverse`] flips the direction, after which
    /// the bounds read `start <= k < end` descending.
    #[must_use]
    pub fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Scan<'_, V> {
        Scan::new(self, start, end)
    }

    /// Render the structure, one node per line: depth dots (one per prefix
    /// byte consumed, plus one per branch), then `leaf[<hex key>]` or
    /// `inner[<hex prefix>]n<capacity>[<hex child bytes>]`.
    ///
    /// Diagnostic only: the tree must be quiescent while this runs.
    #[must_use]
    pub fn dump(&self) -> String {
        let Some(root) = self.root() else {
            return String::new();
        };
        let mut out = String::new();
        let mut render = |node: NodeRef<V>, depth: usize| {
            if !out.is_empty() {
                out.push('\n');
            }
            for _ in 0..depth {
                out.push('.');
            }
            // SAFETY: quiescence is the documented requirement.
            unsafe { node.write_repr(&mut out) };
            true
        };
        // SAFETY: as above.
        unsafe { walk_node(root, 0, &mut render) };
        out
    }
}

impl<V> Drop for Tree<V> {
    fn drop(&mut self) {
        if let Some(root) = self.root() {
            // SAFETY: `&mut self` proves no concurrent access; retired
            // nodes are disjoint from the reachable subtree and are freed
            // by the collector's own drop.
            unsafe { free_subtree(root) };
        }
    }
}
