//! Filepath: src/iter.rs
//!
//! Ordered range scans over a live tree.
//!
//! A [`Scan`] walks leaves in key order while writers keep mutating the
//! structure underneath it. It keeps a stack of checkpoints, one per inner
//! node on the current path, each remembering the parent's lock and the
//! version observed on it plus the branch byte the walk last took. Every
//! advance revalidates the top of the stack; on any conflict the deepest
//! checkpoint is discarded and the walk resumes at the nearest ancestor
//! that still validates (re-entering from the tree root if none does).
//! Retired nodes stay readable for the whole scan because the scan pins a
//! reclamation guard.
//!
//! Under concurrent mutation the usual optimistic-scan caveats apply: a key
//! emitted before a racing delete may still be emitted, and a key inserted
//! behind the scan's position is not revisited; keys inserted ahead of the
//! position are observed.
//!
//! # Example
//!
//! ```rust
//! use artree::Tree;
//!
//! let tree = Tree::new();
//! for (i, key) in [b"aa\0", b"ab\0", b"ba\0"].iter().enumerate() {
//!     tree.insert(*key, i);
//! }
//!
//! // `start` is exclusive, `end` inclusive.
//! let mut scan = tree.scan(Some(b"aa\0"), None);
//! let mut seen = Vec::new();
//! while scan.next() {
//!     seen.push(scan.key().to_vec());
//! }
//! assert_eq!(seen, vec![b"ab\0".to_vec(), b"ba\0".to_vec()]);
//!
//! // Reverse flips direction and bound inclusivity.
//! let mut scan = tree.iter().reverse();
//! assert!(scan.next());
//! assert_eq!(scan.key(), b"ba\0");
//! ```

use std::ptr::NonNull;

use seize::LocalGuard;

use crate::node::{Inner, Leaf};
use crate::olock::OLock;
use crate::tracing_helpers::trace_log;
use crate::tree::Tree;

/// One level of the scan's path: an inner node, the lock/version pair of
/// its parent at descent time, and the branch byte last taken out of it.
struct Checkpoint<V> {
    node: NonNull<Inner<V>>,
    parent_lock: NonNull<OLock>,
    parent_version: u64,
    pos: Option<u8>,
}

/// Outcome of one advancement attempt at the top checkpoint.
enum Step {
    /// A leaf in range was stored as the current entry.
    Emitted,
    /// Moved (descended, skipped, or popped an exhausted node); go again.
    Again,
    /// The top checkpoint failed validation; unwind one level.
    Restart,
    /// A leaf past the terminal bound proves the rest is out of range.
    Finished,
}

/// A cursor over the tree's keys in lexicographic order.
///
/// Obtained from [`Tree::iter`] or [`Tree::scan`]; call
/// [`reverse`](Scan::reverse) before the first [`next`](Scan::next) to walk
/// descending. Driving the cursor is single-threaded (`Scan` is not
/// `Send`); the tree itself may be mutated concurrently.
pub struct Scan<'t, V> {
    tree: &'t Tree<V>,
    #[allow(dead_code)] // Pins reclamation for every checkpointed node.
    guard: LocalGuard<'t>,
    stack: Vec<Checkpoint<V>>,
    start: Option<Box<[u8]>>,
    end: Option<Box<[u8]>>,
    /// Last emitted key; the moving, strictly exclusive bound.
    cursor: Option<Box<[u8]>>,
    forward: bool,
    started: bool,
    closed: bool,
    current: Option<NonNull<Leaf<V>>>,
}

impl<'t, V> Scan<'t, V> {
    pub(crate) fn new(tree: &'t Tree<V>, start: Option<&[u8]>, end: Option<&[u8]>) -> Self {
        Self {
            tree,
            guard: tree.collector.enter(),
            stack: Vec::new(),
            start: start.map(Box::from),
            end: end.map(Box::from),
            cursor: start.map(Box::from),
            forward: true,
            started: false,
            closed: false,
            current: None,
        }
    }

    /// Configure the scan to run in descending key order.
    ///
    /// Must be called before the first [`next`](Scan::next). In reverse the
    /// bounds swap roles: `end` becomes the exclusive entry point, `start`
    /// the inclusive terminal bound.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        assert!(!self.started, "reverse() must precede iteration");
        self.forward = false;
        self.cursor = self.end.clone();
        self
    }

    /// Advance to the next key in range. Returns `false` once exhausted.
    pub fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if self.stack.is_empty() {
            self.started = true;
            if let Some(result) = self.init() {
                return result;
            }
        }
        loop {
            if self.stack.is_empty() {
                self.closed = true;
                return false;
            }
            match self.try_advance() {
                Step::Emitted => return true,
                Step::Again => {}
                Step::Finished => {
                    self.closed = true;
                    return false;
                }
                Step::Restart => {
                    trace_log!("scan: checkpoint invalidated, unwinding");
                    self.stack.pop();
                    if self.stack.is_empty() {
                        if let Some(result) = self.init() {
                            return result;
                        }
                    }
                }
            }
        }
    }

    /// The current key, borrowed from its leaf.
    ///
    /// # Panics
    ///
    /// Panics before the first successful [`next`](Scan::next) or after the
    /// scan is exhausted.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        let Some(leaf) = self.current else {
            panic!("scan has no current entry");
        };
        // SAFETY: the guard pins the leaf for the scan's lifetime.
        unsafe { &leaf.as_ref().key }
    }

    /// The current value.
    ///
    /// # Panics
    ///
    /// As for [`key`](Scan::key).
    #[must_use]
    pub fn value(&self) -> &V {
        let Some(leaf) = self.current else {
            panic!("scan has no current entry");
        };
        // SAFETY: the guard pins the leaf for the scan's lifetime.
        unsafe { &leaf.as_ref().value }
    }

    /// (Re-)enter the tree from the root. `Some(done)` is a terminal
    /// answer (empty tree or leaf root); `None` means a root checkpoint
    /// was pushed.
    fn init(&mut self) -> Option<bool> {
        loop {
            let (version, _) = self.tree.lock.read_lock();
            let root = self.tree.root();
            match root {
                None => {
                    if self.tree.lock.read_unlock(version, None) {
                        continue;
                    }
                    self.closed = true;
                    return Some(false);
                }
                Some(root) if root.is_leaf() => {
                    if self.tree.lock.read_unlock(version, None) {
                        continue;
                    }
                    self.closed = true;
                    // SAFETY: the guard pins the leaf.
                    let leaf = unsafe { root.as_leaf() };
                    if self.admits(&leaf.key) {
                        self.current = NonNull::new(root.leaf_ptr());
                        return Some(true);
                    }
                    return Some(false);
                }
                Some(root) => {
                    self.stack.push(Checkpoint {
                        // SAFETY: an inner reference is never null.
                        node: unsafe { NonNull::new_unchecked(root.inner_ptr()) },
                        parent_lock: NonNull::from(&self.tree.lock),
                        parent_version: version,
                        pos: None,
                    });
                    return None;
                }
            }
        }
    }

    fn try_advance(&mut self) -> Step {
        loop {
            let top = self.stack.len() - 1;
            let (node, parent_lock, parent_version, pos) = {
                let cp = &self.stack[top];
                (cp.node, cp.parent_lock, cp.parent_version, cp.pos)
            };
            // SAFETY: the guard pins checkpointed nodes, even once retired.
            let inner = unsafe { node.as_ref() };

            let (version, obsolete) = inner.lock.read_lock();
            // SAFETY: parent_lock outlives the scan (tree lock or a pinned
            // node's lock).
            if obsolete || unsafe { parent_lock.as_ref() }.check(parent_version) {
                return Step::Restart;
            }

            // SAFETY: layout pinned by the guard; staleness revalidated via
            // the version on the next advance.
            let step = unsafe {
                if self.forward {
                    inner.inode().next(pos)
                } else {
                    inner.inode().prev(pos)
                }
            };
            let Some((branch, child)) = step else {
                if inner.lock.read_unlock(version, None) {
                    continue;
                }
                // Exhausted; resume at the parent checkpoint.
                self.stack.pop();
                return Step::Again;
            };

            self.stack[top].pos = Some(branch);
            if child.is_leaf() {
                // SAFETY: the guard pins the leaf.
                let leaf = unsafe { child.as_leaf() };
                if self.admits(&leaf.key) {
                    self.cursor = Some(leaf.key.clone());
                    self.current = NonNull::new(child.leaf_ptr());
                    return Step::Emitted;
                }
                if self.overshoots(&leaf.key) {
                    return Step::Finished;
                }
                return Step::Again;
            }

            self.stack.push(Checkpoint {
                // SAFETY: an inner reference is never null.
                node: unsafe { NonNull::new_unchecked(child.inner_ptr()) },
                parent_lock: NonNull::from(&inner.lock),
                parent_version: version,
                pos: None,
            });
            return Step::Again;
        }
    }

    /// Is `key` inside the half-open window between the moving cursor and
    /// the terminal bound?
    fn admits(&self, key: &[u8]) -> bool {
        let past_cursor = match self.cursor.as_deref() {
            None => true,
            Some(cursor) => {
                if self.forward {
                    key > cursor
                } else {
                    key < cursor
                }
            }
        };
        let within_bound = if self.forward {
            self.end.as_deref().map_or(true, |end| key <= end)
        } else {
            self.start.as_deref().map_or(true, |start| key >= start)
        };
        past_cursor && within_bound
    }

    /// Is `key` past the terminal bound? Traversal order makes everything
    /// after it out of range as well.
    fn overshoots(&self, key: &[u8]) -> bool {
        if self.forward {
            self.end.as_deref().is_some_and(|end| key > end)
        } else {
            self.start.as_deref().is_some_and(|start| key < start)
        }
    }
}
