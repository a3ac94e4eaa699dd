//! Filepath: src/node.rs
//!
//! Tree nodes and the optimistic descent protocols.
//!
//! A node is either a [`Leaf`] (the full key plus its value, immutable once
//! published) or an [`Inner`] (an [`OLock`], a compressed prefix of up to
//! [`MAX_PREFIX`] bytes, and one of the four fan-out layouts). Parents refer
//! to children through [`NodeRef`], a tagged pointer whose low bit
//! distinguishes the two.
//!
//! # Lock coupling
//!
//! Descents carry the parent's lock and the version observed on it. A child
//! first snapshots its own version, then checks the parent's; any mismatch
//! aborts the descent and the caller restarts from its own loop. Writers
//! upgrade exactly one node (plus its parent for a prefix split or a
//! collapse, always parent first) at the single mutation point, so the tree
//! never holds more than two write locks on one path.
//!
//! # Why reads here are raw
//!
//! An optimistic reader runs concurrently with a writer that holds the
//! node's lock. Every field a reader touches is either an atomic word
//! (prefix, layout pointer) or memory the writer only replaces wholesale
//! (leaves, retired layouts), and every conclusion drawn from such a read
//! is discarded unless the version check afterwards passes.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use seize::LocalGuard;

use crate::inode::{IKind, INodePtr};
use crate::olock::OLock;
use crate::reclaim::{retire_inner, retire_inode, retire_leaf};
use crate::tracing_helpers::{debug_log, trace_log};

/// Bytes of path-compressed prefix stored inline on an inner node.
pub(crate) const MAX_PREFIX: usize = 8;

/// Count of equal bytes at the given offsets of two keys, capped at
/// [`MAX_PREFIX`].
pub(crate) fn compare_prefix(k1: &[u8], k2: &[u8], off1: usize, off2: usize) -> usize {
    let a = &k1[off1.min(k1.len())..];
    let b = &k2[off2.min(k2.len())..];
    a.iter()
        .zip(b)
        .take(MAX_PREFIX)
        .take_while(|(x, y)| x == y)
        .count()
}

// ============================================================================
//  Leaf
// ============================================================================

/// Terminal node: the full key bytes and the value.
pub(crate) struct Leaf<V> {
    pub(crate) key: Box<[u8]>,
    pub(crate) value: V,
}

impl<V> Leaf<V> {
    pub(crate) fn new(key: &[u8], value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub(crate) fn matches(&self, key: &[u8]) -> bool {
        &*self.key == key
    }
}

// ============================================================================
//  NodeRef
// ============================================================================

const LEAF_BIT: usize = 0b1;

/// Tagged pointer to a [`Leaf`] or an [`Inner`]; bit 0 marks a leaf.
///
/// Plain `Copy` data. Dereferencing is the caller's responsibility: the
/// pointee lives as long as a reclamation guard pins it or the tree owns it
/// exclusively.
pub(crate) struct NodeRef<V> {
    bits: NonNull<u8>,
    _marker: PhantomData<V>,
}

impl<V> Clone for NodeRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for NodeRef<V> {}

impl<V> NodeRef<V> {
    pub(crate) fn from_leaf(leaf: Box<Leaf<V>>) -> Self {
        let addr = Box::into_raw(leaf) as usize;
        debug_assert_eq!(addr & LEAF_BIT, 0);
        // SAFETY: a Box address is never zero.
        let bits = unsafe { NonNull::new_unchecked((addr | LEAF_BIT) as *mut u8) };
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_inner(inner: Box<Inner<V>>) -> Self {
        let addr = Box::into_raw(inner) as usize;
        debug_assert_eq!(addr & LEAF_BIT, 0);
        // SAFETY: a Box address is never zero.
        let bits = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_bits(bits: usize) -> Option<Self> {
        Some(Self {
            bits: NonNull::new(bits as *mut u8)?,
            _marker: PhantomData,
        })
    }

    pub(crate) fn bits(self) -> usize {
        self.bits.as_ptr() as usize
    }

    pub(crate) fn is_leaf(self) -> bool {
        self.bits() & LEAF_BIT != 0
    }

    pub(crate) fn leaf_ptr(self) -> *mut Leaf<V> {
        debug_assert!(self.is_leaf());
        (self.bits() & !LEAF_BIT) as *mut Leaf<V>
    }

    pub(crate) fn inner_ptr(self) -> *mut Inner<V> {
        debug_assert!(!self.is_leaf());
        self.bits() as *mut Inner<V>
    }

    /// # Safety
    ///
    /// Must be a leaf reference, alive for `'a`.
    pub(crate) unsafe fn as_leaf<'a>(self) -> &'a Leaf<V> {
        // SAFETY: alive per contract.
        unsafe { &*self.leaf_ptr() }
    }

    /// # Safety
    ///
    /// Must be an inner reference, alive for `'a`.
    pub(crate) unsafe fn as_inner<'a>(self) -> &'a Inner<V> {
        // SAFETY: alive per contract.
        unsafe { &*self.inner_ptr() }
    }

    /// Append this node's structural representation (the `dump()` format).
    ///
    /// # Safety
    ///
    /// The node must be alive and quiescent.
    pub(crate) unsafe fn write_repr(self, out: &mut String) {
        use std::fmt::Write as _;

        if self.is_leaf() {
            // SAFETY: alive per contract.
            let leaf = unsafe { self.as_leaf() };
            out.push_str("leaf[");
            for byte in leaf.key.iter() {
                let _ = write!(out, "{byte:02x}");
            }
            out.push(']');
        } else {
            // SAFETY: alive per contract.
            let inner = unsafe { self.as_inner() };
            let (prefix, len) = inner.prefix();
            out.push_str("inner[");
            for byte in &prefix[..len.min(MAX_PREFIX)] {
                let _ = write!(out, "{byte:02x}");
            }
            out.push(']');
            // SAFETY: quiescent per contract.
            unsafe { inner.inode().write_repr(out) };
        }
    }
}

/// Depth-first visit of a subtree: the node itself, then its children in
/// key order, with `depth` advancing by `prefix_len + 1` per inner node.
/// Stops early when `f` returns false.
///
/// # Safety
///
/// The subtree must be alive and quiescent.
pub(crate) unsafe fn walk_node<V>(
    node: NodeRef<V>,
    depth: usize,
    f: &mut dyn FnMut(NodeRef<V>, usize) -> bool,
) -> bool {
    if !f(node, depth) {
        return false;
    }
    if node.is_leaf() {
        return true;
    }
    // SAFETY: alive and quiescent per contract.
    let inner = unsafe { node.as_inner() };
    let (_, len) = inner.prefix();
    let child_depth = depth + len + 1;
    let mut visit = |child: NodeRef<V>| {
        // SAFETY: children share the subtree's liveness and quiescence.
        unsafe { walk_node(child, child_depth, &mut *f) }
    };
    // SAFETY: as above.
    unsafe { inner.inode().for_each_child(&mut visit) }
}

// ============================================================================
//  Inner
// ============================================================================

/// Branching node: optimistic lock, compressed prefix, and one fan-out
/// layout.
///
/// The prefix bytes, the prefix length, and the layout pointer each live in
/// one atomic word so a racing reader always sees whole values; mutual
/// consistency between the words is what the version protocol provides.
pub(crate) struct Inner<V> {
    pub(crate) lock: OLock,
    prefix_bits: AtomicU64,
    prefix_len: AtomicUsize,
    inode_bits: AtomicUsize,
    _marker: PhantomData<V>,
}

/// Outcome of an optimistic point lookup.
pub(crate) enum Lookup<V> {
    Found(*const Leaf<V>),
    Missing,
    Restart,
}

/// Outcome of inserting into an existing leaf.
pub(crate) enum LeafInsert<V> {
    /// Same key: the new leaf supersedes the old one.
    Updated(NodeRef<V>),
    /// Different key: root of the expansion chain holding both leaves.
    Expanded(NodeRef<V>),
}

impl<V> Inner<V> {
    pub(crate) fn alloc(prefix: [u8; MAX_PREFIX], len: usize, inode: INodePtr<V>) -> Box<Self> {
        debug_assert!(len <= MAX_PREFIX);
        Box::new(Self {
            lock: OLock::new(),
            prefix_bits: AtomicU64::new(u64::from_ne_bytes(prefix)),
            prefix_len: AtomicUsize::new(len),
            inode_bits: AtomicUsize::new(inode.bits()),
            _marker: PhantomData,
        })
    }

    pub(crate) fn prefix(&self) -> ([u8; MAX_PREFIX], usize) {
        let bytes = self.prefix_bits.load(Ordering::Acquire).to_ne_bytes();
        let len = self.prefix_len.load(Ordering::Acquire);
        (bytes, len)
    }

    /// Requires the write lock (or exclusive ownership before publication).
    pub(crate) fn set_prefix(&self, prefix: [u8; MAX_PREFIX], len: usize) {
        debug_assert!(len <= MAX_PREFIX);
        self.prefix_bits
            .store(u64::from_ne_bytes(prefix), Ordering::Release);
        self.prefix_len.store(len, Ordering::Release);
    }

    pub(crate) fn inode(&self) -> INodePtr<V> {
        INodePtr::from_bits(self.inode_bits.load(Ordering::Acquire))
    }

    /// Requires the write lock.
    pub(crate) fn set_inode(&self, inode: INodePtr<V>) {
        self.inode_bits.store(inode.bits(), Ordering::Release);
    }

    // ========================================================================
    //  Get
    // ========================================================================

    /// Optimistic point lookup below this node.
    ///
    /// `parent_version` was observed on `parent` before this node was
    /// reached; it is re-checked against the parent so a concurrent
    /// restructure above us cannot hand back a stale answer.
    ///
    /// # Safety
    ///
    /// Caller holds a guard of the owning tree's collector for the whole
    /// call.
    pub(crate) unsafe fn get(
        &self,
        key: &[u8],
        depth: usize,
        parent: &OLock,
        parent_version: u64,
    ) -> Lookup<V> {
        loop {
            let (version, obsolete) = self.lock.read_lock();
            if obsolete || parent.read_unlock(parent_version, None) {
                trace_log!(depth, "get: restart, node obsolete or parent moved");
                return Lookup::Restart;
            }

            let (prefix, len) = self.prefix();
            let stored = len.min(MAX_PREFIX);
            let cmp = compare_prefix(&prefix[..stored], key, 0, depth);
            if cmp < stored {
                if self.lock.read_unlock(version, None) {
                    continue;
                }
                return Lookup::Missing;
            }

            let next_depth = depth + len;
            // SAFETY: layout pinned by the guard; validated below.
            let child = unsafe { self.inode().child(key[next_depth]) };
            let Some((_, child)) = child else {
                if self.lock.read_unlock(version, None) {
                    continue;
                }
                return Lookup::Missing;
            };

            if child.is_leaf() {
                let leaf = child.leaf_ptr();
                // SAFETY: leaf memory pinned by the guard.
                let found = unsafe { (*leaf).matches(key) };
                if self.lock.read_unlock(version, None) {
                    continue;
                }
                return if found {
                    Lookup::Found(leaf)
                } else {
                    Lookup::Missing
                };
            }

            // SAFETY: same guard covers the recursion.
            match unsafe { child.as_inner().get(key, next_depth + 1, &self.lock, version) } {
                Lookup::Restart => continue,
                done => return done,
            }
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert `new_leaf` (whose key is `key`) below this node.
    ///
    /// Returns `true` when the caller must restart its own descent: this
    /// node went obsolete or the parent's version moved at a point where
    /// only the caller can safely re-walk.
    ///
    /// # Safety
    ///
    /// Caller holds a guard of the owning tree's collector; `key` is the
    /// byte string stored in `new_leaf`; `new_leaf` is unpublished.
    pub(crate) unsafe fn insert(
        &self,
        new_leaf: NodeRef<V>,
        key: &[u8],
        depth: usize,
        parent: &OLock,
        parent_version: u64,
        guard: &LocalGuard<'_>,
    ) -> bool {
        loop {
            let (version, obsolete) = self.lock.read_lock();
            if obsolete {
                return true;
            }

            let (prefix, len) = self.prefix();
            let stored = len.min(MAX_PREFIX);
            let cmp = compare_prefix(&prefix[..stored], key, 0, depth);
            if cmp < len {
                // Prefix split. The parent lock is required as well: a
                // concurrent collapse would otherwise fold a stale prefix
                // into this node while we rewrite it.
                if parent.upgrade(parent_version, None) {
                    return true;
                }
                if self.lock.upgrade(version, Some(parent)) {
                    return true;
                }

                let mut tail = [0u8; MAX_PREFIX];
                let tail_len = len - cmp - 1;
                tail[..tail_len].copy_from_slice(&prefix[cmp + 1..len]);
                let child = Inner::alloc(tail, tail_len, self.inode());

                let split = INodePtr::alloc_n4();
                // SAFETY: `split` is unpublished; exclusive access.
                unsafe {
                    split.add_child(key[depth + cmp], new_leaf);
                    split.add_child(prefix[cmp], NodeRef::from_inner(child));
                }
                self.set_inode(split);
                self.set_prefix(prefix, cmp);
                debug_log!(depth, kept = cmp, "insert: prefix split");

                self.lock.unlock();
                parent.unlock();
                return false;
            }

            let next_depth = depth + len;
            let branch = key[next_depth];
            // SAFETY: layout pinned by the guard; validated by upgrade or
            // read_unlock below.
            match unsafe { self.inode().child(branch) } {
                None => {
                    if self.lock.upgrade(version, None) {
                        continue;
                    }
                    if parent.read_unlock(parent_version, Some(&self.lock)) {
                        return true;
                    }
                    let inode = self.inode();
                    // SAFETY: write lock held.
                    unsafe {
                        if inode.full() {
                            let grown = inode.grow();
                            self.set_inode(grown);
                            retire_inode(guard, inode);
                            debug_log!(depth, "insert: layout grown");
                            grown.add_child(branch, new_leaf);
                        } else {
                            inode.add_child(branch, new_leaf);
                        }
                    }
                    self.lock.unlock();
                    return false;
                }
                Some((idx, child)) => {
                    if parent.read_unlock(parent_version, None) {
                        return true;
                    }
                    if child.is_leaf() {
                        if self.lock.upgrade(version, None) {
                            continue;
                        }
                        // SAFETY: write lock held; guard pins the old leaf.
                        unsafe {
                            match leaf_insert(child, new_leaf, key, next_depth + 1) {
                                LeafInsert::Updated(replacement) => {
                                    self.inode().replace(idx, Some(replacement));
                                    retire_leaf(guard, child);
                                }
                                LeafInsert::Expanded(replacement) => {
                                    self.inode().replace(idx, Some(replacement));
                                }
                            }
                        }
                        self.lock.unlock();
                        return false;
                    }
                    // SAFETY: same guard covers the recursion.
                    let restart = unsafe {
                        child.as_inner().insert(
                            new_leaf,
                            key,
                            next_depth + 1,
                            &self.lock,
                            version,
                            guard,
                        )
                    };
                    if restart {
                        continue;
                    }
                    return false;
                }
            }
        }
    }

    // ========================================================================
    //  Delete
    // ========================================================================

    /// Remove `key` below this node. `replace_parent` rewrites the slot in
    /// the parent that points at this node; it is only invoked while the
    /// parent's write lock is held (collapse).
    ///
    /// Returns `true` when the caller must restart its own descent.
    ///
    /// # Safety
    ///
    /// Caller holds a guard of the owning tree's collector.
    pub(crate) unsafe fn remove(
        &self,
        key: &[u8],
        depth: usize,
        parent: &OLock,
        parent_version: u64,
        replace_parent: &dyn Fn(NodeRef<V>),
        guard: &LocalGuard<'_>,
    ) -> bool {
        loop {
            let (version, obsolete) = self.lock.read_lock();
            if obsolete || parent.check(parent_version) {
                return true;
            }

            let (prefix, len) = self.prefix();
            let stored = len.min(MAX_PREFIX);
            let cmp = compare_prefix(&prefix[..stored], key, 0, depth);
            if cmp < stored {
                // Key absent; certainty requires both versions to hold.
                if self.lock.read_unlock(version, None) {
                    continue;
                }
                return parent.read_unlock(parent_version, None);
            }

            let next_depth = depth + len;
            let branch = key[next_depth];
            let inode = self.inode();
            // SAFETY: layout pinned by the guard; validated below.
            let Some((idx, child)) = (unsafe { inode.child(branch) }) else {
                if self.lock.read_unlock(version, None) {
                    continue;
                }
                return parent.read_unlock(parent_version, None);
            };

            if child.is_leaf() {
                // SAFETY: leaf memory pinned by the guard.
                if !unsafe { child.as_leaf() }.matches(key) {
                    if self.lock.read_unlock(version, None) {
                        continue;
                    }
                    return parent.read_unlock(parent_version, None);
                }

                // SAFETY: layout pinned by the guard; any staleness is
                // caught by the upgrade CAS below.
                let (kind, at_min) = unsafe { (inode.kind(), inode.is_min()) };
                if kind == IKind::N4 && at_min && len < MAX_PREFIX {
                    // The node is about to hold a single child: collapse it
                    // into that child and rewrite the parent's slot.
                    if parent.upgrade(parent_version, None) {
                        return true;
                    }
                    if self.lock.upgrade(version, Some(parent)) {
                        return true;
                    }

                    // SAFETY: write lock held; guard pins the dead leaf.
                    let survivor = unsafe {
                        inode.replace(idx, None);
                        retire_leaf(guard, child);
                        inode.next(None)
                    };
                    let Some((survivor_byte, survivor)) = survivor else {
                        unreachable!("collapse of a node with no surviving child")
                    };

                    let mut merged = prefix;
                    merged[len] = survivor_byte;
                    // SAFETY: parent and self write locks held; survivor is
                    // locked inside while its prefix moves.
                    let replacement = unsafe { inherit_into(survivor, merged, len + 1) };
                    replace_parent(replacement);
                    debug_log!(depth, "remove: collapsed into surviving child");

                    self.lock.unlock_obsolete();
                    // SAFETY: obsoleted and unlinked above.
                    unsafe {
                        retire_inner(guard, self as *const Inner<V> as *mut Inner<V>);
                    }
                    parent.unlock();
                    return false;
                }

                // Plain removal: only this node changes.
                if self.lock.upgrade(version, None) {
                    continue;
                }
                if parent.read_unlock(parent_version, Some(&self.lock)) {
                    return true;
                }
                // SAFETY: write lock held; guard pins the dead leaf.
                unsafe {
                    inode.replace(idx, None);
                    retire_leaf(guard, child);
                    if at_min && kind != IKind::N4 {
                        if let Some(smaller) = inode.shrink() {
                            self.set_inode(smaller);
                            retire_inode(guard, inode);
                            debug_log!(depth, "remove: layout shrunk");
                        }
                    }
                }
                self.lock.unlock();
                return false;
            }

            if parent.read_unlock(parent_version, None) {
                return true;
            }

            let replace_child = |replacement: NodeRef<V>| {
                // SAFETY: the child invokes this only while our write lock
                // is held, which it acquired by CAS from `version`, so
                // `idx` still addresses it.
                unsafe { self.inode().replace(idx, Some(replacement)) };
            };
            // SAFETY: same guard covers the recursion.
            let restart = unsafe {
                child.as_inner().remove(
                    key,
                    next_depth + 1,
                    &self.lock,
                    version,
                    &replace_child,
                    guard,
                )
            };
            if restart {
                continue;
            }
            return false;
        }
    }
}

// ============================================================================
//  Leaf insertion and prefix inheritance
// ============================================================================

/// Insert `new_leaf` into the position occupied by `existing`.
///
/// Equal keys replace the leaf. Diverging keys build a chain of inner
/// nodes covering the common suffix: each link carries up to
/// [`MAX_PREFIX`] bytes of it, and when a link's prefix is full one more
/// byte is consumed as the single branch into the next link.
///
/// # Safety
///
/// `existing` is a leaf pinned by the caller's guard; `key` is the byte
/// string stored in `new_leaf`; the caller holds the write lock of the
/// slot being replaced.
pub(crate) unsafe fn leaf_insert<V>(
    existing: NodeRef<V>,
    new_leaf: NodeRef<V>,
    key: &[u8],
    mut depth: usize,
) -> LeafInsert<V> {
    // SAFETY: pinned per contract.
    let old = unsafe { existing.as_leaf() };
    if old.matches(key) {
        return LeafInsert::Updated(new_leaf);
    }

    let old_key = &old.key;
    let mut head: Option<NodeRef<V>> = None;
    let mut tail: Option<NodeRef<V>> = None;
    loop {
        let cmp = compare_prefix(old_key, key, depth, depth);
        let mut prefix = [0u8; MAX_PREFIX];
        prefix[..cmp].copy_from_slice(&old_key[depth..depth + cmp]);
        let link = NodeRef::from_inner(Inner::alloc(prefix, cmp, INodePtr::alloc_n4()));

        match tail {
            None => head = Some(link),
            // SAFETY: the previous link is unpublished; exclusive access.
            Some(prev) => unsafe {
                prev.as_inner().inode().add_child(old_key[depth - 1], link);
            },
        }

        // Terminal once the keys actually diverge here; the capped compare
        // alone cannot tell divergence at the cap from a longer run.
        if old_key[depth + cmp] != key[depth + cmp] {
            // SAFETY: the link is unpublished; exclusive access.
            unsafe {
                let inode = link.as_inner().inode();
                inode.add_child(old_key[depth + cmp], existing);
                inode.add_child(key[depth + cmp], new_leaf);
            }
            break;
        }
        debug_assert_eq!(cmp, MAX_PREFIX);
        tail = Some(link);
        depth += cmp + 1;
    }

    match head {
        Some(head) => LeafInsert::Expanded(head),
        None => unreachable!("expansion chain always has a head link"),
    }
}

/// Fold a collapsing parent's prefix (of length `incoming_len`, branch byte
/// included) into `survivor`.
///
/// A leaf absorbs it for free: it already stores its full key. An inner
/// node prepends the bytes; when the combined length would exceed
/// [`MAX_PREFIX`], a fresh single-child link is interposed, one byte of the
/// combined prefix becoming the branch into the survivor.
///
/// # Safety
///
/// Caller holds the write locks of the collapsing node and of its parent;
/// `survivor` is the collapsing node's only remaining child.
pub(crate) unsafe fn inherit_into<V>(
    survivor: NodeRef<V>,
    incoming: [u8; MAX_PREFIX],
    incoming_len: usize,
) -> NodeRef<V> {
    if survivor.is_leaf() {
        return survivor;
    }
    // SAFETY: pinned per contract.
    let inner = unsafe { survivor.as_inner() };

    // Readers may already have validated their way into the survivor; its
    // own version must move while the prefix does.
    inner.lock.lock();
    let (own, own_len) = inner.prefix();
    let total = own_len + incoming_len;

    let result = if total <= MAX_PREFIX {
        let mut merged = incoming;
        merged[incoming_len..total].copy_from_slice(&own[..own_len]);
        inner.set_prefix(merged, total);
        survivor
    } else {
        let mut head_prefix = incoming;
        head_prefix[incoming_len..].copy_from_slice(&own[..MAX_PREFIX - incoming_len]);
        let branch = own[MAX_PREFIX - incoming_len];

        let consumed = MAX_PREFIX - incoming_len + 1;
        let rest_len = total - MAX_PREFIX - 1;
        let mut rest = [0u8; MAX_PREFIX];
        rest[..rest_len].copy_from_slice(&own[consumed..consumed + rest_len]);
        inner.set_prefix(rest, rest_len);

        let n4 = INodePtr::alloc_n4();
        // SAFETY: the new link is unpublished; exclusive access.
        unsafe { n4.add_child(branch, survivor) };
        NodeRef::from_inner(Inner::alloc(head_prefix, MAX_PREFIX, n4))
    };
    inner.lock.unlock();
    result
}
