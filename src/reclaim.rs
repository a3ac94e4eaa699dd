//! Deferred reclamation glue.
//!
//! Nodes unlinked from the tree stay readable until every thread that might
//! still validate against them has left its critical section; `seize` tracks
//! that. This module holds the per-type reclaimers handed to
//! `defer_retire`, small helpers that pick the right one, and the
//! synchronous teardown used by `Drop`.

use seize::{Collector, Guard as _, LocalGuard};

use crate::inode::{IKind, INodePtr, Node16, Node256, Node4, Node48};
use crate::node::{Inner, Leaf, NodeRef};

// ============================================================================
//  Reclaimers (seize callback signatures)
// ============================================================================

/// # Safety
///
/// `ptr` came from `Box::into_raw` and no reader can still reach it.
unsafe fn reclaim_leaf<V>(ptr: *mut Leaf<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Frees an obsoleted inner node together with its layout allocation.
/// Children are not followed; they were re-homed before the node was
/// retired.
///
/// # Safety
///
/// As for [`reclaim_leaf`].
unsafe fn reclaim_inner<V>(ptr: *mut Inner<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe {
        (*ptr).inode().dealloc();
        drop(Box::from_raw(ptr));
    }
}

/// # Safety
///
/// As for [`reclaim_leaf`].
unsafe fn reclaim_n4<V>(ptr: *mut Node4<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// # Safety
///
/// As for [`reclaim_leaf`].
unsafe fn reclaim_n16<V>(ptr: *mut Node16<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// # Safety
///
/// As for [`reclaim_leaf`].
unsafe fn reclaim_n48<V>(ptr: *mut Node48<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// # Safety
///
/// As for [`reclaim_leaf`].
unsafe fn reclaim_n256<V>(ptr: *mut Node256<V>, _collector: &Collector) {
    // SAFETY: exclusive ownership per contract.
    unsafe { drop(Box::from_raw(ptr)) };
}

// ============================================================================
//  Retire helpers
// ============================================================================

/// # Safety
///
/// `leaf` is a leaf reference that has just been unlinked under a write
/// lock; `guard` belongs to the owning tree's collector.
pub(crate) unsafe fn retire_leaf<V>(guard: &LocalGuard<'_>, leaf: NodeRef<V>) {
    // SAFETY: unlinked per contract; reclaimer matches the allocation.
    unsafe { guard.defer_retire(leaf.leaf_ptr(), reclaim_leaf::<V>) };
}

/// # Safety
///
/// `inner` has been marked obsolete under its write lock and unlinked from
/// its parent; `guard` belongs to the owning tree's collector.
pub(crate) unsafe fn retire_inner<V>(guard: &LocalGuard<'_>, inner: *mut Inner<V>) {
    // SAFETY: unlinked per contract; reclaimer matches the allocation.
    unsafe { guard.defer_retire(inner, reclaim_inner::<V>) };
}

/// Retire a layout that was swapped out by grow or shrink.
///
/// # Safety
///
/// The layout was replaced under its inner node's write lock; `guard`
/// belongs to the owning tree's collector.
pub(crate) unsafe fn retire_inode<V>(guard: &LocalGuard<'_>, inode: INodePtr<V>) {
    // SAFETY: unlinked per contract; each arm pairs the concrete pointer
    // with its reclaimer.
    unsafe {
        match inode.kind() {
            IKind::N4 => guard.defer_retire(inode.as_n4_ptr(), reclaim_n4::<V>),
            IKind::N16 => guard.defer_retire(inode.as_n16_ptr(), reclaim_n16::<V>),
            IKind::N48 => guard.defer_retire(inode.as_n48_ptr(), reclaim_n48::<V>),
            IKind::N256 => guard.defer_retire(inode.as_n256_ptr(), reclaim_n256::<V>),
        }
    }
}

// ============================================================================
//  Synchronous teardown
// ============================================================================

/// Free every node reachable from `node`, depth first.
///
/// # Safety
///
/// The subtree must be exclusively owned (tree teardown under `&mut` or a
/// node that never got published).
pub(crate) unsafe fn free_subtree<V>(node: NodeRef<V>) {
    if node.is_leaf() {
        // SAFETY: exclusive ownership per contract.
        unsafe { drop(Box::from_raw(node.leaf_ptr())) };
        return;
    }
    let inner = node.inner_ptr();
    // SAFETY: exclusive ownership per contract.
    let inode = unsafe { (*inner).inode() };
    let mut free_child = |child: NodeRef<V>| {
        // SAFETY: children are exclusively owned along with their parent.
        unsafe { free_subtree(child) };
        true
    };
    // SAFETY: exclusive ownership per contract.
    unsafe {
        inode.for_each_child(&mut free_child);
        inode.dealloc();
        drop(Box::from_raw(inner));
    }
}
