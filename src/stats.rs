//! Structure statistics.
//!
//! Counts nodes by kind over a quiescent tree; handy for verifying that a
//! workload produces the layout mix you expect (or that shrinking actually
//! happens).

use crate::node::{walk_node, NodeRef};
use crate::tree::Tree;

/// Node counts by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub leaves: usize,
    pub inner4: usize,
    pub inner16: usize,
    pub inner48: usize,
    pub inner256: usize,
}

impl TreeStats {
    /// Total branching nodes.
    #[must_use]
    pub fn inner_nodes(&self) -> usize {
        self.inner4 + self.inner16 + self.inner48 + self.inner256
    }
}

impl<V> Tree<V> {
    /// Count nodes by kind.
    ///
    /// Diagnostic only: the tree must be quiescent while this runs, like
    /// [`dump`](Tree::dump).
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        use crate::inode::IKind;

        let mut stats = TreeStats::default();
        let Some(root) = self.root() else {
            return stats;
        };
        let mut tally = |node: NodeRef<V>, _depth: usize| {
            if node.is_leaf() {
                stats.leaves += 1;
            } else {
                // SAFETY: quiescence is the documented requirement.
                match unsafe { node.as_inner() }.inode().kind() {
                    IKind::N4 => stats.inner4 += 1,
                    IKind::N16 => stats.inner16 += 1,
                    IKind::N48 => stats.inner48 += 1,
                    IKind::N256 => stats.inner256 += 1,
                }
            }
            true
        };
        // SAFETY: as above.
        unsafe { walk_node(root, 0, &mut tally) };
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::TreeStats;
    use crate::tree::Tree;

    #[test]
    fn empty_tree_has_no_nodes() {
        let tree: Tree<u64> = Tree::new();
        assert_eq!(tree.stats(), TreeStats::default());
    }

    #[test]
    fn counts_follow_fanout() {
        let tree = Tree::new();
        for byte in 0..20u8 {
            tree.insert(&[byte], u64::from(byte));
        }
        let stats = tree.stats();
        assert_eq!(stats.leaves, 20);
        assert_eq!(stats.inner48, 1, "20 children need an n48 root");
        assert_eq!(stats.inner_nodes(), 1);
    }
}
