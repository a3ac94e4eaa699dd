//! # Artree
//!
//! A concurrent ordered byte-string index based on an adaptive radix tree.
//!
//! The tree combines three classic ART ideas with optimistic lock coupling:
//! - Adaptive inner nodes (4/16/48/256-way) that grow and shrink with fan-out
//! - Path compression and lazy expansion to keep trees shallow
//! - Version-validated lock-free reads; writers lock at most two nodes
//!
//! ## Design
//!
//! Every inner node embeds a 64-bit optimistic lock. Readers snapshot a
//! node's version, read, and revalidate; a writer's compare-and-swap
//! upgrade from the exact version it read doubles as that validation.
//! Unlinked nodes are reclaimed through `seize`, so an in-flight reader can
//! always finish its validation against a node that has already been
//! removed.
//!
//! ## Keys
//!
//! Keys are arbitrary byte strings (length >= 1). No key may be a proper
//! prefix of another; terminate keys (e.g. with `\0`) or use fixed-length
//! encodings.
//!
//! ## Example
//!
//! ```rust
//! use artree::Tree;
//!
//! let tree = Tree::new();
//! tree.insert(b"foo\0", 1u64);
//! tree.insert(b"bar\0", 2);
//!
//! assert_eq!(tree.get(b"foo\0"), Some(1));
//!
//! let mut scan = tree.iter();
//! assert!(scan.next());
//! assert_eq!(scan.key(), b"bar\0");
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

// Private implementation modules
mod inode;
mod node;
mod reclaim;
mod search;
mod tracing_helpers;

// Public API modules
pub mod iter;
pub mod olock;
pub mod stats;
pub mod tree;

// Re-export main types for convenience
pub use iter::Scan;
pub use stats::TreeStats;
pub use tree::Tree;
