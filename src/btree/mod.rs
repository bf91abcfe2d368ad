//! B+Tree index primitive (C5/C6): node arena plus the tree operations that
//! walk it.

pub mod node;
pub mod tree;

pub use node::NodeId;
pub use tree::{BPTree, DuplicateKeyError, SortOrder};
