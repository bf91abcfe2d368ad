//! Node set (C5): leaf and internal node storage.
//!
//! Grounded on the REDESIGN FLAGS decision to replace the teacher's
//! reference-counted page-backed tree nodes (`storage::btree::tree`, which
//! chases `Rc<RefCell<Page>>`-style pointers) with a `Slab`-addressed arena:
//! every node lives in one `Slab<Node<K, V>>` and is referenced by a plain
//! `NodeId`, so there are no cyclic owned pointers to reason about.

/// Opaque handle into a [`crate::btree::tree::BPTree`]'s node arena.
pub type NodeId = usize;

#[derive(Debug)]
pub(crate) enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

#[derive(Debug)]
pub(crate) struct LeafNode<K, V> {
    /// Kept sorted by the tree's effective key order at all times.
    pub entries: Vec<(K, V)>,
    pub next: Option<NodeId>,
    pub prev: Option<NodeId>,
}

impl<K, V> LeafNode<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next: None,
            prev: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct InternalNode<K> {
    /// `keys.len() + 1 == children.len()`. `children[i]` holds every entry
    /// strictly less than `keys[i]`; entries equal to `keys[i]` live in
    /// `children[i + 1]` onward.
    pub keys: Vec<K>,
    pub children: Vec<NodeId>,
}

impl<K> InternalNode<K> {
    pub fn new(keys: Vec<K>, children: Vec<NodeId>) -> Self {
        Self { keys, children }
    }
}
