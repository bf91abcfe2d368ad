//! B+Tree (C6): order-`m`, ASC/DESC, unique or non-unique keyed tree over a
//! [`Slab`]-backed node arena.
//!
//! Grounded on the teacher's `storage::btree::tree::definition::leaf` binary
//! search / choose-child idiom, replayed here over [`NodeId`] handles instead
//! of page pointers, and on the REDESIGN FLAGS decision to inject an explicit
//! comparator rather than require `K: Ord` (spec.md keys include `f64`, which
//! has no total order).

use std::cmp::Ordering;
use std::fmt;

use slab::Slab;

use super::node::{InternalNode, LeafNode, Node, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Returned by [`BPTree::insert`] when a unique tree already holds the key.
/// Carries no names: the index layer attaches `crate`/`index` context when it
/// converts this into [`crate::error::CoreError::DuplicateKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateKeyError;

impl fmt::Display for DuplicateKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate key on a unique index")
    }
}

impl std::error::Error for DuplicateKeyError {}

type Comparator<K> = Box<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

pub struct BPTree<K, V> {
    order: usize,
    sort_order: SortOrder,
    unique: bool,
    cmp: Comparator<K>,
    arena: Slab<Node<K, V>>,
    root: NodeId,
    len: usize,
}

impl<K: Clone, V: Clone> BPTree<K, V> {
    /// `order` is the maximum number of children an internal node may hold
    /// (spec.md's `m`); `cmp` must impose a total order over every key this
    /// tree will ever see. Must be >= 3, matching spec.md's minimum for a
    /// meaningful split/merge.
    pub fn new(
        order: usize,
        sort_order: SortOrder,
        unique: bool,
        cmp: impl Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        assert!(order >= 3, "B+Tree order must be at least 3");
        let mut arena = Slab::new();
        let root = arena.insert(Node::Leaf(LeafNode::new()));
        Self {
            order,
            sort_order,
            unique,
            cmp: Box::new(cmp),
            arena,
            root,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    #[must_use]
    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    fn ordered_cmp(&self, a: &K, b: &K) -> Ordering {
        let natural = (self.cmp)(a, b);
        match self.sort_order {
            SortOrder::Asc => natural,
            SortOrder::Desc => natural.reverse(),
        }
    }

    fn max_leaf_entries(&self) -> usize {
        self.order - 1
    }

    fn min_leaf_entries(&self) -> usize {
        self.max_leaf_entries().div_ceil(2)
    }

    fn min_children(&self) -> usize {
        self.order.div_ceil(2)
    }

    fn child_index_for(&self, internal: &InternalNode<K>, key: &K) -> usize {
        internal
            .keys
            .partition_point(|k| self.ordered_cmp(k, key) != Ordering::Greater)
    }

    fn leaf_lower_bound(&self, entries: &[(K, V)], key: &K) -> usize {
        entries.partition_point(|(k, _)| self.ordered_cmp(k, key) == Ordering::Less)
    }

    fn leaf_upper_bound(&self, entries: &[(K, V)], key: &K) -> usize {
        entries.partition_point(|(k, _)| self.ordered_cmp(k, key) != Ordering::Greater)
    }

    fn leaf_id_for(&self, key: &K) -> (NodeId, Vec<(NodeId, usize)>) {
        let mut path = Vec::new();
        let mut current = self.root;
        loop {
            match &self.arena[current] {
                Node::Leaf(_) => return (current, path),
                Node::Internal(internal) => {
                    let idx = self.child_index_for(internal, key);
                    path.push((current, idx));
                    current = internal.children[idx];
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut current = self.root;
        loop {
            match &self.arena[current] {
                Node::Leaf(_) => return current,
                Node::Internal(internal) => current = internal.children[0],
            }
        }
    }

    /// Inserts `(key, value)`. On a unique tree, an already-present key is
    /// rejected without mutating the tree.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), DuplicateKeyError> {
        let (leaf_id, path) = self.leaf_id_for(&key);

        {
            let Node::Leaf(leaf) = &mut self.arena[leaf_id] else {
                unreachable!("leaf_id_for always returns a leaf")
            };
            let lb = self.leaf_lower_bound(&leaf.entries, &key);
            if self.unique {
                if let Some((existing, _)) = leaf.entries.get(lb) {
                    if self.ordered_cmp(existing, &key) == Ordering::Equal {
                        return Err(DuplicateKeyError);
                    }
                }
                leaf.entries.insert(lb, (key, value));
            } else {
                let ub = self.leaf_upper_bound(&leaf.entries, &key);
                leaf.entries.insert(ub, (key, value));
            }
        }
        self.len += 1;

        let overflow = matches!(&self.arena[leaf_id], Node::Leaf(l) if l.entries.len() > self.max_leaf_entries());
        if overflow {
            self.split_leaf_and_propagate(leaf_id, path);
        }
        Ok(())
    }

    fn split_leaf(&mut self, leaf_id: NodeId) -> (K, NodeId) {
        let Node::Leaf(leaf) = &mut self.arena[leaf_id] else {
            unreachable!()
        };
        let len = leaf.entries.len();
        let mut mid = len / 2;
        // Nudge the split point to a key boundary so equal keys never span
        // both halves; falls back to the raw midpoint for a node that is a
        // single duplicated key run filling the whole leaf.
        while mid > 1 && self.ordered_cmp(&leaf.entries[mid - 1].0, &leaf.entries[mid].0) == Ordering::Equal {
            mid -= 1;
        }
        let right_entries = leaf.entries.split_off(mid);
        let old_next = leaf.next;

        let separator = right_entries[0].0.clone();
        let right_id = self.arena.insert(Node::Leaf(LeafNode {
            entries: right_entries,
            next: old_next,
            prev: Some(leaf_id),
        }));

        if let Some(old_next_id) = old_next {
            if let Node::Leaf(n) = &mut self.arena[old_next_id] {
                n.prev = Some(right_id);
            }
        }
        let Node::Leaf(leaf) = &mut self.arena[leaf_id] else {
            unreachable!()
        };
        leaf.next = Some(right_id);

        (separator, right_id)
    }

    fn split_internal(&mut self, node_id: NodeId) -> (K, NodeId) {
        let Node::Internal(node) = &mut self.arena[node_id] else {
            unreachable!()
        };
        let mid = node.keys.len() / 2;
        let separator = node.keys[mid].clone();
        let right_keys = node.keys.split_off(mid + 1);
        node.keys.pop(); // drop the promoted separator from the left side
        let right_children = node.children.split_off(mid + 1);

        let right_id = self.arena.insert(Node::Internal(InternalNode::new(right_keys, right_children)));
        (separator, right_id)
    }

    fn split_leaf_and_propagate(&mut self, leaf_id: NodeId, mut path: Vec<(NodeId, usize)>) {
        let (sep, right_id) = self.split_leaf(leaf_id);
        let mut carry = Some((sep, right_id));
        let mut left_id = leaf_id;

        while let Some((sep, right_id)) = carry.take() {
            match path.pop() {
                None => {
                    let new_root = self.arena.insert(Node::Internal(InternalNode::new(
                        vec![sep],
                        vec![left_id, right_id],
                    )));
                    self.root = new_root;
                }
                Some((parent_id, child_idx)) => {
                    let overflow = {
                        let Node::Internal(parent) = &mut self.arena[parent_id] else {
                            unreachable!()
                        };
                        parent.keys.insert(child_idx, sep);
                        parent.children.insert(child_idx + 1, right_id);
                        parent.children.len() > self.order
                    };
                    if overflow {
                        let (new_sep, new_right) = self.split_internal(parent_id);
                        carry = Some((new_sep, new_right));
                        left_id = parent_id;
                    }
                }
            }
        }
    }

    /// Returns every value stored under `key`, in insertion order for
    /// non-unique trees.
    #[must_use]
    pub fn search(&self, key: &K) -> Vec<V> {
        let (leaf_id, _) = self.leaf_id_for(key);
        let Node::Leaf(leaf) = &self.arena[leaf_id] else {
            unreachable!()
        };
        let lb = self.leaf_lower_bound(&leaf.entries, key);
        let ub = self.leaf_upper_bound(&leaf.entries, key);
        leaf.entries[lb..ub].iter().map(|(_, v)| v.clone()).collect()
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        !self.search(key).is_empty()
    }

    /// Collects every `(key, value)` pair with `lo <= key <= hi` (bounds
    /// interpreted in the tree's own ASC/DESC order), `None` meaning
    /// unbounded on that side.
    #[must_use]
    pub fn range_search(&self, lo: Option<&K>, hi: Option<&K>) -> Vec<(K, V)> {
        let mut start_leaf = match lo {
            Some(key) => self.leaf_id_for(key).0,
            None => self.leftmost_leaf(),
        };
        let mut out = Vec::new();
        loop {
            let Node::Leaf(leaf) = &self.arena[start_leaf] else {
                unreachable!()
            };
            for (k, v) in &leaf.entries {
                if let Some(lo) = lo {
                    if self.ordered_cmp(k, lo) == Ordering::Less {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if self.ordered_cmp(k, hi) == Ordering::Greater {
                        return out;
                    }
                }
                out.push((k.clone(), v.clone()));
            }
            match leaf.next {
                Some(next) => start_leaf = next,
                None => return out,
            }
        }
    }

    /// Every entry in the tree's effective order (ASC or DESC).
    #[must_use]
    pub fn iter_in_order(&self) -> Vec<(K, V)> {
        self.range_search(None, None)
    }

    /// Removes one entry with `key`. If `value` is given (meaningful for a
    /// non-unique tree holding several values per key) only the matching
    /// entry is removed; otherwise the first entry for `key` is removed.
    /// Returns whether an entry was removed.
    pub fn remove(&mut self, key: &K, value: Option<&V>) -> bool
    where
        V: PartialEq,
    {
        let (leaf_id, path) = self.leaf_id_for(key);
        let removed = {
            let Node::Leaf(leaf) = &mut self.arena[leaf_id] else {
                unreachable!()
            };
            let lb = self.leaf_lower_bound(&leaf.entries, key);
            let ub = self.leaf_upper_bound(&leaf.entries, key);
            let slot = match value {
                Some(v) => leaf.entries[lb..ub].iter().position(|(_, ev)| ev == v).map(|i| lb + i),
                None => {
                    if lb < ub {
                        Some(lb)
                    } else {
                        None
                    }
                }
            };
            match slot {
                Some(idx) => {
                    leaf.entries.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.len -= 1;
            self.rebalance_after_removal(leaf_id, path);
        }
        removed
    }

    fn leaf_entries_len(&self, id: NodeId) -> usize {
        match &self.arena[id] {
            Node::Leaf(l) => l.entries.len(),
            Node::Internal(_) => unreachable!(),
        }
    }

    fn rebalance_after_removal(&mut self, node_id: NodeId, mut path: Vec<(NodeId, usize)>) {
        let is_root = path.is_empty();
        let underflow = match &self.arena[node_id] {
            Node::Leaf(l) => !is_root && l.entries.len() < self.min_leaf_entries(),
            Node::Internal(i) => !is_root && i.children.len() < self.min_children(),
        };
        if is_root {
            self.collapse_root_if_needed();
            return;
        }
        if !underflow {
            return;
        }

        let (parent_id, child_idx) = path.pop().expect("non-root node has a parent");
        let (left_sibling, right_sibling) = {
            let Node::Internal(parent) = &self.arena[parent_id] else {
                unreachable!()
            };
            let left = if child_idx > 0 { Some(parent.children[child_idx - 1]) } else { None };
            let right = if child_idx + 1 < parent.children.len() {
                Some(parent.children[child_idx + 1])
            } else {
                None
            };
            (left, right)
        };

        match &self.arena[node_id] {
            Node::Leaf(_) => {
                if let Some(right_id) = right_sibling {
                    if self.leaf_entries_len(right_id) > self.min_leaf_entries() {
                        self.borrow_from_right_leaf(parent_id, child_idx, node_id, right_id);
                        return;
                    }
                }
                if let Some(left_id) = left_sibling {
                    if self.leaf_entries_len(left_id) > self.min_leaf_entries() {
                        self.borrow_from_left_leaf(parent_id, child_idx, left_id, node_id);
                        return;
                    }
                }
                if let Some(right_id) = right_sibling {
                    self.merge_leaves(parent_id, child_idx, node_id, right_id);
                } else if let Some(left_id) = left_sibling {
                    self.merge_leaves(parent_id, child_idx - 1, left_id, node_id);
                }
            }
            Node::Internal(_) => {
                if let Some(right_id) = right_sibling {
                    if self.internal_children_len(right_id) > self.min_children() {
                        self.borrow_from_right_internal(parent_id, child_idx, node_id, right_id);
                        return;
                    }
                }
                if let Some(left_id) = left_sibling {
                    if self.internal_children_len(left_id) > self.min_children() {
                        self.borrow_from_left_internal(parent_id, child_idx, left_id, node_id);
                        return;
                    }
                }
                if let Some(right_id) = right_sibling {
                    self.merge_internal(parent_id, child_idx, node_id, right_id);
                } else if let Some(left_id) = left_sibling {
                    self.merge_internal(parent_id, child_idx - 1, left_id, node_id);
                }
            }
        }
        self.rebalance_after_removal(parent_id, path);
    }

    fn internal_children_len(&self, id: NodeId) -> usize {
        match &self.arena[id] {
            Node::Internal(i) => i.children.len(),
            Node::Leaf(_) => unreachable!(),
        }
    }

    fn borrow_from_right_leaf(&mut self, parent_id: NodeId, child_idx: usize, left: NodeId, right: NodeId) {
        let moved = {
            let Node::Leaf(r) = &mut self.arena[right] else { unreachable!() };
            r.entries.remove(0)
        };
        let new_separator = match &self.arena[right] {
            Node::Leaf(r) => r.entries[0].0.clone(),
            Node::Internal(_) => unreachable!(),
        };
        if let Node::Leaf(l) = &mut self.arena[left] {
            l.entries.push(moved);
        }
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys[child_idx] = new_separator;
        }
    }

    fn borrow_from_left_leaf(&mut self, parent_id: NodeId, child_idx: usize, left: NodeId, right: NodeId) {
        let moved = {
            let Node::Leaf(l) = &mut self.arena[left] else { unreachable!() };
            l.entries.pop().expect("left sibling has surplus entries")
        };
        let new_separator = moved.0.clone();
        if let Node::Leaf(r) = &mut self.arena[right] {
            r.entries.insert(0, moved);
        }
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys[child_idx - 1] = new_separator;
        }
    }

    fn merge_leaves(&mut self, parent_id: NodeId, separator_idx: usize, left: NodeId, right: NodeId) {
        let (right_entries, right_next) = {
            let Node::Leaf(r) = &mut self.arena[right] else { unreachable!() };
            (std::mem::take(&mut r.entries), r.next)
        };
        if let Node::Leaf(l) = &mut self.arena[left] {
            l.entries.extend(right_entries);
            l.next = right_next;
        }
        if let Some(next_id) = right_next {
            if let Node::Leaf(n) = &mut self.arena[next_id] {
                n.prev = Some(left);
            }
        }
        self.arena.remove(right);
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys.remove(separator_idx);
            parent.children.remove(separator_idx + 1);
        }
    }

    fn borrow_from_right_internal(&mut self, parent_id: NodeId, child_idx: usize, left: NodeId, right: NodeId) {
        let parent_key = match &self.arena[parent_id] {
            Node::Internal(p) => p.keys[child_idx].clone(),
            Node::Leaf(_) => unreachable!(),
        };
        let (moved_child, new_parent_key) = {
            let Node::Internal(r) = &mut self.arena[right] else { unreachable!() };
            let moved_child = r.children.remove(0);
            let new_key = r.keys.remove(0);
            (moved_child, new_key)
        };
        if let Node::Internal(l) = &mut self.arena[left] {
            l.keys.push(parent_key);
            l.children.push(moved_child);
        }
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys[child_idx] = new_parent_key;
        }
    }

    fn borrow_from_left_internal(&mut self, parent_id: NodeId, child_idx: usize, left: NodeId, right: NodeId) {
        let parent_key = match &self.arena[parent_id] {
            Node::Internal(p) => p.keys[child_idx - 1].clone(),
            Node::Leaf(_) => unreachable!(),
        };
        let (moved_child, new_parent_key) = {
            let Node::Internal(l) = &mut self.arena[left] else { unreachable!() };
            let moved_child = l.children.pop().expect("left sibling has surplus children");
            let new_key = l.keys.pop().expect("left sibling has surplus keys");
            (moved_child, new_key)
        };
        if let Node::Internal(r) = &mut self.arena[right] {
            r.keys.insert(0, parent_key);
            r.children.insert(0, moved_child);
        }
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys[child_idx - 1] = new_parent_key;
        }
    }

    fn merge_internal(&mut self, parent_id: NodeId, separator_idx: usize, left: NodeId, right: NodeId) {
        let parent_key = match &self.arena[parent_id] {
            Node::Internal(p) => p.keys[separator_idx].clone(),
            Node::Leaf(_) => unreachable!(),
        };
        let (right_keys, right_children) = {
            let Node::Internal(r) = &mut self.arena[right] else { unreachable!() };
            (std::mem::take(&mut r.keys), std::mem::take(&mut r.children))
        };
        if let Node::Internal(l) = &mut self.arena[left] {
            l.keys.push(parent_key);
            l.keys.extend(right_keys);
            l.children.extend(right_children);
        }
        self.arena.remove(right);
        if let Node::Internal(parent) = &mut self.arena[parent_id] {
            parent.keys.remove(separator_idx);
            parent.children.remove(separator_idx + 1);
        }
    }

    fn collapse_root_if_needed(&mut self) {
        if let Node::Internal(root) = &self.arena[self.root] {
            if root.children.len() == 1 {
                let only_child = root.children[0];
                self.arena.remove(self.root);
                self.root = only_child;
            }
        }
    }
}
