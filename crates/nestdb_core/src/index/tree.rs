//! Arena-backed AVL tree with per-key buckets.
//!
//! Nodes live in a `Vec` and refer to each other by slot index, including
//! the parent back-reference used for rebalancing. Removing a node moves the
//! last slot into the hole, so slot indices are not stable across deletes.

use super::traits::{KeyOrdering, NaturalOrdering};
use std::cmp::Ordering;
use std::ops::Bound;
use thiserror::Error;

type NodeId = usize;

/// Insert into a unique tree hit an occupied key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("key already present in unique tree")]
pub struct DuplicateKey<K> {
    /// The rejected key.
    pub key: K,
}

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    bucket: Vec<V>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    parent: Option<NodeId>,
    height: u32,
}

/// Self-balancing ordered tree mapping each key to a bucket of values.
///
/// Unique trees hold one value per key. Lookups, inserts and deletes are
/// `O(log n)`; range scans are `O(k + log n)`.
///
/// # Example
///
/// ```rust
/// use nestdb_core::index::AvlTree;
/// use std::ops::Bound;
///
/// let mut tree: AvlTree<i64, &str> = AvlTree::new();
/// tree.insert(3, "c").unwrap();
/// tree.insert(1, "a").unwrap();
/// tree.insert(2, "b").unwrap();
///
/// let hits = tree.between_bounds(Bound::Included(&2), Bound::Unbounded);
/// assert_eq!(hits, vec![&"b", &"c"]);
/// ```
#[derive(Debug, Clone)]
pub struct AvlTree<K, V, O = NaturalOrdering> {
    nodes: Vec<Node<K, V>>,
    root: Option<NodeId>,
    unique: bool,
    ordering: O,
}

impl<K: Ord, V: PartialEq> AvlTree<K, V, NaturalOrdering> {
    /// Creates an empty non-unique tree.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ordering(NaturalOrdering, false)
    }

    /// Creates an empty unique tree.
    #[must_use]
    pub fn new_unique() -> Self {
        Self::with_ordering(NaturalOrdering, true)
    }
}

impl<K: Ord, V: PartialEq> Default for AvlTree<K, V, NaturalOrdering> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, O: KeyOrdering<K, V>> AvlTree<K, V, O> {
    /// Creates an empty tree using `ordering`.
    pub fn with_ordering(ordering: O, unique: bool) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            unique,
            ordering,
        }
    }

    /// Whether the tree rejects a second value per key.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Height of the tree, zero when empty.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.h(self.root)
    }

    /// Removes every key.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    /// Adds `value` to the bucket at `key`, creating the key if needed.
    ///
    /// # Errors
    ///
    /// In a unique tree, fails without modifying the tree when `key` is
    /// already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), DuplicateKey<K>> {
        let Some(mut cur) = self.root else {
            self.root = Some(self.alloc(key, value, None));
            return Ok(());
        };

        loop {
            match self.ordering.compare_keys(&key, &self.nodes[cur].key) {
                Ordering::Equal => {
                    if self.unique && !self.nodes[cur].bucket.is_empty() {
                        return Err(DuplicateKey { key });
                    }
                    self.nodes[cur].bucket.push(value);
                    return Ok(());
                }
                Ordering::Less => match self.nodes[cur].left {
                    Some(left) => cur = left,
                    None => {
                        let id = self.alloc(key, value, Some(cur));
                        self.nodes[cur].left = Some(id);
                        break;
                    }
                },
                Ordering::Greater => match self.nodes[cur].right {
                    Some(right) => cur = right,
                    None => {
                        let id = self.alloc(key, value, Some(cur));
                        self.nodes[cur].right = Some(id);
                        break;
                    }
                },
            }
        }

        self.retrace(Some(cur));
        Ok(())
    }

    /// Values stored at `key`; empty if the key is absent.
    #[must_use]
    pub fn search(&self, key: &K) -> &[V] {
        match self.find(key) {
            Some(id) => &self.nodes[id].bucket,
            None => &[],
        }
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Values whose key lies within the bounds, in ascending key order.
    #[must_use]
    pub fn between_bounds(&self, lower: Bound<&K>, upper: Bound<&K>) -> Vec<&V> {
        let mut out = Vec::new();
        self.collect_range(self.root, lower, upper, &mut out);
        out
    }

    /// Removes `value` from the bucket at `key`, or the whole key when
    /// `value` is `None`. The key is dropped once its bucket is empty.
    /// Absent keys and values are ignored.
    pub fn delete(&mut self, key: &K, value: Option<&V>) {
        let Some(id) = self.find(key) else {
            return;
        };
        if let Some(value) = value {
            let ordering = &self.ordering;
            self.nodes[id]
                .bucket
                .retain(|v| !ordering.values_equal(v, value));
            if !self.nodes[id].bucket.is_empty() {
                return;
            }
        }
        self.remove_node(id);
    }

    /// Smallest key.
    #[must_use]
    pub fn get_min_key(&self) -> Option<&K> {
        self.root.map(|root| &self.nodes[self.min_node(root)].key)
    }

    /// Largest key.
    #[must_use]
    pub fn get_max_key(&self) -> Option<&K> {
        self.root.map(|root| &self.nodes[self.max_node(root)].key)
    }

    /// In-order iterator over keys and their buckets.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            nodes: &self.nodes,
            stack: Vec::new(),
            next: self.root,
        }
    }

    /// Verifies ordering, parent links, cached heights and balance.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(root) = self.root {
            if self.nodes[root].parent.is_some() {
                return Err("root has a parent".into());
            }
        }
        let mut reached = 0;
        self.check_node(self.root, None, &mut reached)?;
        if reached != self.nodes.len() {
            return Err(format!(
                "{} of {} nodes reachable from root",
                reached,
                self.nodes.len()
            ));
        }

        let mut prev: Option<&K> = None;
        for (key, bucket) in self.iter() {
            if let Some(prev) = prev {
                if self.ordering.compare_keys(prev, key) != Ordering::Less {
                    return Err("keys are not strictly ascending".into());
                }
            }
            if bucket.is_empty() {
                return Err("empty bucket".into());
            }
            if self.unique && bucket.len() > 1 {
                return Err("unique tree holds several values for one key".into());
            }
            prev = Some(key);
        }
        Ok(())
    }

    fn check_node(
        &self,
        id: Option<NodeId>,
        parent: Option<NodeId>,
        reached: &mut usize,
    ) -> Result<u32, String> {
        let Some(id) = id else {
            return Ok(0);
        };
        *reached += 1;
        if *reached > self.nodes.len() {
            return Err("cycle in child links".into());
        }
        let node = &self.nodes[id];
        if node.parent != parent {
            return Err(format!("node {id} has a stale parent link"));
        }
        let lh = self.check_node(node.left, Some(id), reached)?;
        let rh = self.check_node(node.right, Some(id), reached)?;
        if lh.abs_diff(rh) > 1 {
            return Err(format!("node {id} is unbalanced ({lh} vs {rh})"));
        }
        let height = 1 + lh.max(rh);
        if height != node.height {
            return Err(format!("node {id} caches height {} instead of {height}", node.height));
        }
        Ok(height)
    }

    fn find(&self, key: &K) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            cur = match self.ordering.compare_keys(key, &self.nodes[id].key) {
                Ordering::Less => self.nodes[id].left,
                Ordering::Greater => self.nodes[id].right,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    fn collect_range<'a>(
        &'a self,
        id: Option<NodeId>,
        lower: Bound<&K>,
        upper: Bound<&K>,
        out: &mut Vec<&'a V>,
    ) {
        let Some(id) = id else {
            return;
        };
        let node = &self.nodes[id];
        let vs_lower = match lower {
            Bound::Unbounded => None,
            Bound::Included(l) | Bound::Excluded(l) => Some(self.ordering.compare_keys(&node.key, l)),
        };
        let vs_upper = match upper {
            Bound::Unbounded => None,
            Bound::Included(u) | Bound::Excluded(u) => Some(self.ordering.compare_keys(&node.key, u)),
        };

        let above_lower = match (lower, vs_lower) {
            (Bound::Included(_), Some(ord)) => ord != Ordering::Less,
            (Bound::Excluded(_), Some(ord)) => ord == Ordering::Greater,
            _ => true,
        };
        let below_upper = match (upper, vs_upper) {
            (Bound::Included(_), Some(ord)) => ord != Ordering::Greater,
            (Bound::Excluded(_), Some(ord)) => ord == Ordering::Less,
            _ => true,
        };

        if vs_lower.map_or(true, |ord| ord == Ordering::Greater) {
            self.collect_range(node.left, lower, upper, out);
        }
        if above_lower && below_upper {
            out.extend(node.bucket.iter());
        }
        if vs_upper.map_or(true, |ord| ord == Ordering::Less) {
            self.collect_range(node.right, lower, upper, out);
        }
    }

    fn alloc(&mut self, key: K, value: V, parent: Option<NodeId>) -> NodeId {
        self.nodes.push(Node {
            key,
            bucket: vec![value],
            left: None,
            right: None,
            parent,
            height: 1,
        });
        self.nodes.len() - 1
    }

    fn remove_node(&mut self, mut id: NodeId) {
        if let (Some(left), Some(right)) = (self.nodes[id].left, self.nodes[id].right) {
            // Alternate sides at random so repeated deletes do not skew the tree.
            let replacement = if rand::random::<bool>() {
                self.max_node(left)
            } else {
                self.min_node(right)
            };
            self.swap_payload(id, replacement);
            id = replacement;
        }

        let child = self.nodes[id].left.or(self.nodes[id].right);
        let parent = self.nodes[id].parent;
        if let Some(child) = child {
            self.nodes[child].parent = parent;
        }
        self.replace_child(parent, id, child);

        let retrace_from = self.free(id, parent);
        self.retrace(retrace_from);
    }

    /// Releases a detached slot. Returns `hint` adjusted for the slot move.
    fn free(&mut self, id: NodeId, hint: Option<NodeId>) -> Option<NodeId> {
        let last = self.nodes.len() - 1;
        self.nodes.swap_remove(id);
        if id == last {
            return hint;
        }
        self.relink(last, id);
        if hint == Some(last) {
            Some(id)
        } else {
            hint
        }
    }

    /// Points the neighbours of the node moved from `from` to its new slot.
    fn relink(&mut self, from: NodeId, to: NodeId) {
        let (parent, left, right) = {
            let node = &self.nodes[to];
            (node.parent, node.left, node.right)
        };
        match parent {
            Some(p) if self.nodes[p].left == Some(from) => self.nodes[p].left = Some(to),
            Some(p) => self.nodes[p].right = Some(to),
            None => self.root = Some(to),
        }
        for child in [left, right].into_iter().flatten() {
            self.nodes[child].parent = Some(to);
        }
    }

    fn swap_payload(&mut self, a: NodeId, b: NodeId) {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.nodes.split_at_mut(hi);
        std::mem::swap(&mut head[lo].key, &mut tail[0].key);
        std::mem::swap(&mut head[lo].bucket, &mut tail[0].bucket);
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = new,
            Some(p) => self.nodes[p].right = new,
        }
    }

    fn min_node(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.nodes[id].left {
            id = left;
        }
        id
    }

    fn max_node(&self, mut id: NodeId) -> NodeId {
        while let Some(right) = self.nodes[id].right {
            id = right;
        }
        id
    }

    fn h(&self, id: Option<NodeId>) -> u32 {
        id.map_or(0, |id| self.nodes[id].height)
    }

    fn update_height(&mut self, id: NodeId) {
        let node = &self.nodes[id];
        let height = 1 + self.h(node.left).max(self.h(node.right));
        self.nodes[id].height = height;
    }

    fn balance(&self, id: NodeId) -> i64 {
        let node = &self.nodes[id];
        i64::from(self.h(node.left)) - i64::from(self.h(node.right))
    }

    /// Rebalances every node from `from` up to the root.
    fn retrace(&mut self, from: Option<NodeId>) {
        let mut cur = from;
        while let Some(id) = cur {
            let top = self.rebalance(id);
            cur = self.nodes[top].parent;
        }
    }

    fn rebalance(&mut self, id: NodeId) -> NodeId {
        self.update_height(id);
        let balance = self.balance(id);
        if balance > 1 {
            if let Some(left) = self.nodes[id].left {
                if self.balance(left) < 0 {
                    self.rotate_left(left);
                }
            }
            return self.rotate_right(id);
        }
        if balance < -1 {
            if let Some(right) = self.nodes[id].right {
                if self.balance(right) > 0 {
                    self.rotate_right(right);
                }
            }
            return self.rotate_left(id);
        }
        id
    }

    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.nodes[x].right else {
            return x;
        };
        let inner = self.nodes[y].left;
        let parent = self.nodes[x].parent;

        self.nodes[x].right = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(x);
        }
        self.replace_child(parent, x, Some(y));
        self.nodes[y].parent = parent;
        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);

        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rotate_right(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.nodes[x].left else {
            return x;
        };
        let inner = self.nodes[y].right;
        let parent = self.nodes[x].parent;

        self.nodes[x].left = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(x);
        }
        self.replace_child(parent, x, Some(y));
        self.nodes[y].parent = parent;
        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);

        self.update_height(x);
        self.update_height(y);
        y
    }
}

/// In-order iterator returned by [`AvlTree::iter`].
#[derive(Debug)]
pub struct Iter<'a, K, V> {
    nodes: &'a [Node<K, V>],
    stack: Vec<NodeId>,
    next: Option<NodeId>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a [V]);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.next {
            self.stack.push(id);
            self.next = self.nodes[id].left;
        }
        let id = self.stack.pop()?;
        let node = &self.nodes[id];
        self.next = node.right;
        Some((&node.key, node.bucket.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn keys<V>(tree: &AvlTree<i64, V>) -> Vec<i64>
    where
        V: PartialEq,
    {
        tree.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn insert_and_search() {
        let mut tree = AvlTree::new();
        for k in [5, 3, 8, 1, 4] {
            tree.insert(k, k * 10).unwrap();
        }
        assert_eq!(tree.search(&4), &[40]);
        assert!(tree.search(&7).is_empty());
        assert_eq!(tree.len(), 5);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn non_unique_buckets_accumulate() {
        let mut tree = AvlTree::new();
        tree.insert(1, "a").unwrap();
        tree.insert(1, "b").unwrap();
        assert_eq!(tree.search(&1), &["a", "b"]);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn unique_tree_rejects_second_value() {
        let mut tree = AvlTree::new_unique();
        tree.insert(1, "a").unwrap();
        let err = tree.insert(1, "b").unwrap_err();
        assert_eq!(err.key, 1);
        assert_eq!(tree.search(&1), &["a"]);
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for k in 0..1024 {
            tree.insert(k, ()).unwrap();
        }
        tree.check_invariants().unwrap();
        // A perfectly balanced tree of 1024 keys has height 11.
        assert!(tree.height() <= 12);
    }

    #[test]
    fn delete_value_keeps_non_empty_bucket() {
        let mut tree = AvlTree::new();
        tree.insert(1, "a").unwrap();
        tree.insert(1, "b").unwrap();
        tree.delete(&1, Some(&"a"));
        assert_eq!(tree.search(&1), &["b"]);
        tree.delete(&1, Some(&"zzz"));
        assert_eq!(tree.search(&1), &["b"]);
        tree.delete(&1, Some(&"b"));
        assert!(!tree.contains_key(&1));
        assert!(tree.is_empty());
    }

    #[test]
    fn delete_whole_key() {
        let mut tree = AvlTree::new();
        for k in 0..20 {
            tree.insert(k, k).unwrap();
            tree.insert(k, k + 100).unwrap();
        }
        tree.delete(&7, None);
        tree.delete(&99, None);
        assert!(tree.search(&7).is_empty());
        assert_eq!(tree.len(), 19);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn delete_root_with_two_children() {
        for _ in 0..16 {
            let mut tree = AvlTree::new();
            for k in [2, 1, 3] {
                tree.insert(k, ()).unwrap();
            }
            tree.delete(&2, None);
            assert_eq!(keys(&tree), vec![1, 3]);
            tree.check_invariants().unwrap();
        }
    }

    #[test]
    fn between_bounds_respects_inclusivity() {
        let mut tree = AvlTree::new();
        for k in 1..=9 {
            tree.insert(k, k).unwrap();
        }
        let collect = |lo, hi| -> Vec<i64> {
            tree.between_bounds(lo, hi).into_iter().copied().collect()
        };
        assert_eq!(collect(Bound::Included(&3), Bound::Included(&5)), vec![3, 4, 5]);
        assert_eq!(collect(Bound::Excluded(&3), Bound::Excluded(&5)), vec![4]);
        assert_eq!(collect(Bound::Unbounded, Bound::Excluded(&3)), vec![1, 2]);
        assert_eq!(collect(Bound::Excluded(&7), Bound::Unbounded), vec![8, 9]);
        assert!(collect(Bound::Included(&6), Bound::Included(&2)).is_empty());
    }

    #[test]
    fn min_and_max() {
        let mut tree = AvlTree::new();
        assert_eq!(tree.get_min_key(), None);
        for k in [40, 10, 30, 20] {
            tree.insert(k, ()).unwrap();
        }
        assert_eq!(tree.get_min_key(), Some(&10));
        assert_eq!(tree.get_max_key(), Some(&40));
    }

    #[test]
    fn random_operations_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = AvlTree::new();
        let mut model = std::collections::BTreeMap::new();

        for step in 0..4000 {
            let key = rng.gen_range(0..300);
            if rng.gen_bool(0.6) {
                tree.insert(key, step).unwrap();
                model.entry(key).or_insert_with(Vec::new).push(step);
            } else {
                tree.delete(&key, None);
                model.remove(&key);
            }
            if step % 97 == 0 {
                tree.check_invariants().unwrap();
            }
        }

        tree.check_invariants().unwrap();
        let expected: Vec<i64> = model.keys().copied().collect();
        assert_eq!(keys(&tree), expected);
        for (key, values) in &model {
            assert_eq!(tree.search(key), values.as_slice());
        }
    }

    #[test]
    fn custom_ordering_reverses_keys() {
        struct Reverse;
        impl KeyOrdering<i64, i64> for Reverse {
            fn compare_keys(&self, a: &i64, b: &i64) -> Ordering {
                b.cmp(a)
            }
            fn values_equal(&self, a: &i64, b: &i64) -> bool {
                a == b
            }
        }

        let mut tree = AvlTree::with_ordering(Reverse, false);
        for k in [1, 3, 2] {
            tree.insert(k, k).unwrap();
        }
        let order: Vec<i64> = tree.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(tree.get_min_key(), Some(&3));
    }
}
