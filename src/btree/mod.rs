//! A cache-line-sized B+ tree.
//!
//! The tree keeps its keys in inner [`Node`]s and its key/value pairs
//! in [`Leaf`]s, both sized so one fits a small multiple of a cache
//! line. All children of a node live in one contiguous *group*;
//! groups are arena-allocated and leaf groups form a doubly linked
//! list, so ordered iteration walks sibling leaves without touching
//! the inner levels.
//!
//! Used by the runtime as the [`BPTreeStorage`] component storage and
//! usable standalone as an ordered map.
//!
//! [`BPTreeStorage`]: crate::storage::BPTreeStorage

pub use self::cursor::{Cursor, Iter};

use self::group::{split_members, Arena, LeafGroup, LeafGroupRef, NodeGroup, NodeGroupRef};
use self::node::{Leaf, Node};

mod cursor;
mod group;
mod node;
#[cfg(test)]
mod tests;

/// Cache-line size the default geometry is computed for.
pub const CACHE_LINE_SIZE: usize = 64;

/// Byte budget for one node or leaf: two cache lines.
const SIZE_BUDGET: usize = 2 * CACHE_LINE_SIZE;

/// Smallest branching factor the geometry will pick, whatever the
/// key and value sizes.
pub const MIN_BRANCHING_FACTOR: usize = 8;

/// Largest `N` such that an inner node (child reference, slot
/// counter, `N` keys) fits the size budget, floored at
/// [`MIN_BRANCHING_FACTOR`].
pub const fn node_capacity(key_size: usize) -> usize {
    let overhead = std::mem::size_of::<u32>() + std::mem::size_of::<u16>();
    if key_size == 0 {
        return MIN_BRANCHING_FACTOR;
    }
    let calc = (SIZE_BUDGET - overhead) / key_size;
    if calc < MIN_BRANCHING_FACTOR {
        MIN_BRANCHING_FACTOR
    } else {
        calc
    }
}

/// Largest `M` such that a leaf (slot counter plus parallel key and
/// value arrays) fits the size budget, floored at
/// [`MIN_BRANCHING_FACTOR`].
pub const fn leaf_capacity(key_size: usize, value_size: usize) -> usize {
    let overhead = std::mem::size_of::<u16>();
    let pair = key_size + value_size;
    if pair == 0 {
        return MIN_BRANCHING_FACTOR;
    }
    let calc = (SIZE_BUDGET - overhead) / pair;
    if calc < MIN_BRANCHING_FACTOR {
        MIN_BRANCHING_FACTOR
    } else {
        calc
    }
}

/// Default node branching factor, computed for 8-byte keys.
pub const DEFAULT_NODE_CAPACITY: usize = node_capacity(8);

/// Default leaf branching factor, computed for 8-byte keys and
/// values.
pub const DEFAULT_LEAF_CAPACITY: usize = leaf_capacity(8, 8);

/// Structural counters of a tree. All of them return to zero when
/// the last key is removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Allocated node groups.
    pub node_groups: u64,
    /// Inner nodes across all node groups.
    pub nodes: u64,
    /// Separator keys resident in inner nodes.
    pub node_keys: u64,
    /// Allocated leaf groups.
    pub leaf_groups: u64,
    /// Leaves across all leaf groups.
    pub leaves: u64,
    /// Key/value pairs resident in leaves.
    pub leaf_keys: u64,
}

impl TreeStats {
    /// Whether every counter is zero.
    pub fn is_zero(&self) -> bool {
        *self == TreeStats::default()
    }
}

/// What the root pointer refers to: a single leaf group while the
/// tree has height zero, a node group otherwise.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RootRef {
    Leaves(LeafGroupRef),
    Nodes(NodeGroupRef),
}

/// One step of a recorded descent: the node group, the node within
/// it, and the child slot the search took.
#[derive(Clone, Copy, Debug)]
struct PathEntry {
    group: NodeGroupRef,
    node: usize,
    slot: usize,
}

/// An ordered map from `K` to `V` with cache-line-sized nodes.
///
/// `N` and `M` are the node and leaf branching factors. The defaults
/// are computed for word-sized keys and values; for other shapes the
/// [`node_capacity`] and [`leaf_capacity`] helpers yield exact
/// geometry:
///
/// ```
/// use orrery::btree::{leaf_capacity, node_capacity, BPTree};
///
/// type Wide = BPTree<u64, [u64; 4], { node_capacity(8) }, { leaf_capacity(8, 32) }>;
/// let mut tree = Wide::new();
/// tree.insert(7, [0; 4]);
/// assert!(tree.search(&7).is_some());
/// ```
pub struct BPTree<K, V, const N: usize = DEFAULT_NODE_CAPACITY, const M: usize = DEFAULT_LEAF_CAPACITY>
{
    node_groups: Arena<NodeGroup<K, N>>,
    leaf_groups: Arena<LeafGroup<K, V, M>>,
    root: Option<RootRef>,
    /// Inner levels above the leaves; 0 means the root is a leaf
    /// group holding a single leaf.
    height: usize,
    first_leaf_group: Option<LeafGroupRef>,
    last_leaf_group: Option<LeafGroupRef>,
    len: usize,
    stats: TreeStats,
}

impl<K, V, const N: usize, const M: usize> Default for BPTree<K, V, N, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize, const M: usize> BPTree<K, V, N, M> {
    /// Creates an empty tree without allocating.
    pub fn new() -> Self {
        BPTree {
            node_groups: Arena::new(),
            leaf_groups: Arena::new(),
            root: None,
            height: 0,
            first_leaf_group: None,
            last_leaf_group: None,
            len: 0,
            stats: TreeStats::default(),
        }
    }

    /// Number of key/value pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no pairs.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Inner levels above the leaf level.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Structural counters.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Drops every pair and releases all groups.
    pub fn clear(&mut self) {
        self.node_groups.clear();
        self.leaf_groups.clear();
        self.root = None;
        self.height = 0;
        self.first_leaf_group = None;
        self.last_leaf_group = None;
        self.len = 0;
        self.stats = TreeStats::default();
    }

    /// Swaps the contents of two trees.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }
}

impl<K: Ord + Clone, V, const N: usize, const M: usize> BPTree<K, V, N, M> {
    /// Inserts `value` under `key`, returning the previous value if
    /// the key was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.ensure_root();
        let (path, lg_ref, leaf_idx) = self.descend(&key);
        let slot = self.leaf_groups.get(lg_ref.0).leaves[leaf_idx].search(&key);
        match slot {
            Ok(i) => {
                let leaf = &mut self.leaf_groups.get_mut(lg_ref.0).leaves[leaf_idx];
                Some(std::mem::replace(leaf.value_mut(i), value))
            }
            Err(i) => {
                self.insert_at_leaf(&path, lg_ref, leaf_idx, i, key, value);
                None
            }
        }
    }

    /// Returns the value under `key`, inserting `value` first if the
    /// key is absent. An existing value is kept, not replaced.
    pub fn search_or_insert(&mut self, key: K, value: V) -> &mut V {
        self.search_or_insert_with(key, move || value)
    }

    /// Returns the value under `key`, inserting `f()` first if the
    /// key is absent.
    pub fn search_or_insert_with(&mut self, key: K, f: impl FnOnce() -> V) -> &mut V {
        self.ensure_root();
        let (path, lg_ref, leaf_idx) = self.descend(&key);
        let slot = self.leaf_groups.get(lg_ref.0).leaves[leaf_idx].search(&key);
        match slot {
            Ok(i) => self.leaf_groups.get_mut(lg_ref.0).leaves[leaf_idx].value_mut(i),
            Err(i) => {
                self.insert_at_leaf(&path, lg_ref, leaf_idx, i, key.clone(), f());
                // The splits may have moved the pair; look it up
                // again.
                let (lg2, leaf2) = self.find_leaf(&key);
                let leaf = &mut self.leaf_groups.get_mut(lg2.0).leaves[leaf2];
                let slot = leaf.search(&key).expect("key was just inserted");
                leaf.value_mut(slot)
            }
        }
    }

    /// Shared lookup.
    pub fn search(&self, key: &K) -> Option<&V> {
        if self.root.is_none() {
            return None;
        }
        let (lg_ref, leaf_idx) = self.find_leaf(key);
        let leaf = &self.leaf_groups.get(lg_ref.0).leaves[leaf_idx];
        let slot = leaf.search(key).ok()?;
        Some(leaf.value(slot))
    }

    /// Mutable lookup.
    pub fn search_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.root.is_none() {
            return None;
        }
        let (lg_ref, leaf_idx) = self.find_leaf(key);
        let leaf = &mut self.leaf_groups.get_mut(lg_ref.0).leaves[leaf_idx];
        let slot = leaf.search(key).ok()?;
        Some(leaf.value_mut(slot))
    }

    /// Removes the pair under `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self.root? {
            RootRef::Leaves(g) => {
                // Height 0: the root is a single leaf.
                let leaf = &mut self.leaf_groups.get_mut(g.0).leaves[0];
                let slot = leaf.search(key).ok()?;
                let (_, value) = leaf.remove_at(slot);
                self.len -= 1;
                self.stats.leaf_keys -= 1;
                if self.leaf_groups.get(g.0).leaves[0].is_empty() {
                    self.leaf_groups.free(g.0);
                    self.stats.leaf_groups -= 1;
                    self.stats.leaves -= 1;
                    self.root = None;
                    self.first_leaf_group = None;
                    self.last_leaf_group = None;
                }
                Some(value)
            }
            RootRef::Nodes(g) => {
                let value = self.remove_rec(0, g, 0, key)?;
                self.len -= 1;
                self.collapse_root();
                Some(value)
            }
        }
    }

    /// Checks every structural invariant and the statistics counters.
    ///
    /// # Panics
    ///
    /// Panics on the first violation; meant for tests and debugging.
    pub fn verify(&self) {
        let root = match self.root {
            None => {
                assert_eq!(self.height, 0, "empty tree must have height 0");
                assert!(self.first_leaf_group.is_none() && self.last_leaf_group.is_none());
                assert_eq!(self.len, 0);
                assert!(self.stats.is_zero(), "empty tree must have zero stats");
                return;
            }
            Some(root) => root,
        };

        let mut seen = TreeStats::default();
        let mut chain = Vec::new();
        match root {
            RootRef::Leaves(g) => {
                let lg = self.leaf_groups.get(g.0);
                assert_eq!(lg.len(), 1, "height-0 root group holds exactly one leaf");
                assert!(!lg.leaves[0].is_empty(), "root leaf may not be empty");
                self.verify_leaf_group(g, &mut seen, &mut chain);
            }
            RootRef::Nodes(g) => {
                let ng = self.node_groups.get(g.0);
                assert_eq!(ng.len(), 1, "root node group holds exactly one node");
                assert!(ng.nodes[0].len() >= 1, "root node needs at least one key");
                self.verify_node_group(0, g, true, &mut seen, &mut chain);
            }
        }

        assert_eq!(self.stats, seen, "statistics disagree with the tree");
        assert_eq!(self.len as u64, seen.leaf_keys);
        assert_eq!(self.node_groups.len() as u64, seen.node_groups);
        assert_eq!(self.leaf_groups.len() as u64, seen.leaf_groups);

        // The leaf-group chain must enumerate the groups in order.
        assert_eq!(self.first_leaf_group, chain.first().copied());
        assert_eq!(self.last_leaf_group, chain.last().copied());
        let mut walk = self.first_leaf_group;
        let mut prev = None;
        for &expected in &chain {
            let current = walk.expect("leaf-group chain ended early");
            assert_eq!(current, expected, "leaf-group chain out of order");
            let lg = self.leaf_groups.get(current.0);
            assert_eq!(lg.prev, prev, "broken prev link");
            prev = walk;
            walk = lg.next;
        }
        assert!(walk.is_none(), "leaf-group chain has extra groups");
    }

    // --- Internals ---------------------------------------------------------

    fn ensure_root(&mut self) {
        if self.root.is_some() {
            return;
        }
        let mut lg = LeafGroup::new(N + 1);
        lg.leaves.push(Leaf::new());
        let g = LeafGroupRef(self.leaf_groups.alloc(lg));
        self.root = Some(RootRef::Leaves(g));
        self.first_leaf_group = Some(g);
        self.last_leaf_group = Some(g);
        self.height = 0;
        self.stats.leaf_groups += 1;
        self.stats.leaves += 1;
    }

    /// Descends to the leaf that should hold `key`, recording the
    /// path for structural updates.
    fn descend(&self, key: &K) -> (Vec<PathEntry>, LeafGroupRef, usize) {
        let path = Vec::with_capacity(self.height);
        match self.root.expect("descend on an empty tree") {
            RootRef::Leaves(g) => (path, g, 0),
            RootRef::Nodes(g) => {
                let mut path = path;
                let mut group = g;
                let mut node_idx = 0;
                for level in 0..self.height {
                    let node = &self.node_groups.get(group.0).nodes[node_idx];
                    let slot = node.find_child(key);
                    path.push(PathEntry {
                        group,
                        node: node_idx,
                        slot,
                    });
                    if level + 1 == self.height {
                        return (path, LeafGroupRef(node.child_raw()), slot);
                    }
                    group = NodeGroupRef(node.child_raw());
                    node_idx = slot;
                }
                unreachable!("height-0 trees have a leaf root")
            }
        }
    }

    /// Pathless descent for lookups.
    fn find_leaf(&self, key: &K) -> (LeafGroupRef, usize) {
        match self.root.expect("find_leaf on an empty tree") {
            RootRef::Leaves(g) => (g, 0),
            RootRef::Nodes(g) => {
                let mut group = g;
                let mut node_idx = 0;
                for level in 0..self.height {
                    let node = &self.node_groups.get(group.0).nodes[node_idx];
                    let slot = node.find_child(key);
                    if level + 1 == self.height {
                        return (LeafGroupRef(node.child_raw()), slot);
                    }
                    group = NodeGroupRef(node.child_raw());
                    node_idx = slot;
                }
                unreachable!("height-0 trees have a leaf root")
            }
        }
    }

    /// Inserts a fresh pair at `pos` of the located leaf, splitting
    /// leaf, groups and nodes upward as capacity requires.
    fn insert_at_leaf(
        &mut self,
        path: &[PathEntry],
        lg_ref: LeafGroupRef,
        leaf_idx: usize,
        pos: usize,
        key: K,
        value: V,
    ) {
        self.len += 1;
        self.stats.leaf_keys += 1;

        {
            let leaf = &mut self.leaf_groups.get_mut(lg_ref.0).leaves[leaf_idx];
            if !leaf.is_full() {
                leaf.insert_at(pos, key, value);
                return;
            }
        }

        // Split the leaf; the larger half stays left.
        let mid = (M + 1) / 2;
        let mut right = {
            let leaf = &mut self.leaf_groups.get_mut(lg_ref.0).leaves[leaf_idx];
            let mut right = leaf.split_off(mid);
            if pos < mid {
                leaf.insert_at(pos, key, value);
            } else {
                right.insert_at(pos - mid, key, value);
            }
            right
        };
        self.stats.leaves += 1;
        let sep = right.first_key().clone();

        if self.height == 0 {
            // The root leaf splits: the group gains the new leaf and
            // the first inner level appears above it.
            self.leaf_groups.get_mut(lg_ref.0).leaves.insert(leaf_idx + 1, right);
            let root = self.new_root_over(sep, lg_ref.0);
            self.root = Some(RootRef::Nodes(root));
            self.height = 1;
            return;
        }

        let entry = path[self.height - 1];
        if !self.node_groups.get(entry.group.0).nodes[entry.node].is_full() {
            self.leaf_groups.get_mut(lg_ref.0).leaves.insert(leaf_idx + 1, right);
            self.node_groups.get_mut(entry.group.0).nodes[entry.node]
                .insert_key_at(entry.slot, sep);
            self.stats.node_keys += 1;
            return;
        }

        // The parent is full: split the leaf group together with it
        // and push the promoted key upward.
        let (mut pending_key, mut pending_node) =
            self.split_leaf_parent(entry, lg_ref, leaf_idx, sep, right);

        let mut level = self.height - 1;
        loop {
            if level == 0 {
                // The root node split; grow the tree by one level.
                let root_entry = path[0];
                self.node_groups
                    .get_mut(root_entry.group.0)
                    .nodes
                    .insert(root_entry.node + 1, pending_node);
                let root = self.new_root_over(pending_key, root_entry.group.0);
                self.root = Some(RootRef::Nodes(root));
                self.height += 1;
                return;
            }

            let parent = path[level - 1];
            let split_group = path[level].group;
            let split_idx = path[level].node;
            debug_assert_eq!(split_idx, parent.slot);

            if !self.node_groups.get(parent.group.0).nodes[parent.node].is_full() {
                self.node_groups
                    .get_mut(split_group.0)
                    .nodes
                    .insert(split_idx + 1, pending_node);
                self.node_groups.get_mut(parent.group.0).nodes[parent.node]
                    .insert_key_at(parent.slot, pending_key);
                self.stats.node_keys += 1;
                return;
            }

            let (next_key, next_node) =
                self.split_node_parent(parent, split_group, split_idx, pending_key, pending_node);
            pending_key = next_key;
            pending_node = next_node;
            level -= 1;
        }
    }

    /// Allocates a one-node root group over `child`.
    fn new_root_over(&mut self, sep: K, child: u32) -> NodeGroupRef {
        let mut root_node = Node::new();
        root_node.push_key(sep);
        root_node.set_child(child);
        let mut ng = NodeGroup::new();
        ng.nodes.push(root_node);
        let g = NodeGroupRef(self.node_groups.alloc(ng));
        self.stats.node_groups += 1;
        self.stats.nodes += 1;
        self.stats.node_keys += 1;
        g
    }

    /// Splits a full leaf-parent node and its leaf group, inserting
    /// `right_leaf` beside `leaf_idx` and `sep` among the keys.
    /// Returns the promoted key and the new right node, which must
    /// join the parent's group one level up.
    fn split_leaf_parent(
        &mut self,
        entry: PathEntry,
        lg_ref: LeafGroupRef,
        leaf_idx: usize,
        sep: K,
        right_leaf: Leaf<K, V, M>,
    ) -> (K, Node<K, N>) {
        let (promoted, mut right_node) = self.node_groups.get_mut(entry.group.0).nodes[entry.node]
            .split_with(entry.slot, sep);
        let left_count = self.node_groups.get(entry.group.0).nodes[entry.node].len() + 1;

        let mut new_group = LeafGroup::new(N + 1);
        {
            let old = self.leaf_groups.get_mut(lg_ref.0);
            split_members(
                &mut old.leaves,
                &mut new_group.leaves,
                leaf_idx + 1,
                left_count,
                right_leaf,
            );
        }
        debug_assert_eq!(new_group.len(), right_node.len() + 1);

        let new_ref = LeafGroupRef(self.leaf_groups.alloc(new_group));
        self.stats.leaf_groups += 1;
        self.stats.nodes += 1;

        // Splice the new group into the leaf-group chain.
        let old_next = {
            let old = self.leaf_groups.get_mut(lg_ref.0);
            std::mem::replace(&mut old.next, Some(new_ref))
        };
        {
            let new = self.leaf_groups.get_mut(new_ref.0);
            new.prev = Some(lg_ref);
            new.next = old_next;
        }
        match old_next {
            Some(next) => self.leaf_groups.get_mut(next.0).prev = Some(new_ref),
            None => self.last_leaf_group = Some(new_ref),
        }

        right_node.set_child(new_ref.0);
        (promoted, right_node)
    }

    /// Splits a full inner parent node and the node group below it,
    /// inserting `pending_node` beside `split_idx` and `pending_key`
    /// among the keys. Returns the promoted key and the new right
    /// node for the next level up.
    fn split_node_parent(
        &mut self,
        parent: PathEntry,
        split_group: NodeGroupRef,
        split_idx: usize,
        pending_key: K,
        pending_node: Node<K, N>,
    ) -> (K, Node<K, N>) {
        debug_assert!(self.node_groups.get(split_group.0).is_full());
        let (promoted, mut right_node) = self.node_groups.get_mut(parent.group.0).nodes
            [parent.node]
            .split_with(parent.slot, pending_key);
        let left_count = self.node_groups.get(parent.group.0).nodes[parent.node].len() + 1;

        let mut new_group = NodeGroup::new();
        {
            let old = self.node_groups.get_mut(split_group.0);
            split_members(
                &mut old.nodes,
                &mut new_group.nodes,
                split_idx + 1,
                left_count,
                pending_node,
            );
        }
        debug_assert_eq!(new_group.len(), right_node.len() + 1);

        let new_ref = NodeGroupRef(self.node_groups.alloc(new_group));
        self.stats.node_groups += 1;
        self.stats.nodes += 1;

        right_node.set_child(new_ref.0);
        (promoted, right_node)
    }

    /// Removes `key` somewhere below the node `(group, node_idx)` at
    /// `level`, restoring occupancy invariants on the way back up.
    fn remove_rec(
        &mut self,
        level: usize,
        group: NodeGroupRef,
        node_idx: usize,
        key: &K,
    ) -> Option<V> {
        let (j, child_raw) = {
            let node = &self.node_groups.get(group.0).nodes[node_idx];
            (node.find_child(key), node.child_raw())
        };

        if level + 1 == self.height {
            let lg_ref = LeafGroupRef(child_raw);
            let value = {
                let leaf = &mut self.leaf_groups.get_mut(lg_ref.0).leaves[j];
                let slot = leaf.search(key).ok()?;
                leaf.remove_at(slot).1
            };
            self.stats.leaf_keys -= 1;

            if self.leaf_groups.get(lg_ref.0).leaves[j].under_min() {
                self.fix_leaf_underflow(group, node_idx, lg_ref, j);
            }
            self.refresh_separators(level, group, node_idx);
            Some(value)
        } else {
            let child_group = NodeGroupRef(child_raw);
            let value = self.remove_rec(level + 1, child_group, j, key)?;

            if self.node_groups.get(child_group.0).nodes[j].under_min() {
                self.fix_node_underflow(level + 1, group, node_idx, child_group, j);
            }
            self.refresh_separators(level, group, node_idx);
            Some(value)
        }
    }

    /// Merges or balances the under-minimum leaf `j` with the richer
    /// of its neighbours inside the same group.
    fn fix_leaf_underflow(
        &mut self,
        parent_group: NodeGroupRef,
        parent_idx: usize,
        lg_ref: LeafGroupRef,
        j: usize,
    ) {
        let members = self.leaf_groups.get(lg_ref.0).len();
        if members <= 1 {
            return;
        }
        let l = {
            let lg = self.leaf_groups.get(lg_ref.0);
            if j == 0 {
                0
            } else if j + 1 >= members {
                j - 1
            } else if lg.leaves[j - 1].len() > lg.leaves[j + 1].len() {
                j - 1
            } else {
                j
            }
        };
        let donor = if l == j { l + 1 } else { l };
        let merge = self.leaf_groups.get(lg_ref.0).leaves[donor].at_min();

        if merge {
            self.leaf_groups.get_mut(lg_ref.0).merge_adjacent(l);
            self.stats.leaves -= 1;
            self.node_groups.get_mut(parent_group.0).nodes[parent_idx].remove_key_at(l);
            self.stats.node_keys -= 1;
        } else {
            self.leaf_groups.get_mut(lg_ref.0).balance_adjacent(l);
        }
    }

    /// Merges or balances the under-minimum inner node `j` of
    /// `child_group` with the richer of its neighbours, merging or
    /// rotating their child groups along.
    fn fix_node_underflow(
        &mut self,
        child_level: usize,
        parent_group: NodeGroupRef,
        parent_idx: usize,
        child_group: NodeGroupRef,
        j: usize,
    ) {
        let members = self.node_groups.get(child_group.0).len();
        if members <= 1 {
            return;
        }
        let l = {
            let cg = self.node_groups.get(child_group.0);
            if j == 0 {
                0
            } else if j + 1 >= members {
                j - 1
            } else if cg.nodes[j - 1].len() > cg.nodes[j + 1].len() {
                j - 1
            } else {
                j
            }
        };
        let donor = if l == j { l + 1 } else { l };
        let merge = self.node_groups.get(child_group.0).nodes[donor].at_min();

        if merge {
            // Pull the separator down between the merged nodes and
            // concatenate their child groups.
            let sep = self.node_groups.get_mut(parent_group.0).nodes[parent_idx].remove_key_at(l);
            self.stats.node_keys -= 1;
            let (left_child, right_child) = {
                let cg = self.node_groups.get(child_group.0);
                (cg.nodes[l].child_raw(), cg.nodes[l + 1].child_raw())
            };
            if child_level + 1 == self.height {
                self.merge_leaf_groups(LeafGroupRef(left_child), LeafGroupRef(right_child));
            } else {
                self.merge_node_groups(NodeGroupRef(left_child), NodeGroupRef(right_child));
            }
            let _ = self.node_groups.get_mut(child_group.0).merge_adjacent(l, sep);
            self.stats.node_keys += 1;
            self.stats.nodes -= 1;
        } else {
            self.balance_nodes(child_level, parent_group, parent_idx, child_group, l);
        }
    }

    /// Rotates keys and child-group members between the sibling
    /// nodes `(l, l + 1)` of `child_group`, through the separator in
    /// the parent.
    fn balance_nodes(
        &mut self,
        child_level: usize,
        parent_group: NodeGroupRef,
        parent_idx: usize,
        child_group: NodeGroupRef,
        l: usize,
    ) {
        let min = Node::<K, N>::MIN_KEYS;
        let (left_len, right_len) = {
            let cg = self.node_groups.get(child_group.0);
            (cg.nodes[l].len(), cg.nodes[l + 1].len())
        };
        let from_right = right_len > left_len;
        let donor_len = if from_right { right_len } else { left_len };
        let count = (donor_len - min + 1) / 2;

        for _ in 0..count {
            // Move one key through the separator and one member
            // between the child groups.
            let (left_child, right_child) = {
                let (pg, cg) = self.node_groups.get2_mut(parent_group.0, child_group.0);
                let parent = &mut pg.nodes[parent_idx];
                let (left, right) = cg.pair_mut(l);
                if from_right {
                    let new_sep = right.remove_key_at(0);
                    let old_sep = parent.replace_key(l, new_sep);
                    left.push_key(old_sep);
                } else {
                    let new_sep = left.remove_key_at(left.len() - 1);
                    let old_sep = parent.replace_key(l, new_sep);
                    right.insert_key_at(0, old_sep);
                }
                (left.child_raw(), right.child_raw())
            };

            if child_level + 1 == self.height {
                let (lg, rg) = self.leaf_groups.get2_mut(left_child, right_child);
                if from_right {
                    let moved = rg.leaves.remove(0);
                    lg.leaves.push(moved);
                } else {
                    let moved = lg.leaves.pop().expect("donor group is non-empty");
                    rg.leaves.insert(0, moved);
                }
            } else {
                let (lg, rg) = self.node_groups.get2_mut(left_child, right_child);
                if from_right {
                    let moved = rg.nodes.remove(0);
                    lg.nodes.push(moved);
                } else {
                    let moved = lg.nodes.pop().expect("donor group is non-empty");
                    rg.nodes.insert(0, moved);
                }
            }
        }
    }

    /// Concatenates `right` into `left` and splices `right` out of
    /// the leaf-group chain.
    fn merge_leaf_groups(&mut self, left: LeafGroupRef, right: LeafGroupRef) {
        let new_next = {
            let (lg, rg) = self.leaf_groups.get2_mut(left.0, right.0);
            debug_assert!(lg.len() + rg.len() <= N + 1);
            let mut moved = std::mem::take(&mut rg.leaves);
            lg.leaves.append(&mut moved);
            let new_next = rg.next.take();
            lg.next = new_next;
            new_next
        };
        self.leaf_groups.free(right.0);
        self.stats.leaf_groups -= 1;
        match new_next {
            Some(next) => self.leaf_groups.get_mut(next.0).prev = Some(left),
            None => self.last_leaf_group = Some(left),
        }
    }

    /// Concatenates `right` into `left` and frees `right`.
    fn merge_node_groups(&mut self, left: NodeGroupRef, right: NodeGroupRef) {
        {
            let (lg, rg) = self.node_groups.get2_mut(left.0, right.0);
            debug_assert!(lg.len() + rg.len() <= N + 1);
            let mut moved = std::mem::take(&mut rg.nodes);
            lg.nodes.append(&mut moved);
        }
        self.node_groups.free(right.0);
        self.stats.node_groups -= 1;
    }

    /// Rewrites every separator of the node so separator `i` equals
    /// the leftmost key of its child `i + 1`'s subtree.
    fn refresh_separators(&mut self, level: usize, group: NodeGroupRef, node_idx: usize) {
        let (child_raw, slots) = {
            let node = &self.node_groups.get(group.0).nodes[node_idx];
            (node.child_raw(), node.len())
        };
        let mut seps = Vec::with_capacity(slots);
        for i in 1..=slots {
            seps.push(self.leftmost_key_below(level + 1, child_raw, i));
        }
        let node = &mut self.node_groups.get_mut(group.0).nodes[node_idx];
        for (i, sep) in seps.into_iter().enumerate() {
            node.set_key(i, sep);
        }
    }

    /// Leftmost key of the subtree rooted at member `idx` of the
    /// group `group_raw` at `level` (`level == height` means the
    /// member is a leaf).
    fn leftmost_key_below(&self, mut level: usize, mut group_raw: u32, mut idx: usize) -> K {
        while level < self.height {
            let node = &self.node_groups.get(group_raw).nodes[idx];
            group_raw = node.child_raw();
            idx = 0;
            level += 1;
        }
        self.leaf_groups.get(group_raw).leaves[idx].first_key().clone()
    }

    /// Shrinks the tree while the root node has no keys left.
    fn collapse_root(&mut self) {
        loop {
            let g = match self.root {
                Some(RootRef::Nodes(g)) => g,
                _ => return,
            };
            let root_node = &self.node_groups.get(g.0).nodes[0];
            if root_node.len() > 0 {
                return;
            }
            let child = root_node.child_raw();
            self.node_groups.free(g.0);
            self.stats.node_groups -= 1;
            self.stats.nodes -= 1;
            self.height -= 1;
            self.root = Some(if self.height == 0 {
                RootRef::Leaves(LeafGroupRef(child))
            } else {
                RootRef::Nodes(NodeGroupRef(child))
            });
        }
    }

    // --- Verification helpers ---------------------------------------------

    fn verify_leaf_group(
        &self,
        g: LeafGroupRef,
        seen: &mut TreeStats,
        chain: &mut Vec<LeafGroupRef>,
    ) {
        chain.push(g);
        seen.leaf_groups += 1;
        let lg = self.leaf_groups.get(g.0);
        let mut previous: Option<&K> = None;
        for leaf in &lg.leaves {
            seen.leaves += 1;
            seen.leaf_keys += leaf.len() as u64;
            if self.height > 0 {
                assert!(
                    leaf.len() >= Leaf::<K, V, M>::MIN_KEYS,
                    "leaf under minimal occupancy"
                );
            }
            for key in leaf.keys() {
                if let Some(prev) = previous {
                    assert!(prev < key, "keys not strictly ascending");
                }
                previous = Some(key);
            }
        }
    }

    fn verify_node_group(
        &self,
        level: usize,
        g: NodeGroupRef,
        is_root: bool,
        seen: &mut TreeStats,
        chain: &mut Vec<LeafGroupRef>,
    ) {
        seen.node_groups += 1;
        let ng = self.node_groups.get(g.0);
        // Group occupancy bounds follow from the per-node key minima
        // plus the occupancy coupling asserted below.
        for node in &ng.nodes {
            seen.nodes += 1;
            seen.node_keys += node.len() as u64;
            if !is_root {
                assert!(node.len() >= Node::<K, N>::MIN_KEYS, "node under minimal occupancy");
            }
            // Separator i must equal the leftmost key of child i+1.
            for (i, sep) in node.keys().iter().enumerate() {
                let leftmost = self.leftmost_key_below(level + 1, node.child_raw(), i + 1);
                assert!(*sep == leftmost, "separator does not match subtree leftmost");
            }
            // Child occupancy is coupled to the key count.
            let children = node.len() + 1;
            if level + 1 == self.height {
                assert_eq!(self.leaf_groups.get(node.child_raw()).len(), children);
                self.verify_leaf_group(LeafGroupRef(node.child_raw()), seen, chain);
            } else {
                assert_eq!(self.node_groups.get(node.child_raw()).len(), children);
                self.verify_node_group(
                    level + 1,
                    NodeGroupRef(node.child_raw()),
                    false,
                    seen,
                    chain,
                );
            }
        }
    }
}
