//! The cluster tree.

use super::cascade::CascadeState;
use super::{Cluster, ClusterInner, ClusterNode, State};
use crate::alloc::{Allocator, Block, InnerNode, ParentLink, Ref};
use crate::error::{CoreError, CoreResult};
use crate::schema::{ColumnSpec, ColumnStorage, ColumnType};
use crate::types::{ObjKey, TableKey};
use crate::value::Mixed;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// B+tree of objects keyed by [`ObjKey`].
///
/// The tree owns the node reference held at `ndx_in_parent` of its parent
/// link. Reads resolve through that reference on every call, so a tree
/// handle never goes stale; writes copy the path from the root to the
/// touched leaf and report a replaced root to the parent, which in turn
/// rewires its own ancestors.
///
/// # Example
///
/// ```rust,ignore
/// let tree = ClusterTree::new(alloc, parent, 0, table, columns, 256);
/// let state = tree.insert(ObjKey::new(7))?;
/// tree.set_value(ObjKey::new(7), 0, Mixed::from("seven"))?;
/// let mut cascade = CascadeState::new();
/// tree.erase(ObjKey::new(7), &mut cascade)?;
/// ```
pub struct ClusterTree {
    alloc: Arc<Allocator>,
    parent: Arc<dyn ParentLink>,
    ndx_in_parent: usize,
    table: TableKey,
    columns: Vec<ColumnSpec>,
    node_max: usize,
}

impl ClusterTree {
    /// Creates a handle on the tree held at `ndx_in_parent` of `parent`.
    pub fn new(
        alloc: Arc<Allocator>,
        parent: Arc<dyn ParentLink>,
        ndx_in_parent: usize,
        table: TableKey,
        columns: Vec<ColumnSpec>,
        node_max: usize,
    ) -> Self {
        Self {
            alloc,
            parent,
            ndx_in_parent,
            table,
            columns,
            node_max,
        }
    }

    /// Allocates the root of an empty tree.
    pub fn create_root(alloc: &Allocator, columns: &[ColumnSpec]) -> Ref {
        Cluster::create(alloc, columns)
    }

    pub(crate) fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    /// Table the tree stores.
    #[must_use]
    pub fn table_key(&self) -> TableKey {
        self.table
    }

    /// Columns, in leaf slot order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Column at `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] past the last column.
    pub fn column(&self, pos: usize) -> CoreResult<&ColumnSpec> {
        self.columns
            .get(pos)
            .ok_or_else(|| CoreError::invalid_column(format!("no column at position {pos}")))
    }

    /// Maximum rows per leaf and children per inner node.
    #[must_use]
    pub fn node_max(&self) -> usize {
        self.node_max
    }

    /// Minimum occupancy of a non-root node.
    #[must_use]
    pub fn node_min(&self) -> usize {
        self.node_max / 2
    }

    /// Current root reference.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the parent holds no tree.
    pub fn root_ref(&self) -> CoreResult<Ref> {
        let root = self.parent.get_child_ref(self.ndx_in_parent)?;
        if root.is_null() {
            return Err(CoreError::corruption(format!(
                "{} has no cluster root",
                self.table
            )));
        }
        Ok(root)
    }

    fn writable_root(&self) -> CoreResult<Ref> {
        self.parent.check_writable()?;
        let root = self.root_ref()?;
        let w = self.alloc.copy_on_write(root)?;
        if w != root {
            self.parent.update_child_ref(self.ndx_in_parent, w)?;
        }
        Ok(w)
    }

    pub(crate) fn node(&self, mem: Ref, offset: i64) -> CoreResult<ClusterNode<'_>> {
        match &*self.alloc.resolve(mem)? {
            Block::Inner(_) => Ok(ClusterNode::Inner(ClusterInner::new(self, mem, offset))),
            Block::Slots(_) => Ok(ClusterNode::Leaf(Cluster::new(self, mem, offset))),
            other => Err(CoreError::corruption(format!(
                "{} block {mem:?} used as a cluster node",
                other.kind()
            ))),
        }
    }

    fn leaf(&self, mem: Ref) -> Cluster<'_> {
        Cluster::new(self, mem, 0)
    }

    /// Number of objects.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be resolved.
    pub fn size(&self) -> CoreResult<usize> {
        Ok(self.node(self.root_ref()?, 0)?.object_count()? as usize)
    }

    /// Whether the tree holds no objects.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be resolved.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.size()? == 0)
    }

    /// Inserts an object with default column values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] if `key` exists.
    pub fn insert(&self, key: ObjKey) -> CoreResult<State> {
        if self.is_valid(key)? {
            return Err(CoreError::DuplicateKey { key });
        }
        let root = self.writable_root()?;
        let root_node = self.node(root, 0)?;
        let mut state = State::default();
        if let Some(sibling) = root_node.insert(key.value(), &mut state)? {
            let counts = vec![
                root_node.object_count()?,
                self.node(sibling, 0)?.object_count()?,
            ];
            let new_root = self.alloc.alloc(Block::Inner(InnerNode {
                keys: vec![0, state.split_key],
                counts,
                children: vec![root, sibling],
            }));
            self.parent.update_child_ref(self.ndx_in_parent, new_root)?;
            debug!(table = %self.table, root = ?new_root, "cluster tree grew a level");
        }
        Ok(state)
    }

    /// Locates `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn get(&self, key: ObjKey) -> CoreResult<State> {
        self.node(self.root_ref()?, 0)?
            .get(key.value())?
            .ok_or(CoreError::KeyNotFound { key })
    }

    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn is_valid(&self, key: ObjKey) -> CoreResult<bool> {
        Ok(self.node(self.root_ref()?, 0)?.get(key.value())?.is_some())
    }

    /// Key of the object at position `ndx` in key order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn get_by_index(&self, ndx: usize) -> CoreResult<ObjKey> {
        let size = self.size()?;
        if ndx >= size {
            return Err(CoreError::IndexOutOfRange { index: ndx, size });
        }
        self.node(self.root_ref()?, 0)?.get_by_index(ndx as u64)
    }

    /// Makes every node from the root to `key`'s leaf writable and returns
    /// the row's location in the writable leaf.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent and
    /// [`CoreError::ReadOnly`] in a read snapshot.
    pub fn ensure_writeable(&self, key: ObjKey) -> CoreResult<State> {
        self.get(key)?;
        let root = self.writable_root()?;
        self.node(root, 0)?.ensure_writeable(key.value())
    }

    /// Erases `key`, recording its links in `cascade`. Returns the number of
    /// rows removed from this tree.
    ///
    /// Objects reached through the recorded links are not touched here; the
    /// caller resolves them against their own tables.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn erase(&self, key: ObjKey, cascade: &mut CascadeState) -> CoreResult<usize> {
        self.get(key)?;
        let root = self.writable_root()?;
        self.node(root, 0)?.erase(key.value(), cascade)?;
        self.demote_root()?;
        Ok(1)
    }

    /// Replaces an inner root holding one child by that child.
    fn demote_root(&self) -> CoreResult<()> {
        loop {
            let root = self.root_ref()?;
            let (child_key, single) = match &*self.alloc.resolve(root)? {
                Block::Inner(inner) if inner.children.len() == 1 => (inner.keys[0], inner.children[0]),
                _ => return Ok(()),
            };
            let child = if child_key == 0 {
                single
            } else {
                let child = self.alloc.copy_on_write(single)?;
                self.node(child, child_key)?.adjust_keys(child_key)?;
                child
            };
            self.parent.update_child_ref(self.ndx_in_parent, child)?;
            self.alloc.free(root);
            debug!(table = %self.table, root = ?child, "cluster tree lost a level");
        }
    }

    /// Visits every leaf, making each writable first.
    fn update_leaves(&self, f: &mut dyn FnMut(&Cluster<'_>) -> CoreResult<()>) -> CoreResult<()> {
        let root = self.writable_root()?;
        self.update_leaves_below(root, f)
    }

    fn update_leaves_below(
        &self,
        node: Ref,
        f: &mut dyn FnMut(&Cluster<'_>) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let children = match &*self.alloc.resolve(node)? {
            Block::Inner(inner) => inner.children.len(),
            _ => return f(&self.leaf(node)),
        };
        for i in 0..children {
            let child = self.alloc.writable_inner_child(node, i)?;
            self.update_leaves_below(child, f)?;
        }
        Ok(())
    }

    /// Visits every leaf in key order with its offset.
    fn for_each_leaf(&self, f: &mut dyn FnMut(&Cluster<'_>) -> CoreResult<()>) -> CoreResult<()> {
        let mut stack = vec![(self.root_ref()?, 0i64)];
        while let Some((node, offset)) = stack.pop() {
            match &*self.alloc.resolve(node)? {
                Block::Inner(inner) => {
                    for (key, child) in inner.keys.iter().zip(&inner.children).rev() {
                        stack.push((*child, offset.wrapping_add(*key)));
                    }
                }
                _ => f(&Cluster::new(self, node, offset))?,
            }
        }
        Ok(())
    }

    fn check_leaf_widths(&self) -> CoreResult<()> {
        let width = self.columns.len() + 1;
        self.for_each_leaf(&mut |leaf| {
            let slots = self.alloc.resolve(leaf.mem())?;
            if slots.slots()?.len() == width {
                Ok(())
            } else {
                Err(CoreError::corruption(format!(
                    "leaf {:?} out of step with the column list",
                    leaf.mem()
                )))
            }
        })
    }

    /// Adds a column at position `pos` to every leaf.
    ///
    /// Every leaf is checked before any is changed, so a failure leaves the
    /// tree as it was.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] if `pos` is past the end.
    pub fn insert_column(&mut self, pos: usize, spec: ColumnSpec) -> CoreResult<()> {
        if pos > self.columns.len() {
            return Err(CoreError::invalid_column(format!(
                "cannot insert column at {pos} of {}",
                self.columns.len()
            )));
        }
        self.check_leaf_widths()?;
        self.update_leaves(&mut |leaf| leaf.insert_column(pos, &spec))?;
        debug!(table = %self.table, column = %spec.name, pos, "column inserted");
        self.columns.insert(pos, spec);
        Ok(())
    }

    /// Removes the column at position `pos` from every leaf, releasing its
    /// blocks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] if `pos` is past the end.
    pub fn remove_column(&mut self, pos: usize) -> CoreResult<()> {
        self.column(pos)?;
        self.check_leaf_widths()?;
        self.update_leaves(&mut |leaf| leaf.remove_column(pos))?;
        let spec = self.columns.remove(pos);
        debug!(table = %self.table, column = %spec.name, pos, "column removed");
        Ok(())
    }

    /// Distinct strings stored in column `pos`, sorted.
    ///
    /// # Errors
    ///
    /// Fails if the column does not store plain values.
    pub fn distinct_strings(&self, pos: usize) -> CoreResult<Vec<String>> {
        self.column(pos)?;
        let mut seen = BTreeSet::new();
        self.for_each_leaf(&mut |leaf| {
            seen.extend(leaf.strings(pos)?);
            Ok(())
        })?;
        Ok(seen.into_iter().collect())
    }

    /// Converts the string column at `pos` to indices into `keys` in every
    /// leaf, without touching keys or row order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] unless the column is a plain
    /// string column, and [`CoreError::Corruption`] if a stored string is
    /// missing from `keys`.
    pub fn upgrade_string_to_enum(&mut self, pos: usize, keys: Vec<String>) -> CoreResult<()> {
        let spec = self.column(pos)?;
        if spec.ty != ColumnType::String || spec.storage() != ColumnStorage::Values {
            return Err(CoreError::invalid_column(format!(
                "column '{}' is not a plain string column",
                spec.name
            )));
        }
        let known: BTreeSet<&String> = keys.iter().collect();
        let missing = self
            .distinct_strings(pos)?
            .into_iter()
            .find(|s| !known.contains(s));
        if let Some(s) = missing {
            return Err(CoreError::corruption(format!("string {s:?} not enumerated")));
        }
        self.update_leaves(&mut |leaf| leaf.upgrade_string_to_enum(pos, &keys))?;
        debug!(table = %self.table, pos, keys = keys.len(), "string column enumerated");
        self.columns[pos].enum_keys = Some(keys);
        Ok(())
    }

    /// All keys in ascending order.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn keys(&self) -> CoreResult<Vec<ObjKey>> {
        let mut keys = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            let n = leaf.node_size()?;
            for i in 0..n {
                keys.push(ObjKey::new(leaf.offset().wrapping_add(leaf.key_at(i)?)));
            }
            Ok(())
        })?;
        Ok(keys)
    }

    /// Releases every node and clears the parent's reference.
    ///
    /// # Errors
    ///
    /// Fails in a read snapshot.
    pub fn destroy(&self) -> CoreResult<()> {
        self.parent.check_writable()?;
        let root = self.root_ref()?;
        self.parent.update_child_ref(self.ndx_in_parent, Ref::NULL)?;
        self.alloc.free_tree(root)
    }

    /// Value of column `pos` for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn get_value(&self, key: ObjKey, pos: usize) -> CoreResult<Mixed> {
        let state = self.get(key)?;
        self.leaf(state.mem).value(state.index, pos)
    }

    /// Stores `value` in column `pos` for `key`, returning the old value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn set_value(&self, key: ObjKey, pos: usize, value: Mixed) -> CoreResult<Mixed> {
        let state = self.ensure_writeable(key)?;
        self.leaf(state.mem).set_value(state.index, pos, value)
    }

    /// Stores an index into an enumerated column.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn set_enum_index(&self, key: ObjKey, pos: usize, index: i64) -> CoreResult<()> {
        let state = self.ensure_writeable(key)?;
        self.leaf(state.mem).set_enum_index(state.index, pos, index)
    }

    /// Origins linking to `key` through backlink column `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn backlinks(&self, key: ObjKey, pos: usize) -> CoreResult<Vec<ObjKey>> {
        let state = self.get(key)?;
        self.leaf(state.mem).backlinks(state.index, pos)
    }

    /// Records a backlink from `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn add_backlink(&self, key: ObjKey, pos: usize, origin: ObjKey) -> CoreResult<()> {
        let state = self.ensure_writeable(key)?;
        self.leaf(state.mem).add_backlink(state.index, pos, origin)
    }

    /// Removes one backlink from `origin`. Returns whether one was present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn remove_backlink(&self, key: ObjKey, pos: usize, origin: ObjKey) -> CoreResult<bool> {
        let state = self.ensure_writeable(key)?;
        self.leaf(state.mem).remove_backlink(state.index, pos, origin)
    }

    /// Whether any strong link still points at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn has_strong_backlinks(&self, key: ObjKey) -> CoreResult<bool> {
        let state = self.get(key)?;
        let leaf = self.leaf(state.mem);
        for (pos, spec) in self.columns.iter().enumerate() {
            if let ColumnType::BackLink { strong: true, .. } = spec.ty {
                if !leaf.backlinks(state.index, pos)?.is_empty() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Root of one of the two trees of the dictionary in column `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn dictionary_ref(&self, key: ObjKey, pos: usize, which: usize) -> CoreResult<Ref> {
        let state = self.get(key)?;
        self.leaf(state.mem).dictionary_ref(state.index, pos, which)
    }

    /// Replaces one of the two roots of the dictionary in column `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if absent.
    pub fn set_dictionary_ref(&self, key: ObjKey, pos: usize, which: usize, r: Ref) -> CoreResult<()> {
        let state = self.ensure_writeable(key)?;
        self.leaf(state.mem).set_dictionary_ref(state.index, pos, which, r)
    }

    /// Checks every structural invariant: node occupancy, uniform leaf
    /// depth, per-node counts, strictly increasing keys and disjoint child
    /// key ranges.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] describing the first violation.
    pub fn verify(&self) -> CoreResult<()> {
        let mut leaf_depth = None;
        self.verify_node(self.root_ref()?, 0, true, 0, &mut leaf_depth)?;
        Ok(())
    }

    fn verify_node(
        &self,
        mem: Ref,
        offset: i64,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> CoreResult<(u64, Option<(i64, i64)>)> {
        let node = self.node(mem, offset)?;
        let len = node.node_size()?;
        if len > self.node_max || (!is_root && len < self.node_min()) {
            return Err(CoreError::corruption(format!(
                "node {mem:?} holds {len} entries, outside [{}, {}]",
                self.node_min(),
                self.node_max
            )));
        }
        let inner = match node {
            ClusterNode::Leaf(leaf) => {
                match *leaf_depth {
                    Some(d) if d != depth => {
                        return Err(CoreError::corruption("cluster leaves at different depths"));
                    }
                    _ => *leaf_depth = Some(depth),
                }
                let keys = leaf.verify()?;
                let range = keys.first().zip(keys.last()).map(|(a, b)| (*a, *b));
                return Ok((keys.len() as u64, range));
            }
            ClusterNode::Inner(_) => self.alloc.resolve(mem)?.inner()?.clone(),
        };
        if inner.keys.len() != len || inner.counts.len() != len {
            return Err(CoreError::corruption(format!(
                "inner node {mem:?} arrays differ in length"
            )));
        }
        if is_root && len < 2 {
            return Err(CoreError::corruption("inner root with a single child"));
        }
        let mut total = 0;
        let mut span: Option<(i64, i64)> = None;
        for i in 0..len {
            let lower = offset.wrapping_add(inner.keys[i]);
            let (count, range) =
                self.verify_node(inner.children[i], lower, false, depth + 1, leaf_depth)?;
            if count != inner.counts[i] {
                return Err(CoreError::corruption(format!(
                    "child {:?} holds {count} objects, parent records {}",
                    inner.children[i], inner.counts[i]
                )));
            }
            if let Some((lo, hi)) = range {
                if i > 0 && lo < lower {
                    return Err(CoreError::corruption(format!(
                        "key {lo} below its child's range start {lower}"
                    )));
                }
                if i + 1 < len && hi >= offset.wrapping_add(inner.keys[i + 1]) {
                    return Err(CoreError::corruption(format!(
                        "key {hi} beyond its child's range"
                    )));
                }
                if let Some((_, prev_hi)) = span {
                    if lo <= prev_hi {
                        return Err(CoreError::corruption("overlapping child key ranges"));
                    }
                }
                span = Some((span.map_or(lo, |(s, _)| s), hi));
            }
            total += count;
        }
        Ok((total, span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::parent::tests::RootCell;
    use crate::alloc::Slot;
    use crate::schema::ColumnType;
    use crate::types::Version;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("n", 1, ColumnType::Int, false),
            ColumnSpec::new("s", 2, ColumnType::String, true),
        ]
    }

    fn tree(node_max: usize) -> (Arc<Allocator>, Arc<RootCell>, ClusterTree) {
        let alloc = Arc::new(Allocator::new());
        let cols = columns();
        let root = ClusterTree::create_root(&alloc, &cols);
        let cell = RootCell::new(root);
        let tree = ClusterTree::new(
            Arc::clone(&alloc),
            cell.clone(),
            0,
            TableKey::new(0),
            cols,
            node_max,
        );
        (alloc, cell, tree)
    }

    fn insert_all(tree: &ClusterTree, keys: impl IntoIterator<Item = i64>) {
        for k in keys {
            tree.insert(ObjKey::new(k)).unwrap();
            tree.set_value(ObjKey::new(k), 0, Mixed::Int(k * 10)).unwrap();
        }
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let (_, _, tree) = tree(4);
        insert_all(&tree, 0..200);
        tree.verify().unwrap();
        assert_eq!(tree.size().unwrap(), 200);
        assert_eq!(tree.keys().unwrap(), (0..200).map(ObjKey::new).collect::<Vec<_>>());
        assert_eq!(tree.get_value(ObjKey::new(123), 0).unwrap(), Mixed::Int(1230));
        assert_eq!(tree.get_by_index(57).unwrap(), ObjKey::new(57));
    }

    #[test]
    fn duplicate_and_missing_keys() {
        let (_, _, tree) = tree(4);
        insert_all(&tree, [3, 1]);
        assert!(matches!(
            tree.insert(ObjKey::new(3)),
            Err(CoreError::DuplicateKey { .. })
        ));
        assert!(matches!(
            tree.get(ObjKey::new(2)),
            Err(CoreError::KeyNotFound { .. })
        ));
        assert!(matches!(
            tree.get_by_index(2),
            Err(CoreError::IndexOutOfRange { index: 2, size: 2 })
        ));
        let mut cascade = CascadeState::new();
        assert!(tree.erase(ObjKey::new(2), &mut cascade).is_err());
    }

    #[test]
    fn compact_leaf_upgrades_on_gap() {
        let (alloc, cell, tree) = tree(16);
        insert_all(&tree, 0..5);
        let leaf = *cell.root.lock();
        assert!(matches!(
            alloc.resolve(leaf).unwrap().slots().unwrap()[0],
            Slot::Tagged(5)
        ));

        let mut cascade = CascadeState::new();
        tree.erase(ObjKey::new(4), &mut cascade).unwrap();
        assert!(matches!(
            alloc.resolve(leaf).unwrap().slots().unwrap()[0],
            Slot::Tagged(4)
        ));

        tree.erase(ObjKey::new(1), &mut cascade).unwrap();
        assert!(matches!(
            alloc.resolve(leaf).unwrap().slots().unwrap()[0],
            Slot::Ref(_)
        ));
        assert_eq!(
            tree.keys().unwrap(),
            vec![ObjKey::new(0), ObjKey::new(2), ObjKey::new(3)]
        );
        assert_eq!(tree.get_value(ObjKey::new(3), 0).unwrap(), Mixed::Int(30));
    }

    #[test]
    fn negative_and_sparse_keys() {
        let (_, _, tree) = tree(4);
        insert_all(&tree, [1000, -5, 40, 7, -300, 12, 999, 0, 3, -1]);
        tree.verify().unwrap();
        let keys: Vec<i64> = tree.keys().unwrap().into_iter().map(ObjKey::value).collect();
        assert_eq!(keys, vec![-300, -5, -1, 0, 3, 7, 12, 40, 999, 1000]);
        assert_eq!(tree.get_value(ObjKey::new(-300), 0).unwrap(), Mixed::Int(-3000));
    }

    #[test]
    fn erase_everything_leaves_an_empty_leaf() {
        let (alloc, cell, tree) = tree(4);
        insert_all(&tree, 0..100);
        let mut cascade = CascadeState::new();
        for k in (0..100).rev() {
            assert_eq!(tree.erase(ObjKey::new(k), &mut cascade).unwrap(), 1);
            tree.verify().unwrap();
        }
        assert!(tree.is_empty().unwrap());
        let root = *cell.root.lock();
        assert!(matches!(&*alloc.resolve(root).unwrap(), Block::Slots(_)));
        insert_all(&tree, [5]);
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn committed_tree_is_isolated_from_writes() {
        let (alloc, cell, tree) = tree(4);
        insert_all(&tree, 0..50);
        alloc.commit(Version::new(1));
        let snapshot_root = *cell.root.lock();

        let mut cascade = CascadeState::new();
        for k in 10..30 {
            tree.erase(ObjKey::new(k), &mut cascade).unwrap();
        }
        tree.set_value(ObjKey::new(0), 0, Mixed::Int(-1)).unwrap();
        insert_all(&tree, 100..120);
        tree.verify().unwrap();

        let snapshot = ClusterTree::new(
            Arc::clone(&alloc),
            RootCell::new(snapshot_root),
            0,
            TableKey::new(0),
            columns(),
            4,
        );
        snapshot.verify().unwrap();
        assert_eq!(snapshot.keys().unwrap(), (0..50).map(ObjKey::new).collect::<Vec<_>>());
        assert_eq!(snapshot.get_value(ObjKey::new(0), 0).unwrap(), Mixed::Int(0));
    }

    #[test]
    fn read_only_parent_refuses_writes() {
        let (alloc, cell, tree) = tree(4);
        insert_all(&tree, 0..3);
        alloc.commit(Version::new(1));
        *cell.writable.lock() = false;
        assert!(matches!(
            tree.set_value(ObjKey::new(1), 0, Mixed::Int(5)),
            Err(CoreError::ReadOnly)
        ));
        assert!(alloc.pending_blocks().is_empty());
    }

    #[test]
    fn columns_are_added_and_removed_in_every_leaf() {
        let (_, _, mut tree) = tree(4);
        insert_all(&tree, 0..40);
        tree.set_value(ObjKey::new(7), 1, Mixed::from("seven")).unwrap();

        tree.insert_column(1, ColumnSpec::new("flag", 3, ColumnType::Bool, false))
            .unwrap();
        tree.verify().unwrap();
        assert_eq!(tree.get_value(ObjKey::new(33), 1).unwrap(), Mixed::Bool(false));
        assert_eq!(tree.get_value(ObjKey::new(7), 2).unwrap(), Mixed::from("seven"));

        tree.remove_column(0).unwrap();
        tree.verify().unwrap();
        assert_eq!(tree.columns().len(), 2);
        assert_eq!(tree.get_value(ObjKey::new(7), 1).unwrap(), Mixed::from("seven"));
        assert!(tree.insert_column(5, ColumnSpec::new("x", 4, ColumnType::Int, false)).is_err());
    }

    #[test]
    fn string_column_becomes_enum() {
        let (_, _, mut tree) = tree(4);
        insert_all(&tree, 0..20);
        for k in 0..20 {
            let s = if k % 3 == 0 { Mixed::from("red") } else { Mixed::from("blue") };
            tree.set_value(ObjKey::new(k), 1, s).unwrap();
        }
        tree.set_value(ObjKey::new(5), 1, Mixed::Null).unwrap();

        let keys = tree.distinct_strings(1).unwrap();
        assert_eq!(keys, vec!["blue".to_string(), "red".to_string()]);
        tree.upgrade_string_to_enum(1, keys).unwrap();
        tree.verify().unwrap();

        assert_eq!(tree.get_value(ObjKey::new(3), 1).unwrap(), Mixed::from("red"));
        assert_eq!(tree.get_value(ObjKey::new(4), 1).unwrap(), Mixed::from("blue"));
        assert_eq!(tree.get_value(ObjKey::new(5), 1).unwrap(), Mixed::Null);
        assert_eq!(tree.keys().unwrap().len(), 20);
    }

    #[test]
    fn enum_upgrade_requires_every_string() {
        let (_, _, mut tree) = tree(4);
        insert_all(&tree, 0..2);
        tree.set_value(ObjKey::new(0), 1, Mixed::from("a")).unwrap();
        assert!(tree.upgrade_string_to_enum(1, vec![]).is_err());
        assert!(tree.upgrade_string_to_enum(0, vec![]).is_err());
        assert_eq!(tree.get_value(ObjKey::new(0), 1).unwrap(), Mixed::from("a"));
    }

    #[test]
    fn extreme_keys_after_a_negative_split() {
        let (_, _, tree) = tree(4);
        insert_all(&tree, -10..=-6);
        for k in [i64::MAX, i64::MIN, i64::MAX - 1, i64::MIN + 1, 0] {
            tree.insert(ObjKey::new(k)).unwrap();
            tree.set_value(ObjKey::new(k), 0, Mixed::Int(k)).unwrap();
            tree.verify().unwrap();
        }
        let keys: Vec<i64> = tree.keys().unwrap().into_iter().map(ObjKey::value).collect();
        assert_eq!(
            keys,
            vec![i64::MIN, i64::MIN + 1, -10, -9, -8, -7, -6, 0, i64::MAX - 1, i64::MAX]
        );
        assert_eq!(tree.get_value(ObjKey::new(i64::MAX), 0).unwrap(), Mixed::Int(i64::MAX));
        assert_eq!(tree.get_by_index(0).unwrap(), ObjKey::new(i64::MIN));
        assert!(matches!(
            tree.insert(ObjKey::new(i64::MIN)),
            Err(CoreError::DuplicateKey { .. })
        ));

        let mut cascade = CascadeState::new();
        for k in [i64::MIN, -8, i64::MAX, -10, -6] {
            tree.erase(ObjKey::new(k), &mut cascade).unwrap();
            tree.verify().unwrap();
        }
        let keys: Vec<i64> = tree.keys().unwrap().into_iter().map(ObjKey::value).collect();
        assert_eq!(keys, vec![i64::MIN + 1, -9, -7, 0, i64::MAX - 1]);
    }

    #[test]
    fn root_over_a_negative_split_routes_both_halves() {
        let (alloc, cell, tree) = tree(4);
        insert_all(&tree, [-20, -15, -12, -11, -10]);
        let root = *cell.root.lock();
        let keys = alloc.resolve(root).unwrap().inner().unwrap().keys.clone();
        assert!(keys[1] < keys[0]);
        tree.verify().unwrap();
        for k in [-20, -15, -12, -11, -10] {
            assert_eq!(tree.get_value(ObjKey::new(k), 0).unwrap(), Mixed::Int(k * 10));
        }
        insert_all(&tree, [-30, 5]);
        tree.verify().unwrap();
        assert_eq!(tree.size().unwrap(), 7);
    }

    proptest! {
        #[test]
        fn random_inserts_and_erases(
            inserts in prop::collection::vec(
                prop_oneof![4 => -500i64..500, 1 => any::<i64>()],
                1..200,
            ),
            erase_mask in prop::collection::vec(any::<bool>(), 200),
        ) {
            let (_, _, tree) = tree(4);
            let mut model = BTreeSet::new();
            for k in &inserts {
                if model.insert(*k) {
                    tree.insert(ObjKey::new(*k)).unwrap();
                }
            }
            tree.verify().unwrap();
            let mut cascade = CascadeState::new();
            for (k, erase) in inserts.iter().zip(&erase_mask) {
                if *erase && model.remove(k) {
                    tree.erase(ObjKey::new(*k), &mut cascade).unwrap();
                    tree.verify().unwrap();
                }
            }
            let keys: Vec<i64> = tree.keys().unwrap().into_iter().map(ObjKey::value).collect();
            prop_assert_eq!(keys, model.into_iter().collect::<Vec<_>>());
        }
    }
}
