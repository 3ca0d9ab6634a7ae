//! Cluster inner nodes.

use super::cascade::CascadeState;
use super::{ClusterTree, State};
use crate::alloc::{Allocator, Block, InnerNode, Ref};
use crate::error::{CoreError, CoreResult};
use crate::types::ObjKey;
use tracing::trace;

/// Child of a node at `offset` covering `key`. Child 0 takes every key below
/// child 1, so `keys[0]` plays no part in routing.
fn find_child(keys: &[i64], offset: i64, key: i64) -> usize {
    keys.get(1..)
        .map_or(0, |rest| rest.partition_point(|k| offset.wrapping_add(*k) <= key))
}

/// An inner node of a [`ClusterTree`].
pub struct ClusterInner<'t> {
    tree: &'t ClusterTree,
    mem: Ref,
    offset: i64,
}

impl<'t> ClusterInner<'t> {
    pub(crate) fn new(tree: &'t ClusterTree, mem: Ref, offset: i64) -> Self {
        Self { tree, mem, offset }
    }

    /// The node's block.
    #[must_use]
    pub fn mem(&self) -> Ref {
        self.mem
    }

    /// Absolute key of relative key 0.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    fn alloc(&self) -> &Allocator {
        self.tree.alloc()
    }

    fn node(&self) -> CoreResult<InnerNode> {
        Ok(self.alloc().resolve(self.mem)?.inner()?.clone())
    }

    fn update<R>(&self, f: impl FnOnce(&mut InnerNode) -> CoreResult<R>) -> CoreResult<R> {
        self.alloc().update(self.mem, |b| f(b.inner_mut()?))
    }

    /// Number of children.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be resolved.
    pub fn node_size(&self) -> CoreResult<usize> {
        Ok(self.alloc().resolve(self.mem)?.inner()?.children.len())
    }

    /// Number of objects below this node.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be resolved.
    pub fn object_count(&self) -> CoreResult<u64> {
        Ok(self.alloc().resolve(self.mem)?.inner()?.total())
    }

    /// Stored first key of child `i`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the last child.
    pub fn key_at(&self, i: usize) -> CoreResult<i64> {
        let block = self.alloc().resolve(self.mem)?;
        let keys = &block.inner()?.keys;
        keys.get(i).copied().ok_or(CoreError::IndexOutOfRange {
            index: i,
            size: keys.len(),
        })
    }

    /// Index, absolute offset and block of the child covering `key`.
    fn child_slot(&self, key: i64) -> CoreResult<(usize, i64, Ref)> {
        let block = self.alloc().resolve(self.mem)?;
        let inner = block.inner()?;
        if inner.children.is_empty() {
            return Err(CoreError::corruption(format!(
                "inner node {:?} has no children",
                self.mem
            )));
        }
        let i = find_child(&inner.keys, self.offset, key);
        Ok((i, self.offset.wrapping_add(inner.keys[i]), inner.children[i]))
    }

    /// Locates `key` below this node.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn get(&self, key: i64) -> CoreResult<Option<State>> {
        let (_, child_offset, child) = self.child_slot(key)?;
        self.tree.node(child, child_offset)?.get(key)
    }

    /// Object at position `ndx` below this node.
    ///
    /// # Errors
    ///
    /// Fails if `ndx` is past the object count.
    pub fn get_by_index(&self, ndx: u64) -> CoreResult<ObjKey> {
        let inner = self.node()?;
        let mut rest = ndx;
        for ((key, count), child) in inner.keys.iter().zip(&inner.counts).zip(&inner.children) {
            if rest < *count {
                return self
                    .tree
                    .node(*child, self.offset.wrapping_add(*key))?
                    .get_by_index(rest);
            }
            rest -= count;
        }
        Err(CoreError::IndexOutOfRange {
            index: ndx as usize,
            size: inner.total() as usize,
        })
    }

    /// Makes the path to `key` writable. This node must already be writable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key is absent.
    pub fn ensure_writeable(&self, key: i64) -> CoreResult<State> {
        let (i, child_offset, _) = self.child_slot(key)?;
        let child = self.alloc().writable_inner_child(self.mem, i)?;
        self.tree.node(child, child_offset)?.ensure_writeable(key)
    }

    /// Inserts below this writable node. Returns a new sibling if this node
    /// overflowed and split.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] if the key exists.
    pub fn insert(&self, key: i64, state: &mut State) -> CoreResult<Option<Ref>> {
        let (i, child_offset, _) = self.child_slot(key)?;
        let child = self.alloc().writable_inner_child(self.mem, i)?;
        let child_node = self.tree.node(child, child_offset)?;
        let len = match child_node.insert(key, state)? {
            None => self.update(|n| {
                n.counts[i] += 1;
                Ok(n.children.len())
            })?,
            Some(sibling) => {
                let left = child_node.object_count()?;
                let right = self.tree.node(sibling, 0)?.object_count()?;
                let sibling_key = child_offset
                    .wrapping_add(state.split_key)
                    .wrapping_sub(self.offset);
                self.update(|n| {
                    n.counts[i] = left;
                    n.keys.insert(i + 1, sibling_key);
                    n.counts.insert(i + 1, right);
                    n.children.insert(i + 1, sibling);
                    Ok(n.children.len())
                })?
            }
        };
        if len <= self.tree.node_max() {
            return Ok(None);
        }
        let mid = len / 2;
        let (split_key, keys, counts, children) = self.update(|n| {
            let split_key = n.keys[mid];
            let keys: Vec<i64> = n
                .keys
                .split_off(mid)
                .into_iter()
                .map(|k| k.wrapping_sub(split_key))
                .collect();
            Ok((split_key, keys, n.counts.split_off(mid), n.children.split_off(mid)))
        })?;
        let sibling = self.alloc().alloc(Block::Inner(InnerNode {
            keys,
            counts,
            children,
        }));
        state.split_key = split_key;
        trace!(node = ?self.mem, ?sibling, split_key, "inner node split");
        Ok(Some(sibling))
    }

    /// Erases below this writable node and returns the remaining number of
    /// children.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key is absent.
    pub fn erase(&self, key: i64, cascade: &mut CascadeState) -> CoreResult<usize> {
        let (i, child_offset, _) = self.child_slot(key)?;
        let child = self.alloc().writable_inner_child(self.mem, i)?;
        let remaining = self.tree.node(child, child_offset)?.erase(key, cascade)?;
        self.update(|n| {
            n.counts[i] -= 1;
            Ok(())
        })?;
        if remaining < self.tree.node_min() {
            self.rebalance(i)?;
        }
        self.node_size()
    }

    /// Restores occupancy after child `c` fell below the minimum.
    ///
    /// An empty child is dropped. Otherwise the child and a neighbour are
    /// merged into the left one; if that overflows, the merged node is split
    /// again at its midpoint and the upper half returned to the right one.
    fn rebalance(&self, c: usize) -> CoreResult<()> {
        let inner = self.node()?;
        let n = inner.children.len();
        if n < 2 {
            return Ok(());
        }
        if inner.counts[c] == 0 {
            self.update(|node| {
                node.keys.remove(c);
                node.counts.remove(c);
                node.children.remove(c);
                Ok(())
            })?;
            trace!(node = ?self.mem, child = c, "dropped empty child");
            return self.alloc().free_tree(inner.children[c]);
        }
        let (l, r) = if c + 1 < n { (c, c + 1) } else { (c - 1, c) };
        let left_ref = self.alloc().writable_inner_child(self.mem, l)?;
        let right_ref = self.alloc().writable_inner_child(self.mem, r)?;
        let left = self.tree.node(left_ref, self.offset.wrapping_add(inner.keys[l]))?;
        let right = self.tree.node(right_ref, self.offset.wrapping_add(inner.keys[r]))?;

        right.move_entries(0, &left, inner.keys[r].wrapping_sub(inner.keys[l]))?;
        let len = left.node_size()?;
        if len > self.tree.node_max() {
            let mid = len / 2;
            let split_key = left.key_at(mid)?;
            let right_key = inner.keys[l].wrapping_add(split_key);
            let right = self
                .tree
                .node(right_ref, self.offset.wrapping_add(right_key))?;
            left.move_entries(mid, &right, split_key.wrapping_neg())?;
            let (lc, rc) = (left.object_count()?, right.object_count()?);
            self.update(|node| {
                node.keys[r] = right_key;
                node.counts[l] = lc;
                node.counts[r] = rc;
                Ok(())
            })?;
            trace!(left = ?left_ref, right = ?right_ref, "cluster nodes redistributed");
        } else {
            let lc = left.object_count()?;
            self.update(|node| {
                node.counts[l] = lc;
                node.keys.remove(r);
                node.counts.remove(r);
                node.children.remove(r);
                Ok(())
            })?;
            right.discard()?;
            trace!(left = ?left_ref, "cluster nodes merged");
        }
        Ok(())
    }

    /// Moves children `from..` to the end of `target`, rebasing their keys
    /// by `key_adj`. Both nodes must be writable.
    ///
    /// # Errors
    ///
    /// Fails if either node cannot be updated.
    pub fn move_entries(&self, from: usize, target: &ClusterInner<'_>, key_adj: i64) -> CoreResult<()> {
        let (keys, counts, children) = self.update(|n| {
            Ok((
                n.keys.split_off(from),
                n.counts.split_off(from),
                n.children.split_off(from),
            ))
        })?;
        target.update(|n| {
            n.keys.extend(keys.into_iter().map(|k| k.wrapping_add(key_adj)));
            n.counts.extend(counts);
            n.children.extend(children);
            Ok(())
        })
    }

    /// Adds `delta` to every child key of this writable node.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be updated.
    pub fn adjust_keys(&self, delta: i64) -> CoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        self.update(|n| {
            for k in &mut n.keys {
                *k = k.wrapping_add(delta);
            }
            Ok(())
        })
    }

    /// Releases the node block alone; its children now live elsewhere.
    pub fn discard(&self) {
        self.alloc().free(self.mem);
    }
}

#[cfg(test)]
mod tests {
    use super::find_child;

    #[test]
    fn child_routing() {
        let keys = [0, 10, 20];
        assert_eq!(find_child(&keys, 0, -5), 0);
        assert_eq!(find_child(&keys, 0, 0), 0);
        assert_eq!(find_child(&keys, 0, 9), 0);
        assert_eq!(find_child(&keys, 0, 10), 1);
        assert_eq!(find_child(&keys, 0, 25), 2);
        assert_eq!(find_child(&keys, 100, 115), 1);
    }

    #[test]
    fn child_zero_takes_keys_below_its_offset() {
        let keys = [5, 10];
        assert_eq!(find_child(&keys, 0, 1), 0);
    }

    #[test]
    fn first_key_is_ignored_for_routing() {
        // A root built over a leaf that split at a negative key.
        let keys = [0, -8];
        assert_eq!(find_child(&keys, 0, -10), 0);
        assert_eq!(find_child(&keys, 0, -8), 1);
        assert_eq!(find_child(&keys, 0, 0), 1);
        assert_eq!(find_child(&[7], 0, i64::MIN), 0);
    }

    #[test]
    fn wrapped_child_keys_route_by_absolute_value() {
        let offset = -10;
        let keys = [0, 4, i64::MAX.wrapping_sub(offset)];
        assert_eq!(find_child(&keys, offset, -7), 0);
        assert_eq!(find_child(&keys, offset, -6), 1);
        assert_eq!(find_child(&keys, offset, i64::MAX - 1), 1);
        assert_eq!(find_child(&keys, offset, i64::MAX), 2);
    }
}
