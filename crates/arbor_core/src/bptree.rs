//! Positional B+tree.
//!
//! `BPlusTree<T>` is an ordered sequence addressed by position, stored as a
//! tree of allocator blocks. Leaves hold runs of values; inner nodes hold
//! child references together with the number of elements below each child,
//! so positional lookup descends by subtracting counts.
//!
//! The tree does not sort: callers choose where each element goes. The
//! dictionary appends to keep insertion order; a sorted container would
//! insert at its lower bound instead.
//!
//! All mutation goes through copy-on-write: the path from the root to the
//! touched leaf is made writable first, and a replaced root is reported to
//! the parent link.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tree: BPlusTree<i64> = BPlusTree::new(alloc, 16);
//! tree.create()?;
//! tree.add(10)?;
//! tree.insert(0, 5)?;
//! assert_eq!(tree.to_vec()?, vec![5, 10]);
//! ```

use crate::alloc::{Allocator, Block, InnerNode, ParentLink, Ref};
use crate::error::{CoreError, CoreResult};
use crate::value::Mixed;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Element type storable in a [`BPlusTree`] leaf.
pub trait LeafValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Wraps values in a leaf block.
    fn new_leaf(values: Vec<Self>) -> Block;

    /// Borrows the values of a leaf block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] for a block of another kind.
    fn leaf_values(block: &Block) -> CoreResult<&Vec<Self>>;

    /// Mutably borrows the values of a leaf block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] for a block of another kind.
    fn leaf_values_mut(block: &mut Block) -> CoreResult<&mut Vec<Self>>;
}

impl LeafValue for Mixed {
    fn new_leaf(values: Vec<Self>) -> Block {
        Block::Values(values)
    }

    fn leaf_values(block: &Block) -> CoreResult<&Vec<Self>> {
        block.values()
    }

    fn leaf_values_mut(block: &mut Block) -> CoreResult<&mut Vec<Self>> {
        block.values_mut()
    }
}

impl LeafValue for i64 {
    fn new_leaf(values: Vec<Self>) -> Block {
        Block::Ints(values)
    }

    fn leaf_values(block: &Block) -> CoreResult<&Vec<Self>> {
        block.ints()
    }

    fn leaf_values_mut(block: &mut Block) -> CoreResult<&mut Vec<Self>> {
        block.ints_mut()
    }
}

/// Contents cut out of a node, ready to be appended to a sibling.
enum Chunk<T> {
    Leaf(Vec<T>),
    Inner(Vec<u64>, Vec<Ref>),
}

fn split_node<T: LeafValue>(block: &mut Block, at: usize) -> CoreResult<Chunk<T>> {
    match block {
        Block::Inner(inner) => Ok(Chunk::Inner(
            inner.counts.split_off(at),
            inner.children.split_off(at),
        )),
        leaf => Ok(Chunk::Leaf(T::leaf_values_mut(leaf)?.split_off(at))),
    }
}

fn append_node<T: LeafValue>(block: &mut Block, chunk: Chunk<T>) -> CoreResult<()> {
    match (block, chunk) {
        (Block::Inner(inner), Chunk::Inner(counts, children)) => {
            inner.counts.extend(counts);
            inner.children.extend(children);
            Ok(())
        }
        (Block::Inner(_), Chunk::Leaf(_)) => Err(CoreError::corruption(
            "cannot append leaf contents to an inner node",
        )),
        (leaf, Chunk::Leaf(values)) => {
            T::leaf_values_mut(leaf)?.extend(values);
            Ok(())
        }
        (_, Chunk::Inner(..)) => Err(CoreError::corruption(
            "cannot append inner contents to a leaf",
        )),
    }
}

fn chunk_block<T: LeafValue>(chunk: Chunk<T>) -> Block {
    match chunk {
        Chunk::Leaf(values) => T::new_leaf(values),
        Chunk::Inner(counts, children) => Block::Inner(InnerNode {
            keys: Vec::new(),
            counts,
            children,
        }),
    }
}

/// Child holding element `ndx`, and the position within that child.
fn locate(inner: &InnerNode, ndx: u64) -> CoreResult<(usize, u64)> {
    let mut rest = ndx;
    for (i, count) in inner.counts.iter().enumerate() {
        if rest < *count {
            return Ok((i, rest));
        }
        rest -= count;
    }
    Err(CoreError::corruption(format!(
        "position {ndx} beyond inner node total {}",
        inner.total()
    )))
}

/// Child receiving an insert at `ndx`. Appends go to the last child.
fn locate_insert(inner: &InnerNode, ndx: u64) -> CoreResult<(usize, u64)> {
    let mut rest = ndx;
    for (i, count) in inner.counts.iter().enumerate() {
        if rest <= *count {
            return Ok((i, rest));
        }
        rest -= count;
    }
    Err(CoreError::corruption(format!(
        "insert position {ndx} beyond inner node total {}",
        inner.total()
    )))
}

/// An ordered sequence of `T` stored as a copy-on-write B+tree.
pub struct BPlusTree<T: LeafValue> {
    alloc: Arc<Allocator>,
    parent: Option<(Arc<dyn ParentLink>, usize)>,
    root: Ref,
    node_max: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: LeafValue> fmt::Debug for BPlusTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BPlusTree")
            .field("root", &self.root)
            .field("node_max", &self.node_max)
            .field("attached", &self.parent.is_some())
            .finish()
    }
}

impl<T: LeafValue> BPlusTree<T> {
    /// Creates a handle with no backing storage.
    pub fn new(alloc: Arc<Allocator>, node_max: usize) -> Self {
        Self {
            alloc,
            parent: None,
            root: Ref::NULL,
            node_max,
            _marker: PhantomData,
        }
    }

    /// Anchors the tree at slot `ndx` of `parent`.
    pub fn set_parent(&mut self, parent: Arc<dyn ParentLink>, ndx: usize) {
        self.parent = Some((parent, ndx));
    }

    /// Whether backing storage exists.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.root.is_null()
    }

    /// Current root reference.
    #[must_use]
    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Reloads the root reference from the parent. Returns whether the tree
    /// has storage.
    ///
    /// # Errors
    ///
    /// Fails if the parent cannot be resolved.
    pub fn init_from_parent(&mut self) -> CoreResult<bool> {
        if let Some((parent, ndx)) = &self.parent {
            self.root = parent.get_child_ref(*ndx)?;
        }
        Ok(self.is_attached())
    }

    /// Allocates an empty root unless one exists.
    ///
    /// # Errors
    ///
    /// Fails if the parent refuses the write.
    pub fn create(&mut self) -> CoreResult<()> {
        if self.is_attached() {
            return Ok(());
        }
        self.check_writable()?;
        let root = self.alloc.alloc(T::new_leaf(Vec::new()));
        self.set_root(root)
    }

    /// Releases all storage and clears the parent's reference.
    ///
    /// # Errors
    ///
    /// Fails if the parent refuses the write.
    pub fn destroy(&mut self) -> CoreResult<()> {
        if !self.is_attached() {
            return Ok(());
        }
        self.check_writable()?;
        let old = self.root;
        self.set_root(Ref::NULL)?;
        self.alloc.free_tree(old)
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be resolved.
    pub fn size(&self) -> CoreResult<usize> {
        if !self.is_attached() {
            return Ok(0);
        }
        self.total(self.root).map(|n| n as usize)
    }

    /// Whether the tree holds no elements.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be resolved.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.size()? == 0)
    }

    /// Element at `ndx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn get(&self, ndx: usize) -> CoreResult<T> {
        let size = self.size()?;
        if ndx >= size {
            return Err(CoreError::IndexOutOfRange { index: ndx, size });
        }
        let mut node = self.alloc.resolve(self.root)?;
        let mut rest = ndx as u64;
        loop {
            let next = match &*node {
                Block::Inner(inner) => {
                    let (child, within) = locate(inner, rest)?;
                    rest = within;
                    self.alloc.resolve(inner.children[child])?
                }
                leaf => {
                    return T::leaf_values(leaf)?
                        .get(rest as usize)
                        .cloned()
                        .ok_or_else(|| CoreError::corruption("leaf shorter than its count"));
                }
            };
            node = next;
        }
    }

    /// Replaces the element at `ndx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn set(&mut self, ndx: usize, value: T) -> CoreResult<()> {
        let size = self.size()?;
        if ndx >= size {
            return Err(CoreError::IndexOutOfRange { index: ndx, size });
        }
        let mut node = self.writable_root()?;
        let mut rest = ndx as u64;
        loop {
            let block = self.alloc.resolve(node)?;
            if let Block::Inner(inner) = &*block {
                let (child, within) = locate(inner, rest)?;
                drop(block);
                node = self.alloc.writable_inner_child(node, child)?;
                rest = within;
                continue;
            }
            drop(block);
            return self.alloc.update(node, |b| {
                let values = T::leaf_values_mut(b)?;
                let slot = values
                    .get_mut(rest as usize)
                    .ok_or_else(|| CoreError::corruption("leaf shorter than its count"))?;
                *slot = value;
                Ok(())
            });
        }
    }

    /// Inserts `value` so that it ends up at position `ndx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] if `ndx > size()` and
    /// [`CoreError::InvalidOperation`] if the tree was never created.
    pub fn insert(&mut self, ndx: usize, value: T) -> CoreResult<()> {
        if !self.is_attached() {
            return Err(CoreError::invalid_operation("tree has no storage"));
        }
        let size = self.size()?;
        if ndx > size {
            return Err(CoreError::IndexOutOfRange { index: ndx, size });
        }
        let root = self.writable_root()?;
        if let Some(sibling) = self.insert_at(root, ndx as u64, value)? {
            let counts = vec![self.total(root)?, self.total(sibling)?];
            let new_root = self.alloc.alloc(Block::Inner(InnerNode {
                keys: Vec::new(),
                counts,
                children: vec![root, sibling],
            }));
            debug!(root = ?new_root, "ordered tree grew a level");
            self.set_root(new_root)?;
        }
        Ok(())
    }

    /// Appends `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the tree was never created.
    pub fn add(&mut self, value: T) -> CoreResult<()> {
        let size = self.size()?;
        self.insert(size, value)
    }

    /// Removes the element at `ndx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn erase(&mut self, ndx: usize) -> CoreResult<()> {
        let size = self.size()?;
        if ndx >= size {
            return Err(CoreError::IndexOutOfRange { index: ndx, size });
        }
        let root = self.writable_root()?;
        self.erase_at(root, ndx as u64)?;
        loop {
            let block = self.alloc.resolve(self.root)?;
            let only_child = match &*block {
                Block::Inner(inner) if inner.children.len() == 1 => inner.children[0],
                _ => break,
            };
            drop(block);
            let old = self.root;
            self.set_root(only_child)?;
            self.alloc.free(old);
            debug!(root = ?only_child, "ordered tree lost a level");
        }
        Ok(())
    }

    /// Removes every element, keeping the tree attached.
    ///
    /// # Errors
    ///
    /// Fails if the parent refuses the write.
    pub fn clear(&mut self) -> CoreResult<()> {
        if self.size()? == 0 {
            return Ok(());
        }
        self.check_writable()?;
        let old = self.root;
        let root = self.alloc.alloc(T::new_leaf(Vec::new()));
        self.set_root(root)?;
        self.alloc.free_tree(old)
    }

    /// Position of the first element equal to `value`.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn find_first(&self, value: &T) -> CoreResult<Option<usize>> {
        let mut base = 0;
        for leaf in self.leaves()? {
            let values = T::leaf_values(&leaf)?;
            if let Some(i) = values.iter().position(|v| v == value) {
                return Ok(Some(base + i));
            }
            base += values.len();
        }
        Ok(None)
    }

    /// Iterates over the elements in order.
    ///
    /// The leaves are resolved up front, so the iterator itself cannot fail
    /// and keeps seeing the version it started on.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn iter(&self) -> CoreResult<Iter<T>> {
        Ok(Iter {
            leaves: self.leaves()?.into_iter(),
            current: None,
            pos: 0,
            _marker: PhantomData,
        })
    }

    /// Collects the elements.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn to_vec(&self) -> CoreResult<Vec<T>> {
        Ok(self.iter()?.collect())
    }

    /// Checks occupancy bounds, counts and uniform leaf depth.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] describing the first violation.
    pub fn verify(&self) -> CoreResult<()> {
        if !self.is_attached() {
            return Ok(());
        }
        let mut leaf_depth = None;
        self.verify_node(self.root, true, 0, &mut leaf_depth)?;
        Ok(())
    }

    fn verify_node(
        &self,
        node: Ref,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> CoreResult<u64> {
        let block = self.alloc.resolve(node)?;
        let len = Self::node_len(&block)?;
        if len > self.node_max {
            return Err(CoreError::corruption(format!(
                "node {node:?} holds {len} entries, more than {}",
                self.node_max
            )));
        }
        if !is_root && len < self.node_min() {
            return Err(CoreError::corruption(format!(
                "node {node:?} holds {len} entries, fewer than {}",
                self.node_min()
            )));
        }
        match &*block {
            Block::Inner(inner) => {
                if inner.counts.len() != inner.children.len() {
                    return Err(CoreError::corruption(format!(
                        "inner node {node:?} has {} counts for {} children",
                        inner.counts.len(),
                        inner.children.len()
                    )));
                }
                if is_root && len < 2 {
                    return Err(CoreError::corruption("inner root with a single child"));
                }
                for (child, count) in inner.children.iter().zip(&inner.counts) {
                    let actual = self.verify_node(*child, false, depth + 1, leaf_depth)?;
                    if actual != *count {
                        return Err(CoreError::corruption(format!(
                            "child {child:?} holds {actual} elements, parent records {count}"
                        )));
                    }
                }
                Ok(inner.total())
            }
            _ => {
                match *leaf_depth {
                    Some(d) if d != depth => {
                        return Err(CoreError::corruption("leaves at different depths"));
                    }
                    _ => *leaf_depth = Some(depth),
                }
                Ok(len as u64)
            }
        }
    }

    fn node_min(&self) -> usize {
        self.node_max / 2
    }

    fn node_len(block: &Block) -> CoreResult<usize> {
        match block {
            Block::Inner(inner) => Ok(inner.children.len()),
            leaf => Ok(T::leaf_values(leaf)?.len()),
        }
    }

    fn total(&self, node: Ref) -> CoreResult<u64> {
        match &*self.alloc.resolve(node)? {
            Block::Inner(inner) => Ok(inner.total()),
            leaf => Ok(T::leaf_values(leaf)?.len() as u64),
        }
    }

    fn check_writable(&self) -> CoreResult<()> {
        match &self.parent {
            Some((parent, _)) => parent.check_writable(),
            None => Ok(()),
        }
    }

    fn set_root(&mut self, root: Ref) -> CoreResult<()> {
        if let Some((parent, ndx)) = &self.parent {
            parent.update_child_ref(*ndx, root)?;
        }
        self.root = root;
        Ok(())
    }

    fn writable_root(&mut self) -> CoreResult<Ref> {
        self.check_writable()?;
        let w = self.alloc.copy_on_write(self.root)?;
        if w != self.root {
            self.set_root(w)?;
        }
        Ok(w)
    }

    fn leaves(&self) -> CoreResult<Vec<Arc<Block>>> {
        let mut leaves = Vec::new();
        if !self.is_attached() {
            return Ok(leaves);
        }
        let mut stack = vec![self.root];
        while let Some(r) = stack.pop() {
            let block = self.alloc.resolve(r)?;
            if let Block::Inner(inner) = &*block {
                stack.extend(inner.children.iter().rev().copied());
            } else {
                T::leaf_values(&block)?;
                leaves.push(block);
            }
        }
        Ok(leaves)
    }

    fn insert_at(&self, node: Ref, ndx: u64, value: T) -> CoreResult<Option<Ref>> {
        let block = self.alloc.resolve(node)?;
        if let Block::Inner(inner) = &*block {
            let (c, rest) = locate_insert(inner, ndx)?;
            drop(block);
            let child = self.alloc.writable_inner_child(node, c)?;
            let split = self.insert_at(child, rest, value)?;
            let len = match split {
                None => self.alloc.update(node, |b| {
                    let inner = b.inner_mut()?;
                    inner.counts[c] += 1;
                    Ok(inner.children.len())
                })?,
                Some(sibling) => {
                    let left = self.total(child)?;
                    let right = self.total(sibling)?;
                    self.alloc.update(node, |b| {
                        let inner = b.inner_mut()?;
                        inner.counts[c] = left;
                        inner.counts.insert(c + 1, right);
                        inner.children.insert(c + 1, sibling);
                        Ok(inner.children.len())
                    })?
                }
            };
            return if len > self.node_max {
                self.split(node, len).map(Some)
            } else {
                Ok(None)
            };
        }
        drop(block);
        let len = self.alloc.update(node, |b| {
            let values = T::leaf_values_mut(b)?;
            values.insert(ndx as usize, value);
            Ok(values.len())
        })?;
        if len > self.node_max {
            self.split(node, len).map(Some)
        } else {
            Ok(None)
        }
    }

    fn split(&self, node: Ref, len: usize) -> CoreResult<Ref> {
        let upper = self.alloc.update(node, |b| split_node::<T>(b, len / 2))?;
        let sibling = self.alloc.alloc(chunk_block(upper));
        trace!(?node, ?sibling, "ordered tree node split");
        Ok(sibling)
    }

    /// Erases below `node`, returning the node's remaining entry count.
    fn erase_at(&self, node: Ref, ndx: u64) -> CoreResult<usize> {
        let block = self.alloc.resolve(node)?;
        if let Block::Inner(inner) = &*block {
            let (c, rest) = locate(inner, ndx)?;
            drop(block);
            let child = self.alloc.writable_inner_child(node, c)?;
            let remaining = self.erase_at(child, rest)?;
            self.alloc.update(node, |b| {
                b.inner_mut()?.counts[c] -= 1;
                Ok(())
            })?;
            if remaining < self.node_min() {
                self.rebalance(node, c)?;
            }
            return Ok(Self::node_len(&*self.alloc.resolve(node)?)?);
        }
        drop(block);
        self.alloc.update(node, |b| {
            let values = T::leaf_values_mut(b)?;
            if (ndx as usize) >= values.len() {
                return Err(CoreError::corruption("leaf shorter than its count"));
            }
            values.remove(ndx as usize);
            Ok(values.len())
        })
    }

    /// Fixes an underfull child `c` of the writable inner node `node`.
    ///
    /// An empty child is dropped. Otherwise the child is merged with a
    /// neighbour; if the merged node overflows it is split again at the
    /// midpoint, which leaves both halves at least half full.
    fn rebalance(&self, node: Ref, c: usize) -> CoreResult<()> {
        let inner = self.alloc.resolve(node)?.inner()?.clone();
        let n = inner.children.len();
        if n < 2 {
            return Ok(());
        }
        if inner.counts[c] == 0 {
            self.alloc.update(node, |b| {
                let inner = b.inner_mut()?;
                inner.counts.remove(c);
                inner.children.remove(c);
                Ok(())
            })?;
            return self.alloc.free_tree(inner.children[c]);
        }
        let (l, r) = if c + 1 < n { (c, c + 1) } else { (c - 1, c) };
        let left = self.alloc.writable_inner_child(node, l)?;
        let right = self.alloc.writable_inner_child(node, r)?;
        let moved = self.alloc.update(right, |b| split_node::<T>(b, 0))?;
        self.alloc.update(left, |b| append_node::<T>(b, moved))?;
        let len = Self::node_len(&*self.alloc.resolve(left)?)?;
        if len > self.node_max {
            let upper = self.alloc.update(left, |b| split_node::<T>(b, len / 2))?;
            self.alloc.update(right, |b| append_node::<T>(b, upper))?;
            let (lc, rc) = (self.total(left)?, self.total(right)?);
            self.alloc.update(node, |b| {
                let inner = b.inner_mut()?;
                inner.counts[l] = lc;
                inner.counts[r] = rc;
                Ok(())
            })?;
            trace!(?left, ?right, "ordered tree nodes redistributed");
        } else {
            let lc = self.total(left)?;
            self.alloc.update(node, |b| {
                let inner = b.inner_mut()?;
                inner.counts[l] = lc;
                inner.counts.remove(r);
                inner.children.remove(r);
                Ok(())
            })?;
            self.alloc.free(right);
            trace!(?left, "ordered tree nodes merged");
        }
        Ok(())
    }
}

/// Iterator over a [`BPlusTree`] snapshot.
pub struct Iter<T: LeafValue> {
    leaves: std::vec::IntoIter<Arc<Block>>,
    current: Option<Arc<Block>>,
    pos: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: LeafValue> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(leaf) = &self.current {
                if let Some(v) = T::leaf_values(leaf).ok().and_then(|vs| vs.get(self.pos)) {
                    self.pos += 1;
                    return Some(v.clone());
                }
            }
            self.current = Some(self.leaves.next()?);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::parent::tests::RootCell;
    use crate::types::Version;
    use proptest::prelude::*;

    fn attached(node_max: usize) -> (Arc<Allocator>, Arc<RootCell>, BPlusTree<i64>) {
        let alloc = Arc::new(Allocator::new());
        let cell = RootCell::new(Ref::NULL);
        let mut tree = BPlusTree::new(Arc::clone(&alloc), node_max);
        tree.set_parent(cell.clone(), 0);
        tree.create().unwrap();
        (alloc, cell, tree)
    }

    #[test]
    fn create_is_idempotent() {
        let (_, cell, mut tree) = attached(4);
        let root = *cell.root.lock();
        assert!(!root.is_null());
        tree.create().unwrap();
        assert_eq!(*cell.root.lock(), root);
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn append_splits_and_keeps_order() {
        let (_, cell, mut tree) = attached(4);
        for i in 0..100 {
            tree.add(i).unwrap();
        }
        tree.verify().unwrap();
        assert_eq!(tree.size().unwrap(), 100);
        assert_eq!(tree.to_vec().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(tree.get(57).unwrap(), 57);
        assert_eq!(*cell.root.lock(), tree.root_ref());
    }

    #[test]
    fn positional_insert_and_set() {
        let (_, _, mut tree) = attached(4);
        for i in 0..20 {
            tree.insert(0, i).unwrap();
        }
        tree.set(0, 100).unwrap();
        let v = tree.to_vec().unwrap();
        assert_eq!(v[0], 100);
        assert_eq!(v[1], 18);
        assert_eq!(v[19], 0);
        tree.verify().unwrap();
    }

    #[test]
    fn out_of_range() {
        let (_, _, mut tree) = attached(4);
        tree.add(1).unwrap();
        assert!(matches!(
            tree.get(1),
            Err(CoreError::IndexOutOfRange { index: 1, size: 1 })
        ));
        assert!(tree.insert(3, 0).is_err());
        assert!(tree.erase(1).is_err());
    }

    #[test]
    fn erase_collapses_to_leaf() {
        let (alloc, _, mut tree) = attached(4);
        for i in 0..64 {
            tree.add(i).unwrap();
        }
        for _ in 0..62 {
            tree.erase(0).unwrap();
            tree.verify().unwrap();
        }
        assert_eq!(tree.to_vec().unwrap(), vec![62, 63]);
        assert!(!matches!(
            &*alloc.resolve(tree.root_ref()).unwrap(),
            Block::Inner(_)
        ));
    }

    #[test]
    fn clear_and_destroy_release_blocks() {
        let (alloc, cell, mut tree) = attached(4);
        for i in 0..50 {
            tree.add(i).unwrap();
        }
        tree.clear().unwrap();
        assert_eq!(tree.size().unwrap(), 0);
        assert!(tree.is_attached());
        assert_eq!(alloc.block_count(), 1);
        tree.destroy().unwrap();
        assert!(cell.root.lock().is_null());
        assert_eq!(alloc.block_count(), 0);
    }

    #[test]
    fn find_first_scans_in_order() {
        let (_, _, mut tree) = attached(4);
        for v in [5, 3, 9, 3, 7, 1, 2, 8, 3] {
            tree.add(v).unwrap();
        }
        assert_eq!(tree.find_first(&3).unwrap(), Some(1));
        assert_eq!(tree.find_first(&8).unwrap(), Some(7));
        assert_eq!(tree.find_first(&42).unwrap(), None);
    }

    #[test]
    fn committed_version_is_untouched_by_writes() {
        let (alloc, cell, mut tree) = attached(4);
        for i in 0..30 {
            tree.add(i).unwrap();
        }
        alloc.commit(Version::new(1));
        let snapshot_root = *cell.root.lock();

        tree.set(10, -1).unwrap();
        tree.erase(0).unwrap();
        tree.add(99).unwrap();
        assert_ne!(tree.root_ref(), snapshot_root);

        let mut snapshot: BPlusTree<i64> = BPlusTree::new(Arc::clone(&alloc), 4);
        snapshot.set_parent(RootCell::new(snapshot_root), 0);
        snapshot.init_from_parent().unwrap();
        assert_eq!(snapshot.to_vec().unwrap(), (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn refused_write_is_reported() {
        let (alloc, cell, mut tree) = attached(4);
        tree.add(1).unwrap();
        alloc.commit(Version::new(1));
        *cell.writable.lock() = false;
        assert!(matches!(tree.add(2), Err(CoreError::ReadOnly)));
        assert!(alloc.pending_blocks().is_empty());
    }

    #[test]
    fn mixed_leaves() {
        let alloc = Arc::new(Allocator::new());
        let mut tree: BPlusTree<Mixed> = BPlusTree::new(alloc, 4);
        tree.create().unwrap();
        tree.add(Mixed::from("a")).unwrap();
        tree.add(Mixed::Null).unwrap();
        assert_eq!(tree.find_first(&Mixed::Null).unwrap(), Some(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize, i64),
        Erase(usize),
        Set(usize, i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (any::<usize>(), any::<i64>()).prop_map(|(i, v)| Op::Insert(i, v)),
            2 => any::<usize>().prop_map(Op::Erase),
            1 => (any::<usize>(), any::<i64>()).prop_map(|(i, v)| Op::Set(i, v)),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_vec(ops in prop::collection::vec(op(), 1..300)) {
            let (_, _, mut tree) = attached(4);
            let mut model: Vec<i64> = Vec::new();
            for op in ops {
                match op {
                    Op::Insert(i, v) => {
                        let i = i % (model.len() + 1);
                        tree.insert(i, v).unwrap();
                        model.insert(i, v);
                    }
                    Op::Erase(i) if !model.is_empty() => {
                        let i = i % model.len();
                        tree.erase(i).unwrap();
                        model.remove(i);
                    }
                    Op::Set(i, v) if !model.is_empty() => {
                        let i = i % model.len();
                        tree.set(i, v).unwrap();
                        model[i] = v;
                    }
                    _ => {}
                }
                tree.verify().unwrap();
            }
            prop_assert_eq!(tree.to_vec().unwrap(), model);
        }
    }
}
