//! Cluster B+tree: objects stored as columnar leaves keyed by [`ObjKey`].
//!
//! A [`ClusterTree`] owns one root node, either a [`Cluster`] leaf or a
//! [`ClusterInner`] node. Every node stores keys relative to its offset: a
//! leaf at offset `o` holding relative key `k` stores the object `o + k`, and
//! an inner node at offset `o` places child `i` at offset `o + keys[i]`.
//! Relative keys are taken modulo 2^64 so any pair of `i64` keys has one;
//! nodes compare keys only after rebuilding the absolute value. Child 0 of
//! an inner node also holds every key below child 1, whatever `keys[0]` is.
//!
//! Leaf layout (a slot list):
//!
//! | slot | contents |
//! |------|----------|
//! | 0    | `Tagged(n)` while keys are exactly `0..n`, else a ref to the key array |
//! | 1..  | one column block per table column, in column order |
//!
//! [`ObjKey`]: crate::types::ObjKey

mod cascade;
mod inner;
mod leaf;
mod tree;

pub use cascade::{CascadeState, IncomingLink, OutgoingLink};
pub use inner::ClusterInner;
pub use leaf::Cluster;
pub use tree::ClusterTree;

use crate::alloc::Ref;
use crate::error::{CoreError, CoreResult};
use crate::types::ObjKey;

/// Result of locating or inserting a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct State {
    /// After a split: first key of the new sibling, relative to the node
    /// that split.
    pub split_key: i64,
    /// Leaf holding the row.
    pub mem: Ref,
    /// Row index within that leaf.
    pub index: usize,
}

/// A cluster node of either kind.
pub enum ClusterNode<'t> {
    /// Leaf.
    Leaf(Cluster<'t>),
    /// Inner node.
    Inner(ClusterInner<'t>),
}

impl<'t> ClusterNode<'t> {
    /// The node's block.
    #[must_use]
    pub fn mem(&self) -> Ref {
        match self {
            ClusterNode::Leaf(leaf) => leaf.mem(),
            ClusterNode::Inner(inner) => inner.mem(),
        }
    }

    /// Absolute key the node's relative keys are measured from.
    #[must_use]
    pub fn offset(&self) -> i64 {
        match self {
            ClusterNode::Leaf(leaf) => leaf.offset(),
            ClusterNode::Inner(inner) => inner.offset(),
        }
    }

    /// Rows in a leaf, children in an inner node.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be resolved.
    pub fn node_size(&self) -> CoreResult<usize> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.node_size(),
            ClusterNode::Inner(inner) => inner.node_size(),
        }
    }

    /// Number of objects below this node.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be resolved.
    pub fn object_count(&self) -> CoreResult<u64> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.node_size().map(|n| n as u64),
            ClusterNode::Inner(inner) => inner.object_count(),
        }
    }

    /// Stored relative key of entry `i`: row key in a leaf, child key in an
    /// inner node.
    ///
    /// # Errors
    ///
    /// Fails if `i` is out of range.
    pub fn key_at(&self, i: usize) -> CoreResult<i64> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.key_at(i),
            ClusterNode::Inner(inner) => inner.key_at(i),
        }
    }

    /// Locates `key`, returning `None` if absent.
    ///
    /// # Errors
    ///
    /// Fails if a node cannot be resolved.
    pub fn get(&self, key: i64) -> CoreResult<Option<State>> {
        match self {
            ClusterNode::Leaf(leaf) => Ok(leaf.lookup(key)?.map(|index| State {
                split_key: 0,
                mem: leaf.mem(),
                index,
            })),
            ClusterNode::Inner(inner) => inner.get(key),
        }
    }

    /// Object at position `ndx` below this node.
    ///
    /// # Errors
    ///
    /// Fails if `ndx` is past the node's object count.
    pub fn get_by_index(&self, ndx: u64) -> CoreResult<ObjKey> {
        match self {
            ClusterNode::Leaf(leaf) => Ok(ObjKey::new(leaf.offset().wrapping_add(leaf.key_at(ndx as usize)?))),
            ClusterNode::Inner(inner) => inner.get_by_index(ndx),
        }
    }

    /// Inserts a row below this writable node. Returns the new sibling if
    /// the node split.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] if the key exists.
    pub fn insert(&self, key: i64, state: &mut State) -> CoreResult<Option<Ref>> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.insert(key, state),
            ClusterNode::Inner(inner) => inner.insert(key, state),
        }
    }

    /// Erases a row below this writable node, returning the node's
    /// remaining size.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key is absent.
    pub fn erase(&self, key: i64, cascade: &mut CascadeState) -> CoreResult<usize> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.erase(key, cascade),
            ClusterNode::Inner(inner) => inner.erase(key, cascade),
        }
    }

    /// Makes the path to `key` writable and returns the row's location.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key is absent.
    pub fn ensure_writeable(&self, key: i64) -> CoreResult<State> {
        match self {
            ClusterNode::Leaf(leaf) => {
                let index = leaf.lookup(key)?.ok_or(CoreError::KeyNotFound {
                    key: ObjKey::new(key),
                })?;
                Ok(State {
                    split_key: 0,
                    mem: leaf.mem(),
                    index,
                })
            }
            ClusterNode::Inner(inner) => inner.ensure_writeable(key),
        }
    }

    /// Adds `delta` to every relative key of this writable node.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be updated.
    pub fn adjust_keys(&self, delta: i64) -> CoreResult<()> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.adjust_keys(delta),
            ClusterNode::Inner(inner) => inner.adjust_keys(delta),
        }
    }

    /// Moves entries `from..` to the end of `target`, adding `key_adj` to
    /// each moved key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the nodes differ in kind.
    pub fn move_entries(&self, from: usize, target: &ClusterNode<'_>, key_adj: i64) -> CoreResult<()> {
        match (self, target) {
            (ClusterNode::Leaf(src), ClusterNode::Leaf(dst)) => src.move_rows(from, dst, key_adj),
            (ClusterNode::Inner(src), ClusterNode::Inner(dst)) => {
                src.move_entries(from, dst, key_adj)
            }
            _ => Err(CoreError::corruption(
                "sibling cluster nodes of different kinds",
            )),
        }
    }

    /// Releases a node whose entries have all been moved away.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be resolved.
    pub fn discard(&self) -> CoreResult<()> {
        match self {
            ClusterNode::Leaf(leaf) => leaf.discard(),
            ClusterNode::Inner(inner) => {
                inner.discard();
                Ok(())
            }
        }
    }
}
