//! Reference-addressed block arena with copy-on-write.
//!
//! Every node of every tree lives in a [`Block`] addressed by an opaque
//! [`Ref`]. Refs below the allocator's *baseline* belong to committed
//! versions and are read-only: readers may be traversing them at any time.
//! Refs at or above the baseline were allocated by the running write
//! transaction and may be mutated in place.
//!
//! A writer that needs to change a read-only block calls
//! [`Allocator::copy_on_write`], which clones the block into the writable
//! space and retires the original. Retired blocks stay resolvable until
//! [`Allocator::reclaim`] is told no reader can reach them anymore.

pub(crate) mod parent;

pub use parent::{ParentLink, SlotLink};

use crate::error::{CoreError, CoreResult};
use crate::schema::TableSchema;
use crate::types::{ObjKey, Version};
use crate::value::Mixed;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Opaque handle to a block.
/// The default is [`Ref::NULL`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ref(u64);

impl Ref {
    /// The null reference.
    pub const NULL: Ref = Ref(0);

    /// Whether this is the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.0)
    }
}

/// One entry of a slot list: a tagged scalar or a child reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    /// No child.
    Null,
    /// Scalar stored inline.
    Tagged(u64),
    /// Child block.
    Ref(Ref),
}

impl Slot {
    /// Wraps `r`, mapping the null ref to [`Slot::Null`].
    #[must_use]
    pub fn from_ref(r: Ref) -> Self {
        if r.is_null() {
            Slot::Null
        } else {
            Slot::Ref(r)
        }
    }

    /// The child reference, or [`Ref::NULL`].
    #[must_use]
    pub fn as_ref(&self) -> Ref {
        match self {
            Slot::Ref(r) => *r,
            _ => Ref::NULL,
        }
    }

    /// The child reference; anything else is corruption.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the slot holds no reference.
    pub fn child(&self) -> CoreResult<Ref> {
        match self {
            Slot::Ref(r) => Ok(*r),
            other => Err(CoreError::corruption(format!(
                "expected child reference, found {other:?}"
            ))),
        }
    }
}

/// Interior node shared by cluster trees and ordered trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InnerNode {
    /// Cluster trees: first key of each child relative to this node's
    /// offset. Ordered trees leave this empty.
    pub keys: Vec<i64>,
    /// Number of elements stored below each child.
    pub counts: Vec<u64>,
    /// Child nodes.
    pub children: Vec<Ref>,
}

impl InnerNode {
    /// Total number of elements below this node.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Contents of one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    /// Slot list: cluster leaves, table and group top arrays, dictionary
    /// column arrays.
    Slots(Vec<Slot>),
    /// Integer array: explicit cluster keys, enum column indices, ordered
    /// tree leaves of `i64`.
    Ints(Vec<i64>),
    /// Value array: scalar columns and ordered tree leaves of [`Mixed`].
    Values(Vec<Mixed>),
    /// One list of origin keys per row of a backlink column.
    KeyLists(Vec<Vec<ObjKey>>),
    /// Interior tree node.
    Inner(InnerNode),
    /// Table schema.
    Schema(TableSchema),
}

macro_rules! block_view {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty, $what:literal) => {
        #[doc = concat!("Borrows the block as ", $what, ".")]
        ///
        /// # Errors
        ///
        /// Returns [`CoreError::Corruption`] for any other block kind.
        pub fn $name(&self) -> CoreResult<&$ty> {
            match self {
                Block::$variant(v) => Ok(v),
                other => Err(CoreError::corruption(format!(
                    concat!("expected ", $what, ", found {}"),
                    other.kind()
                ))),
            }
        }

        #[doc = concat!("Mutably borrows the block as ", $what, ".")]
        ///
        /// # Errors
        ///
        /// Returns [`CoreError::Corruption`] for any other block kind.
        pub fn $name_mut(&mut self) -> CoreResult<&mut $ty> {
            match self {
                Block::$variant(v) => Ok(v),
                other => Err(CoreError::corruption(format!(
                    concat!("expected ", $what, ", found {}"),
                    other.kind()
                ))),
            }
        }
    };
}

impl Block {
    /// Name of the block kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Block::Slots(_) => "slots",
            Block::Ints(_) => "ints",
            Block::Values(_) => "values",
            Block::KeyLists(_) => "key lists",
            Block::Inner(_) => "inner node",
            Block::Schema(_) => "schema",
        }
    }

    block_view!(slots, slots_mut, Slots, Vec<Slot>, "slots");
    block_view!(ints, ints_mut, Ints, Vec<i64>, "ints");
    block_view!(values, values_mut, Values, Vec<Mixed>, "values");
    block_view!(key_lists, key_lists_mut, KeyLists, Vec<Vec<ObjKey>>, "key lists");
    block_view!(inner, inner_mut, Inner, InnerNode, "inner node");
    block_view!(schema, schema_mut, Schema, TableSchema, "schema");

    /// References to child blocks owned by this block.
    #[must_use]
    pub fn child_refs(&self) -> Vec<Ref> {
        match self {
            Block::Slots(slots) => slots
                .iter()
                .map(Slot::as_ref)
                .filter(|r| !r.is_null())
                .collect(),
            Block::Inner(inner) => inner.children.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    blocks: HashMap<Ref, Arc<Block>>,
    next_ref: u64,
    baseline: u64,
    /// Read-only blocks superseded by committed versions, with the version
    /// from which they are unreachable.
    retired: Vec<(Ref, Version)>,
    /// Read-only blocks superseded by the running write transaction.
    pending_retire: Vec<Ref>,
}

/// The block arena.
///
/// One allocator backs a whole database and is shared by `Arc` between the
/// writer and all readers.
#[derive(Debug)]
pub struct Allocator {
    arena: RwLock<Arena>,
    content_version: AtomicU64,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena {
                next_ref: 1,
                baseline: 1,
                ..Arena::default()
            }),
            content_version: AtomicU64::new(0),
        }
    }

    /// Creates an allocator holding recovered, read-only blocks.
    #[must_use]
    pub fn with_blocks(blocks: HashMap<Ref, Block>, next_ref: u64) -> Self {
        let next_ref = next_ref.max(1);
        Self {
            arena: RwLock::new(Arena {
                blocks: blocks.into_iter().map(|(r, b)| (r, Arc::new(b))).collect(),
                next_ref,
                baseline: next_ref,
                ..Arena::default()
            }),
            content_version: AtomicU64::new(0),
        }
    }

    /// Counter bumped by every change to the arena.
    ///
    /// Accessors that cache references compare against this to decide
    /// whether they must re-resolve from their parent.
    #[must_use]
    pub fn content_version(&self) -> u64 {
        self.content_version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.content_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Allocates a writable block.
    pub fn alloc(&self, block: Block) -> Ref {
        let mut arena = self.arena.write();
        let r = Ref(arena.next_ref);
        arena.next_ref += 1;
        arena.blocks.insert(r, Arc::new(block));
        drop(arena);
        self.bump();
        r
    }

    /// Resolves `r` to its block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if `r` is null or unknown.
    pub fn resolve(&self, r: Ref) -> CoreResult<Arc<Block>> {
        self.arena
            .read()
            .blocks
            .get(&r)
            .cloned()
            .ok_or_else(|| CoreError::corruption(format!("unresolvable reference {r:?}")))
    }

    /// Whether `r` belongs to a committed version.
    #[must_use]
    pub fn is_read_only(&self, r: Ref) -> bool {
        r.0 < self.arena.read().baseline
    }

    /// Mutates a writable block in place.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] if `r` belongs to a committed version,
    /// [`CoreError::Corruption`] if it is unknown, or whatever `f` returns.
    pub fn update<R>(&self, r: Ref, f: impl FnOnce(&mut Block) -> CoreResult<R>) -> CoreResult<R> {
        let mut arena = self.arena.write();
        if r.0 < arena.baseline {
            return Err(CoreError::ReadOnly);
        }
        let block = arena
            .blocks
            .get_mut(&r)
            .ok_or_else(|| CoreError::corruption(format!("unresolvable reference {r:?}")))?;
        let result = f(Arc::make_mut(block));
        drop(arena);
        self.bump();
        result
    }

    /// Returns a writable version of `r`: `r` itself if it is writable,
    /// otherwise a fresh copy, retiring the original.
    ///
    /// The caller must store the returned reference in the parent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if `r` is unknown.
    pub fn copy_on_write(&self, r: Ref) -> CoreResult<Ref> {
        let mut arena = self.arena.write();
        if r.0 >= arena.baseline {
            return Ok(r);
        }
        let block = arena
            .blocks
            .get(&r)
            .ok_or_else(|| CoreError::corruption(format!("unresolvable reference {r:?}")))?;
        let copy = Arc::new(Block::clone(block));
        let new = Ref(arena.next_ref);
        arena.next_ref += 1;
        arena.blocks.insert(new, copy);
        arena.pending_retire.push(r);
        drop(arena);
        trace!(from = ?r, to = ?new, "copy on write");
        self.bump();
        Ok(new)
    }

    /// Releases one block. Writable blocks are dropped at once; committed
    /// ones are retired until no reader can see them.
    pub fn free(&self, r: Ref) {
        if r.is_null() {
            return;
        }
        let mut arena = self.arena.write();
        if r.0 >= arena.baseline {
            arena.blocks.remove(&r);
        } else {
            arena.pending_retire.push(r);
        }
        drop(arena);
        self.bump();
    }

    /// Releases `r` and every block below it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if a reference cannot be resolved.
    pub fn free_tree(&self, r: Ref) -> CoreResult<()> {
        if r.is_null() {
            return Ok(());
        }
        let mut stack = vec![r];
        while let Some(r) = stack.pop() {
            let block = self.resolve(r)?;
            stack.extend(block.child_refs());
            self.free(r);
        }
        Ok(())
    }

    /// Makes slot `slot` of the writable slot list `parent` point at a
    /// writable child, copying the child if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the slot holds no reference.
    pub fn writable_slot_child(&self, parent: Ref, slot: usize) -> CoreResult<Ref> {
        let child = self.resolve(parent)?.slots()?.get(slot).copied().ok_or_else(|| {
            CoreError::corruption(format!("slot {slot} missing in {parent:?}"))
        })?;
        let child = child.child()?;
        let writable = self.copy_on_write(child)?;
        if writable != child {
            self.update(parent, |b| {
                b.slots_mut()?[slot] = Slot::Ref(writable);
                Ok(())
            })?;
        }
        Ok(writable)
    }

    /// Makes child `i` of the writable inner node `parent` writable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if `i` is out of range.
    pub fn writable_inner_child(&self, parent: Ref, i: usize) -> CoreResult<Ref> {
        let child = self.resolve(parent)?.inner()?.children.get(i).copied().ok_or_else(|| {
            CoreError::corruption(format!("child {i} missing in {parent:?}"))
        })?;
        let writable = self.copy_on_write(child)?;
        if writable != child {
            self.update(parent, |b| {
                b.inner_mut()?.children[i] = writable;
                Ok(())
            })?;
        }
        Ok(writable)
    }

    /// Blocks allocated by the running write transaction, in reference
    /// order.
    #[must_use]
    pub fn pending_blocks(&self) -> Vec<(Ref, Arc<Block>)> {
        let arena = self.arena.read();
        let baseline = arena.baseline;
        let mut fresh: Vec<(Ref, Arc<Block>)> = arena
            .blocks
            .iter()
            .filter(|(r, _)| r.0 >= baseline)
            .map(|(r, b)| (*r, Arc::clone(b)))
            .collect();
        fresh.sort_by_key(|(r, _)| *r);
        fresh
    }

    /// Seals the running write transaction as `version`.
    ///
    /// Every writable block becomes read-only, and blocks the transaction
    /// superseded are retired as of `version`.
    pub fn commit(&self, version: Version) {
        let mut arena = self.arena.write();
        let sealed = arena.next_ref - arena.baseline;
        let retired = std::mem::take(&mut arena.pending_retire);
        arena.retired.extend(retired.into_iter().map(|r| (r, version)));
        arena.baseline = arena.next_ref;
        drop(arena);
        self.bump();
        debug!(%version, sealed, "allocator sealed version");
    }

    /// Marks every cached view stale without changing any block.
    pub fn invalidate(&self) {
        self.bump();
    }

    /// Discards everything the running write transaction allocated.
    pub fn rollback(&self) {
        let mut arena = self.arena.write();
        let baseline = arena.baseline;
        arena.blocks.retain(|r, _| r.0 < baseline);
        arena.pending_retire.clear();
        drop(arena);
        self.bump();
        debug!("allocator rolled back");
    }

    /// Drops retired blocks no reader can reach.
    ///
    /// `oldest_reader` is the oldest version a live reader is pinned at; a
    /// block retired by version `v` is invisible to every reader at `v` or
    /// later. Returns the number of blocks dropped.
    pub fn reclaim(&self, oldest_reader: Option<Version>) -> usize {
        let mut arena = self.arena.write();
        let mut dropped = Vec::new();
        arena.retired.retain(|(r, v)| {
            let free = oldest_reader.map_or(true, |oldest| *v <= oldest);
            if free {
                dropped.push(*r);
            }
            !free
        });
        for r in &dropped {
            arena.blocks.remove(r);
        }
        drop(arena);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "reclaimed retired blocks");
        }
        dropped.len()
    }

    /// Number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.arena.read().blocks.len()
    }

    /// Next reference to be handed out.
    #[must_use]
    pub fn next_ref(&self) -> u64 {
        self.arena.read().next_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ref_is_null() {
        assert_eq!(Ref::default(), Ref::NULL);
        assert!(Ref::default().is_null());
        let state = crate::cluster::State::default();
        assert!(state.mem.is_null());
        assert_eq!(state.index, 0);
    }

    #[test]
    fn committed_blocks_are_read_only() {
        let alloc = Allocator::new();
        let r = alloc.alloc(Block::Ints(vec![1, 2]));
        assert!(!alloc.is_read_only(r));
        alloc.commit(Version::new(1));
        assert!(alloc.is_read_only(r));
        assert!(matches!(
            alloc.update(r, |_| Ok(())),
            Err(CoreError::ReadOnly)
        ));
    }

    #[test]
    fn copy_on_write_leaves_original_intact() {
        let alloc = Allocator::new();
        let r = alloc.alloc(Block::Ints(vec![1]));
        alloc.commit(Version::new(1));

        let w = alloc.copy_on_write(r).unwrap();
        assert_ne!(r, w);
        alloc
            .update(w, |b| {
                b.ints_mut()?.push(2);
                Ok(())
            })
            .unwrap();

        assert_eq!(alloc.resolve(r).unwrap().ints().unwrap(), &vec![1]);
        assert_eq!(alloc.resolve(w).unwrap().ints().unwrap(), &vec![1, 2]);
        assert_eq!(alloc.copy_on_write(w).unwrap(), w);
    }

    #[test]
    fn rollback_drops_fresh_blocks_only() {
        let alloc = Allocator::new();
        let kept = alloc.alloc(Block::Ints(vec![]));
        alloc.commit(Version::new(1));
        let fresh = alloc.alloc(Block::Ints(vec![]));
        alloc.free(kept);
        alloc.rollback();
        assert!(alloc.resolve(kept).is_ok());
        assert!(alloc.resolve(fresh).is_err());
        assert_eq!(alloc.reclaim(None), 0);
    }

    #[test]
    fn retired_blocks_wait_for_readers() {
        let alloc = Allocator::new();
        let r = alloc.alloc(Block::Ints(vec![]));
        alloc.commit(Version::new(1));
        let _copy = alloc.copy_on_write(r).unwrap();
        alloc.commit(Version::new(2));

        // A reader still pinned at version 1 can reach `r`.
        assert_eq!(alloc.reclaim(Some(Version::new(1))), 0);
        assert!(alloc.resolve(r).is_ok());

        assert_eq!(alloc.reclaim(Some(Version::new(2))), 1);
        assert!(alloc.resolve(r).is_err());
    }

    #[test]
    fn content_version_moves_on_every_change() {
        let alloc = Allocator::new();
        let v0 = alloc.content_version();
        let r = alloc.alloc(Block::Values(vec![]));
        let v1 = alloc.content_version();
        assert!(v1 > v0);
        alloc.commit(Version::new(1));
        assert!(alloc.content_version() > v1);
        let _ = alloc.resolve(r).unwrap();
        let v2 = alloc.content_version();
        assert_eq!(alloc.content_version(), v2);
    }

    #[test]
    fn pending_blocks_lists_only_fresh_work() {
        let alloc = Allocator::new();
        let old = alloc.alloc(Block::Ints(vec![]));
        alloc.commit(Version::new(1));
        let a = alloc.alloc(Block::Ints(vec![1]));
        let b = alloc.copy_on_write(old).unwrap();
        let refs: Vec<Ref> = alloc.pending_blocks().into_iter().map(|(r, _)| r).collect();
        assert_eq!(refs, vec![a, b]);
        alloc.commit(Version::new(2));
        assert!(alloc.pending_blocks().is_empty());
    }

    #[test]
    fn free_tree_walks_children() {
        let alloc = Allocator::new();
        let leaf = alloc.alloc(Block::Ints(vec![]));
        let col = alloc.alloc(Block::Values(vec![]));
        let top = alloc.alloc(Block::Slots(vec![
            Slot::Ref(leaf),
            Slot::Tagged(3),
            Slot::Ref(col),
        ]));
        alloc.free_tree(top).unwrap();
        assert_eq!(alloc.block_count(), 0);
    }

    #[test]
    fn writable_slot_child_rewires_parent() {
        let alloc = Allocator::new();
        let child = alloc.alloc(Block::Ints(vec![7]));
        let parent = alloc.alloc(Block::Slots(vec![Slot::Tagged(0), Slot::Ref(child)]));
        alloc.commit(Version::new(1));

        let parent_w = alloc.copy_on_write(parent).unwrap();
        let child_w = alloc.writable_slot_child(parent_w, 1).unwrap();
        assert_ne!(child_w, child);
        assert_eq!(
            alloc.resolve(parent_w).unwrap().slots().unwrap()[1],
            Slot::Ref(child_w)
        );
        assert_eq!(
            alloc.resolve(parent).unwrap().slots().unwrap()[1],
            Slot::Ref(child)
        );
    }
}
