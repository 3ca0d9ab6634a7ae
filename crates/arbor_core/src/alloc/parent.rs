//! Parent links: how a node finds and replaces its own reference.

use super::{Allocator, Block, Ref, Slot};
use crate::error::{CoreError, CoreResult};
use std::sync::Arc;

/// The owner of one or more child references.
///
/// A tree never stores a pointer back to whatever holds its root. Instead it
/// is handed a link plus the index of its slot in that link, and goes through
/// the link whenever the root reference must be read or replaced after a
/// copy-on-write.
pub trait ParentLink: Send + Sync {
    /// Current reference held at `ndx`.
    ///
    /// # Errors
    ///
    /// Fails if the owner can no longer be resolved.
    fn get_child_ref(&self, ndx: usize) -> CoreResult<Ref>;

    /// Replaces the reference held at `ndx`, making the owner writable first.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::ReadOnly`] when the chain ends in a read
    /// snapshot.
    fn update_child_ref(&self, ndx: usize, new_ref: Ref) -> CoreResult<()>;

    /// Checks that references below this link may be replaced.
    ///
    /// Callers check before duplicating anything, so a refused write leaves
    /// the allocator untouched.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::ReadOnly`] or [`CoreError::TransactionEnded`].
    fn check_writable(&self) -> CoreResult<()>;
}

/// A slot list that is itself child `ndx_in_parent` of another link.
///
/// Group and table top arrays are reached through chains of these.
pub struct SlotLink {
    alloc: Arc<Allocator>,
    parent: Arc<dyn ParentLink>,
    ndx_in_parent: usize,
}

impl SlotLink {
    /// Creates a link to the slot list held at `ndx_in_parent` of `parent`.
    pub fn new(alloc: Arc<Allocator>, parent: Arc<dyn ParentLink>, ndx_in_parent: usize) -> Self {
        Self {
            alloc,
            parent,
            ndx_in_parent,
        }
    }

    /// Reference of the slot list.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the parent holds no list here.
    pub fn get_ref(&self) -> CoreResult<Ref> {
        let r = self.parent.get_child_ref(self.ndx_in_parent)?;
        if r.is_null() {
            return Err(CoreError::corruption(format!(
                "missing slot list at index {}",
                self.ndx_in_parent
            )));
        }
        Ok(r)
    }

    /// The slot list's current block.
    ///
    /// # Errors
    ///
    /// Fails if the list cannot be resolved.
    pub fn block(&self) -> CoreResult<Arc<Block>> {
        self.alloc.resolve(self.get_ref()?)
    }

    /// Number of slots.
    ///
    /// # Errors
    ///
    /// Fails if the list cannot be resolved.
    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.block()?.slots()?.len())
    }

    /// Makes the slot list writable, rewiring every ancestor on the way.
    ///
    /// # Errors
    ///
    /// Fails if the chain ends in a read snapshot.
    pub fn writable(&self) -> CoreResult<Ref> {
        self.parent.check_writable()?;
        let r = self.get_ref()?;
        let w = self.alloc.copy_on_write(r)?;
        if w != r {
            self.parent.update_child_ref(self.ndx_in_parent, w)?;
        }
        Ok(w)
    }

    /// Makes the block held at slot `ndx` writable and returns it.
    ///
    /// # Errors
    ///
    /// Fails if the chain ends in a read snapshot or the slot is empty.
    pub fn writable_child(&self, ndx: usize) -> CoreResult<Ref> {
        let me = self.writable()?;
        self.alloc.writable_slot_child(me, ndx)
    }

    /// Appends a slot and returns its index.
    ///
    /// # Errors
    ///
    /// Fails if the chain ends in a read snapshot.
    pub fn push(&self, slot: Slot) -> CoreResult<usize> {
        let me = self.writable()?;
        self.alloc.update(me, |b| {
            let slots = b.slots_mut()?;
            slots.push(slot);
            Ok(slots.len() - 1)
        })
    }
}

impl ParentLink for SlotLink {
    fn get_child_ref(&self, ndx: usize) -> CoreResult<Ref> {
        Ok(self
            .block()?
            .slots()?
            .get(ndx)
            .map_or(Ref::NULL, Slot::as_ref))
    }

    fn update_child_ref(&self, ndx: usize, new_ref: Ref) -> CoreResult<()> {
        let me = self.writable()?;
        self.alloc.update(me, |b| {
            let slots = b.slots_mut()?;
            let len = slots.len();
            let slot = slots
                .get_mut(ndx)
                .ok_or_else(|| CoreError::corruption(format!("slot {ndx} past end ({len})")))?;
            *slot = Slot::from_ref(new_ref);
            Ok(())
        })
    }

    fn check_writable(&self) -> CoreResult<()> {
        self.parent.check_writable()
    }
}
