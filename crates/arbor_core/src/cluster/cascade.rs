//! Bookkeeping for one cascading erase.

use crate::types::{ObjKey, TableKey};
use std::collections::{HashSet, VecDeque};

/// A link leaving an erased object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingLink {
    /// Table of the erased object.
    pub origin_table: TableKey,
    /// Tag of the link column.
    pub origin_tag: u32,
    /// The erased object.
    pub origin_key: ObjKey,
    /// Table the link points into.
    pub target_table: TableKey,
    /// Linked object.
    pub target_key: ObjKey,
    /// Tag of the backlink column in the target table.
    pub backlink_tag: u32,
    /// Whether the link owns its target.
    pub cascade: bool,
}

/// A link pointing at an erased object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingLink {
    /// Table holding the link.
    pub origin_table: TableKey,
    /// Tag of the link column.
    pub origin_tag: u32,
    /// Object holding the link.
    pub origin_key: ObjKey,
    /// The erased object.
    pub target_key: ObjKey,
}

/// Worklist and visited set of one logical delete.
///
/// Supply a fresh state per delete. Every `(table, key)` pair is queued at
/// most once, which bounds the work on cyclic link graphs; afterwards
/// [`CascadeState::erased`] lists every object the delete removed.
#[derive(Debug, Default)]
pub struct CascadeState {
    queue: VecDeque<(TableKey, ObjKey)>,
    visited: HashSet<(TableKey, ObjKey)>,
    erased: Vec<(TableKey, ObjKey)>,
    outgoing: Vec<OutgoingLink>,
    incoming: Vec<IncomingLink>,
}

impl CascadeState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an object unless it was queued before. Returns whether it was
    /// queued now.
    pub fn enqueue(&mut self, table: TableKey, key: ObjKey) -> bool {
        if self.visited.insert((table, key)) {
            self.queue.push_back((table, key));
            true
        } else {
            false
        }
    }

    /// Next queued object.
    pub fn next(&mut self) -> Option<(TableKey, ObjKey)> {
        self.queue.pop_front()
    }

    /// Whether the object was ever queued.
    #[must_use]
    pub fn contains(&self, table: TableKey, key: ObjKey) -> bool {
        self.visited.contains(&(table, key))
    }

    /// Objects erased so far, in order.
    #[must_use]
    pub fn erased(&self) -> &[(TableKey, ObjKey)] {
        &self.erased
    }

    /// Whether nothing is left to process.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn mark_erased(&mut self, table: TableKey, key: ObjKey) {
        self.visited.insert((table, key));
        self.erased.push((table, key));
    }

    pub(crate) fn record_outgoing(&mut self, link: OutgoingLink) {
        self.outgoing.push(link);
    }

    pub(crate) fn record_incoming(&mut self, link: IncomingLink) {
        self.incoming.push(link);
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<OutgoingLink> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn take_incoming(&mut self) -> Vec<IncomingLink> {
        std::mem::take(&mut self.incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_object_is_queued_once() {
        let mut state = CascadeState::new();
        let t = TableKey::new(0);
        assert!(state.enqueue(t, ObjKey::new(1)));
        assert!(state.enqueue(t, ObjKey::new(2)));
        assert!(!state.enqueue(t, ObjKey::new(1)));
        assert_eq!(state.next(), Some((t, ObjKey::new(1))));
        state.mark_erased(t, ObjKey::new(1));
        assert!(!state.enqueue(t, ObjKey::new(1)));
        assert_eq!(state.next(), Some((t, ObjKey::new(2))));
        assert!(state.is_done());
        assert_eq!(state.erased(), &[(t, ObjKey::new(1))]);
    }

    #[test]
    fn same_key_in_other_table_is_distinct() {
        let mut state = CascadeState::new();
        assert!(state.enqueue(TableKey::new(0), ObjKey::new(7)));
        assert!(state.enqueue(TableKey::new(1), ObjKey::new(7)));
        assert!(state.contains(TableKey::new(1), ObjKey::new(7)));
        assert!(!state.contains(TableKey::new(2), ObjKey::new(7)));
    }
}
