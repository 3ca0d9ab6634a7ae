//! Cluster leaves.

use super::cascade::{CascadeState, IncomingLink, OutgoingLink};
use super::{ClusterTree, State};
use crate::alloc::{Allocator, Block, Ref, Slot};
use crate::error::{CoreError, CoreResult};
use crate::schema::{ColumnSpec, ColumnStorage, ColumnType};
use crate::types::ObjKey;
use crate::value::Mixed;
use std::sync::Arc;
use tracing::trace;

/// A leaf's keys, without copying them out of the block.
pub(crate) enum KeyView {
    Compact(usize),
    General(Arc<Block>),
}

impl KeyView {
    fn keys(&self) -> &[i64] {
        match self {
            KeyView::General(block) => match &**block {
                Block::Ints(keys) => keys,
                _ => &[],
            },
            KeyView::Compact(_) => &[],
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            KeyView::Compact(n) => *n,
            KeyView::General(_) => self.keys().len(),
        }
    }

    pub(crate) fn get(&self, i: usize) -> i64 {
        match self {
            KeyView::Compact(_) => i as i64,
            KeyView::General(_) => self.keys()[i],
        }
    }

    /// Row holding absolute `key` in a leaf at `offset`.
    pub(crate) fn find(&self, key: i64, offset: i64) -> Option<usize> {
        match self {
            KeyView::Compact(n) => {
                let rel = distance(offset, key);
                (rel >= 0 && rel < *n as i128).then_some(rel as usize)
            }
            KeyView::General(_) => self
                .keys()
                .binary_search_by(|k| offset.wrapping_add(*k).cmp(&key))
                .ok(),
        }
    }

    /// First row whose absolute key is not below `key`.
    pub(crate) fn lower_bound(&self, key: i64, offset: i64) -> usize {
        match self {
            KeyView::Compact(n) => distance(offset, key).clamp(0, *n as i128) as usize,
            KeyView::General(_) => self.keys().partition_point(|k| offset.wrapping_add(*k) < key),
        }
    }
}

/// Exact `key - offset`, which may not fit an `i64`.
fn distance(offset: i64, key: i64) -> i128 {
    i128::from(key) - i128::from(offset)
}

fn enum_default(spec: &ColumnSpec) -> i64 {
    if spec.nullable {
        return -1;
    }
    spec.enum_keys
        .as_ref()
        .and_then(|keys| keys.iter().position(String::is_empty))
        .map_or(-1, |i| i as i64)
}

fn empty_column(spec: &ColumnSpec) -> Block {
    match spec.storage() {
        ColumnStorage::Values => Block::Values(Vec::new()),
        ColumnStorage::Enum => Block::Ints(Vec::new()),
        ColumnStorage::BackLinks => Block::KeyLists(Vec::new()),
        ColumnStorage::Dictionary => Block::Slots(Vec::new()),
    }
}

fn default_column(spec: &ColumnSpec, rows: usize) -> Block {
    match spec.storage() {
        ColumnStorage::Values => Block::Values(vec![spec.default_value(); rows]),
        ColumnStorage::Enum => Block::Ints(vec![enum_default(spec); rows]),
        ColumnStorage::BackLinks => Block::KeyLists(vec![Vec::new(); rows]),
        ColumnStorage::Dictionary => Block::Slots(vec![Slot::Null; rows * 2]),
    }
}

fn insert_default(block: &mut Block, row: usize, spec: &ColumnSpec) -> CoreResult<()> {
    match spec.storage() {
        ColumnStorage::Values => block.values_mut()?.insert(row, spec.default_value()),
        ColumnStorage::Enum => block.ints_mut()?.insert(row, enum_default(spec)),
        ColumnStorage::BackLinks => block.key_lists_mut()?.insert(row, Vec::new()),
        ColumnStorage::Dictionary => {
            let slots = block.slots_mut()?;
            slots.insert(2 * row, Slot::Null);
            slots.insert(2 * row, Slot::Null);
        }
    }
    Ok(())
}

fn column_rows(block: &Block) -> CoreResult<usize> {
    match block {
        Block::Values(v) => Ok(v.len()),
        Block::Ints(v) => Ok(v.len()),
        Block::KeyLists(v) => Ok(v.len()),
        Block::Slots(v) if v.len() % 2 == 0 => Ok(v.len() / 2),
        other => Err(CoreError::corruption(format!(
            "{} block used as a column",
            other.kind()
        ))),
    }
}

fn remove_row(block: &mut Block, row: usize) -> CoreResult<()> {
    let rows = column_rows(block)?;
    if row >= rows {
        return Err(CoreError::corruption(format!(
            "row {row} past end of column ({rows} rows)"
        )));
    }
    match block {
        Block::Values(v) => {
            v.remove(row);
        }
        Block::Ints(v) => {
            v.remove(row);
        }
        Block::KeyLists(v) => {
            v.remove(row);
        }
        Block::Slots(v) => {
            v.drain(2 * row..2 * row + 2);
        }
        _ => {}
    }
    Ok(())
}

/// Cuts rows `row..` out of a column block into a block of the same kind.
fn split_rows(block: &mut Block, row: usize) -> CoreResult<Block> {
    match block {
        Block::Values(v) => Ok(Block::Values(v.split_off(row))),
        Block::Ints(v) => Ok(Block::Ints(v.split_off(row))),
        Block::KeyLists(v) => Ok(Block::KeyLists(v.split_off(row))),
        Block::Slots(v) => Ok(Block::Slots(v.split_off(2 * row))),
        other => Err(CoreError::corruption(format!(
            "{} block used as a column",
            other.kind()
        ))),
    }
}

fn append_rows(block: &mut Block, tail: Block) -> CoreResult<()> {
    match (block, tail) {
        (Block::Values(v), Block::Values(t)) => v.extend(t),
        (Block::Ints(v), Block::Ints(t)) => v.extend(t),
        (Block::KeyLists(v), Block::KeyLists(t)) => v.extend(t),
        (Block::Slots(v), Block::Slots(t)) => v.extend(t),
        (dst, src) => {
            return Err(CoreError::corruption(format!(
                "cannot move {} rows into a {} column",
                src.kind(),
                dst.kind()
            )))
        }
    }
    Ok(())
}

fn row_missing(row: usize) -> CoreError {
    CoreError::corruption(format!("row {row} missing from column"))
}

/// A leaf of a [`ClusterTree`].
pub struct Cluster<'t> {
    tree: &'t ClusterTree,
    mem: Ref,
    offset: i64,
}

impl<'t> Cluster<'t> {
    pub(crate) fn new(tree: &'t ClusterTree, mem: Ref, offset: i64) -> Self {
        Self { tree, mem, offset }
    }

    /// Allocates an empty compact leaf with one column block per column.
    pub(crate) fn create(alloc: &Allocator, columns: &[ColumnSpec]) -> Ref {
        let mut slots = Vec::with_capacity(columns.len() + 1);
        slots.push(Slot::Tagged(0));
        for spec in columns {
            slots.push(Slot::Ref(alloc.alloc(empty_column(spec))));
        }
        alloc.alloc(Block::Slots(slots))
    }

    /// The leaf's block.
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

    fn slot(&self, i: usize) -> CoreResult<Slot> {
        self.alloc()
            .resolve(self.mem)?
            .slots()?
            .get(i)
            .copied()
            .ok_or_else(|| CoreError::corruption(format!("leaf {:?} lacks slot {i}", self.mem)))
    }

    pub(crate) fn key_view(&self) -> CoreResult<KeyView> {
        match self.slot(0)? {
            Slot::Tagged(n) => Ok(KeyView::Compact(n as usize)),
            Slot::Ref(r) => {
                let block = self.alloc().resolve(r)?;
                block.ints()?;
                Ok(KeyView::General(block))
            }
            Slot::Null => Err(CoreError::corruption(format!(
                "leaf {:?} has no key representation",
                self.mem
            ))),
        }
    }

    /// Whether keys are the implicit sequence `0..n`.
    ///
    /// # Errors
    ///
    /// Fails if the leaf cannot be resolved.
    pub fn is_compact(&self) -> CoreResult<bool> {
        Ok(matches!(self.slot(0)?, Slot::Tagged(_)))
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Fails if the leaf cannot be resolved.
    pub fn node_size(&self) -> CoreResult<usize> {
        Ok(self.key_view()?.len())
    }

    /// Row index of `key`.
    ///
    /// # Errors
    ///
    /// Fails if the leaf cannot be resolved.
    pub fn lookup(&self, key: i64) -> CoreResult<Option<usize>> {
        Ok(self.key_view()?.find(key, self.offset))
    }

    /// Stored key of row `i`, relative to the offset modulo 2^64.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn key_at(&self, i: usize) -> CoreResult<i64> {
        let view = self.key_view()?;
        if i >= view.len() {
            return Err(CoreError::IndexOutOfRange {
                index: i,
                size: view.len(),
            });
        }
        Ok(view.get(i))
    }

    fn set_compact_size(&self, n: usize) -> CoreResult<()> {
        self.alloc().update(self.mem, |b| {
            b.slots_mut()?[0] = Slot::Tagged(n as u64);
            Ok(())
        })
    }

    fn writable_keys(&self) -> CoreResult<Ref> {
        self.ensure_general_form()?;
        self.alloc().writable_slot_child(self.mem, 0)
    }

    /// Replaces the implicit key sequence with an explicit key array.
    ///
    /// # Errors
    ///
    /// Fails if the leaf is not writable.
    pub fn ensure_general_form(&self) -> CoreResult<()> {
        if let Slot::Tagged(n) = self.slot(0)? {
            let keys = self.alloc().alloc(Block::Ints((0..n as i64).collect()));
            self.alloc().update(self.mem, |b| {
                b.slots_mut()?[0] = Slot::Ref(keys);
                Ok(())
            })?;
            trace!(leaf = ?self.mem, rows = n, "leaf switched to explicit keys");
        }
        Ok(())
    }

    fn push_keys(&self, keys: &[i64]) -> CoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let KeyView::Compact(n) = self.key_view()? {
            let contiguous = keys
                .iter()
                .enumerate()
                .all(|(i, k)| *k == (n + i) as i64);
            if contiguous {
                return self.set_compact_size(n + keys.len());
            }
        }
        let kref = self.writable_keys()?;
        self.alloc().update(kref, |b| {
            b.ints_mut()?.extend_from_slice(keys);
            Ok(())
        })
    }

    fn truncate_keys(&self, len: usize) -> CoreResult<()> {
        match self.slot(0)? {
            Slot::Tagged(_) => self.set_compact_size(len),
            _ => {
                let kref = self.writable_keys()?;
                self.alloc().update(kref, |b| {
                    b.ints_mut()?.truncate(len);
                    Ok(())
                })
            }
        }
    }

    fn column_block(&self, pos: usize) -> CoreResult<Arc<Block>> {
        let r = self.slot(pos + 1)?.child()?;
        self.alloc().resolve(r)
    }

    fn writable_column(&self, pos: usize) -> CoreResult<Ref> {
        self.alloc().writable_slot_child(self.mem, pos + 1)
    }

    /// Inserts a row for `key` into this writable leaf, filled with column
    /// defaults.
    ///
    /// Splits at the midpoint once the leaf exceeds the fanout; the upper
    /// half moves to a new sibling whose keys are rebased on the split key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] if the key exists.
    pub fn insert(&self, key: i64, state: &mut State) -> CoreResult<Option<Ref>> {
        let view = self.key_view()?;
        let n = view.len();
        let pos = view.lower_bound(key, self.offset);
        if pos < n && self.offset.wrapping_add(view.get(pos)) == key {
            return Err(CoreError::DuplicateKey {
                key: ObjKey::new(key),
            });
        }
        let compact_append =
            matches!(view, KeyView::Compact(_)) && distance(self.offset, key) == n as i128;
        let rel = key.wrapping_sub(self.offset);
        drop(view);

        if compact_append {
            self.set_compact_size(n + 1)?;
        } else {
            let kref = self.writable_keys()?;
            self.alloc().update(kref, |b| {
                b.ints_mut()?.insert(pos, rel);
                Ok(())
            })?;
        }
        for (c, spec) in self.tree.columns().iter().enumerate() {
            let col = self.writable_column(c)?;
            self.alloc().update(col, |b| insert_default(b, pos, spec))?;
        }
        state.mem = self.mem;
        state.index = pos;

        let size = n + 1;
        if size <= self.tree.node_max() {
            return Ok(None);
        }
        let mid = size / 2;
        let split_key = self.key_at(mid)?;
        let sibling = Cluster::new(
            self.tree,
            Cluster::create(self.alloc(), self.tree.columns()),
            self.offset.wrapping_add(split_key),
        );
        self.move_rows(mid, &sibling, split_key.wrapping_neg())?;
        if pos >= mid {
            state.mem = sibling.mem;
            state.index = pos - mid;
        }
        state.split_key = split_key;
        trace!(leaf = ?self.mem, sibling = ?sibling.mem, split_key, "leaf split");
        Ok(Some(sibling.mem))
    }

    /// Erases the row for `key` from this writable leaf and returns the
    /// remaining row count.
    ///
    /// Links leaving and entering the row are recorded in `cascade` for the
    /// caller to resolve; the row's dictionaries are released.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key is absent.
    pub fn erase(&self, key: i64, cascade: &mut CascadeState) -> CoreResult<usize> {
        let view = self.key_view()?;
        let n = view.len();
        let idx = view
            .find(key, self.offset)
            .ok_or(CoreError::KeyNotFound { key: ObjKey::new(key) })?;
        let key = ObjKey::new(key);
        let compact = matches!(view, KeyView::Compact(_));
        drop(view);

        self.record_links(idx, key, cascade)?;
        for c in 0..self.tree.columns().len() {
            let col = self.writable_column(c)?;
            self.alloc().update(col, |b| remove_row(b, idx))?;
        }
        if compact && idx + 1 == n {
            self.set_compact_size(n - 1)?;
        } else {
            let kref = self.writable_keys()?;
            self.alloc().update(kref, |b| {
                b.ints_mut()?.remove(idx);
                Ok(())
            })?;
        }
        Ok(n - 1)
    }

    fn record_links(&self, idx: usize, key: ObjKey, cascade: &mut CascadeState) -> CoreResult<()> {
        for (c, spec) in self.tree.columns().iter().enumerate() {
            match &spec.ty {
                ColumnType::Link {
                    target,
                    cascade: strong,
                    backlink_tag,
                } => {
                    let col = self.column_block(c)?;
                    let value = col.values()?.get(idx).ok_or_else(|| row_missing(idx))?;
                    if let Mixed::Link(target_key) = value {
                        cascade.record_outgoing(OutgoingLink {
                            origin_table: self.tree.table_key(),
                            origin_tag: spec.tag,
                            origin_key: key,
                            target_table: *target,
                            target_key: *target_key,
                            backlink_tag: *backlink_tag,
                            cascade: *strong,
                        });
                    }
                }
                ColumnType::BackLink {
                    origin_table,
                    origin_tag,
                    ..
                } => {
                    let col = self.column_block(c)?;
                    let origins = col.key_lists()?.get(idx).ok_or_else(|| row_missing(idx))?;
                    for origin in origins {
                        cascade.record_incoming(IncomingLink {
                            origin_table: *origin_table,
                            origin_tag: *origin_tag,
                            origin_key: *origin,
                            target_key: key,
                        });
                    }
                }
                ColumnType::Dictionary => {
                    let col = self.column_block(c)?;
                    let slots = col.slots()?;
                    for which in 0..2 {
                        let r = slots
                            .get(2 * idx + which)
                            .ok_or_else(|| row_missing(idx))?
                            .as_ref();
                        self.alloc().free_tree(r)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Moves rows `ndx..` of this leaf to the end of `target`, adding
    /// `key_adj` to each moved key. Both leaves must be writable.
    ///
    /// # Errors
    ///
    /// Fails if either leaf cannot be updated.
    pub fn move_rows(&self, ndx: usize, target: &Cluster<'_>, key_adj: i64) -> CoreResult<()> {
        let view = self.key_view()?;
        let moved: Vec<i64> = (ndx..view.len()).map(|i| view.get(i).wrapping_add(key_adj)).collect();
        drop(view);
        for c in 0..self.tree.columns().len() {
            let src = self.writable_column(c)?;
            let tail = self.alloc().update(src, |b| split_rows(b, ndx))?;
            let dst = target.writable_column(c)?;
            self.alloc().update(dst, |b| append_rows(b, tail))?;
        }
        self.truncate_keys(ndx)?;
        target.push_keys(&moved)
    }

    /// Adds `delta` to every key of this writable leaf.
    ///
    /// # Errors
    ///
    /// Fails if the leaf cannot be updated.
    pub fn adjust_keys(&self, delta: i64) -> CoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let kref = self.writable_keys()?;
        self.alloc().update(kref, |b| {
            for k in b.ints_mut()? {
                *k = k.wrapping_add(delta);
            }
            Ok(())
        })
    }

    /// Releases the leaf and its column blocks.
    ///
    /// # Errors
    ///
    /// Fails if a block cannot be resolved.
    pub fn discard(&self) -> CoreResult<()> {
        self.alloc().free_tree(self.mem)
    }

    /// Adds a column block at position `pos`, filled with defaults.
    ///
    /// # Errors
    ///
    /// Fails if the leaf is not writable.
    pub fn insert_column(&self, pos: usize, spec: &ColumnSpec) -> CoreResult<()> {
        let rows = self.node_size()?;
        let col = self.alloc().alloc(default_column(spec, rows));
        self.alloc().update(self.mem, |b| {
            b.slots_mut()?.insert(pos + 1, Slot::Ref(col));
            Ok(())
        })
    }

    /// Drops the column block at position `pos` and everything below it.
    ///
    /// # Errors
    ///
    /// Fails if the leaf is not writable.
    pub fn remove_column(&self, pos: usize) -> CoreResult<()> {
        let slot = self
            .alloc()
            .update(self.mem, |b| Ok(b.slots_mut()?.remove(pos + 1)))?;
        self.alloc().free_tree(slot.as_ref())
    }

    /// Replaces the string column at `pos` with indices into `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if a stored string is missing from
    /// `keys`.
    pub fn upgrade_string_to_enum(&self, pos: usize, keys: &[String]) -> CoreResult<()> {
        let col = self.column_block(pos)?;
        let indices = col
            .values()?
            .iter()
            .map(|v| match v {
                Mixed::Null => Ok(-1),
                Mixed::String(s) => keys
                    .iter()
                    .position(|k| k == s)
                    .map(|i| i as i64)
                    .ok_or_else(|| CoreError::corruption(format!("string {s:?} not enumerated"))),
                other => Err(CoreError::type_mismatch("string", other.kind())),
            })
            .collect::<CoreResult<Vec<i64>>>()?;
        drop(col);
        let new_col = self.alloc().alloc(Block::Ints(indices));
        let old = self.alloc().update(self.mem, |b| {
            let slot = &mut b.slots_mut()?[pos + 1];
            Ok(std::mem::replace(slot, Slot::Ref(new_col)))
        })?;
        self.alloc().free(old.as_ref());
        Ok(())
    }

    /// Strings stored in column `pos`.
    ///
    /// # Errors
    ///
    /// Fails if the column does not hold plain values.
    pub(crate) fn strings(&self, pos: usize) -> CoreResult<Vec<String>> {
        Ok(self
            .column_block(pos)?
            .values()?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Value of column `pos` at row `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] for link-list style columns.
    pub fn value(&self, idx: usize, pos: usize) -> CoreResult<Mixed> {
        let spec = self.tree.column(pos)?;
        let col = self.column_block(pos)?;
        match spec.storage() {
            ColumnStorage::Values => col.values()?.get(idx).cloned().ok_or_else(|| row_missing(idx)),
            ColumnStorage::Enum => {
                let i = *col.ints()?.get(idx).ok_or_else(|| row_missing(idx))?;
                if i < 0 {
                    return Ok(Mixed::Null);
                }
                spec.enum_keys
                    .as_ref()
                    .and_then(|keys| keys.get(i as usize))
                    .map(|s| Mixed::String(s.clone()))
                    .ok_or_else(|| CoreError::corruption(format!("enum index {i} out of range")))
            }
            ColumnStorage::BackLinks | ColumnStorage::Dictionary => Err(CoreError::invalid_column(
                format!("column '{}' holds no plain values", spec.name),
            )),
        }
    }

    /// Stores `value` in the value column `pos` at row `idx`, returning the
    /// previous value. The leaf must be writable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] if the column does not store
    /// plain values.
    pub fn set_value(&self, idx: usize, pos: usize, value: Mixed) -> CoreResult<Mixed> {
        let spec = self.tree.column(pos)?;
        if spec.storage() != ColumnStorage::Values {
            return Err(CoreError::invalid_column(format!(
                "column '{}' does not store plain values",
                spec.name
            )));
        }
        let col = self.writable_column(pos)?;
        self.alloc().update(col, |b| {
            let cell = b.values_mut()?.get_mut(idx).ok_or_else(|| row_missing(idx))?;
            Ok(std::mem::replace(cell, value))
        })
    }

    /// Stores an enum index in column `pos` at row `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the column is not enumerated.
    pub fn set_enum_index(&self, idx: usize, pos: usize, index: i64) -> CoreResult<()> {
        let col = self.writable_column(pos)?;
        self.alloc().update(col, |b| {
            let cell = b.ints_mut()?.get_mut(idx).ok_or_else(|| row_missing(idx))?;
            *cell = index;
            Ok(())
        })
    }

    /// Origins recorded in backlink column `pos` at row `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a backlink column.
    pub fn backlinks(&self, idx: usize, pos: usize) -> CoreResult<Vec<ObjKey>> {
        self.column_block(pos)?
            .key_lists()?
            .get(idx)
            .cloned()
            .ok_or_else(|| row_missing(idx))
    }

    /// Records `origin` in backlink column `pos` at row `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a backlink column.
    pub fn add_backlink(&self, idx: usize, pos: usize, origin: ObjKey) -> CoreResult<()> {
        let col = self.writable_column(pos)?;
        self.alloc().update(col, |b| {
            b.key_lists_mut()?
                .get_mut(idx)
                .ok_or_else(|| row_missing(idx))?
                .push(origin);
            Ok(())
        })
    }

    /// Removes one occurrence of `origin`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a backlink column.
    pub fn remove_backlink(&self, idx: usize, pos: usize, origin: ObjKey) -> CoreResult<bool> {
        let col = self.writable_column(pos)?;
        self.alloc().update(col, |b| {
            let list = b.key_lists_mut()?.get_mut(idx).ok_or_else(|| row_missing(idx))?;
            match list.iter().position(|k| *k == origin) {
                Some(i) => {
                    list.remove(i);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Root of the keys (`which == 0`) or values (`which == 1`) tree of the
    /// dictionary in column `pos` at row `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a dictionary column.
    pub fn dictionary_ref(&self, idx: usize, pos: usize, which: usize) -> CoreResult<Ref> {
        self.column_block(pos)?
            .slots()?
            .get(2 * idx + which)
            .map(Slot::as_ref)
            .ok_or_else(|| row_missing(idx))
    }

    /// Replaces a dictionary tree root. The leaf must be writable.
    ///
    /// # Errors
    ///
    /// Fails if the column is not a dictionary column.
    pub fn set_dictionary_ref(&self, idx: usize, pos: usize, which: usize, r: Ref) -> CoreResult<()> {
        let col = self.writable_column(pos)?;
        self.alloc().update(col, |b| {
            let slot = b
                .slots_mut()?
                .get_mut(2 * idx + which)
                .ok_or_else(|| row_missing(idx))?;
            *slot = Slot::from_ref(r);
            Ok(())
        })
    }

    /// Checks the leaf's layout and returns its absolute keys.
    pub(crate) fn verify(&self) -> CoreResult<Vec<i64>> {
        let slots = self.alloc().resolve(self.mem)?;
        let width = slots.slots()?.len();
        let columns = self.tree.columns();
        if width != columns.len() + 1 {
            return Err(CoreError::corruption(format!(
                "leaf {:?} has {} column slots for {} columns",
                self.mem,
                width - 1,
                columns.len()
            )));
        }
        let view = self.key_view()?;
        let n = view.len();
        let keys: Vec<i64> = (0..n).map(|i| self.offset.wrapping_add(view.get(i))).collect();
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CoreError::corruption(format!(
                "leaf {:?} keys not strictly increasing",
                self.mem
            )));
        }
        for c in 0..columns.len() {
            let block = self.column_block(c)?;
            let rows = column_rows(&block)?;
            if rows != n {
                return Err(CoreError::corruption(format!(
                    "leaf {:?} column {c} holds {rows} rows, expected {n}",
                    self.mem
                )));
            }
        }
        Ok(keys)
    }
}
