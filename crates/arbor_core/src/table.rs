//! Groups and tables.
//!
//! A group is the slot list at the top of a version. Each of its slots holds
//! one table's top list:
//!
//! ```text
//! group top: [table 0, table 1, ...]
//! table top: [cluster root, schema]
//! ```
//!
//! Tables are addressed by [`TableKey`], which is the table's position in the
//! group top. Handles hold no node references of their own; every operation
//! re-resolves from the transaction's current top, so a handle never sees a
//! stale version.

use crate::alloc::{Allocator, Block, ParentLink, Ref, Slot, SlotLink};
use crate::cluster::{CascadeState, ClusterTree};
use crate::config::Config;
use crate::dictionary::{ConstDictionary, Dictionary};
use crate::error::{CoreError, CoreResult};
use crate::schema::{ColumnSpec, ColumnStorage, ColumnType, TableSchema};
use crate::types::{ColKey, ObjKey, TableKey};
use crate::value::Mixed;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

const CLUSTER_SLOT: usize = 0;
const SCHEMA_SLOT: usize = 1;

/// The tables of one transaction.
#[derive(Clone)]
pub struct Group {
    alloc: Arc<Allocator>,
    config: Arc<Config>,
    top: Arc<SlotLink>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("tables", &self.table_count().ok())
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Creates a handle on the group whose top list is child 0 of `root`.
    pub fn new(alloc: Arc<Allocator>, config: Arc<Config>, root: Arc<dyn ParentLink>) -> Self {
        let top = Arc::new(SlotLink::new(Arc::clone(&alloc), root, 0));
        Self { alloc, config, top }
    }

    /// Allocates the top list of an empty group.
    pub fn create_top(alloc: &Allocator) -> Ref {
        alloc.alloc(Block::Slots(Vec::new()))
    }

    /// The shared allocator.
    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// Number of tables.
    ///
    /// # Errors
    ///
    /// Fails if the group top cannot be resolved.
    pub fn table_count(&self) -> CoreResult<usize> {
        self.top.len()
    }

    /// Keys of all tables.
    ///
    /// # Errors
    ///
    /// Fails if the group top cannot be resolved.
    pub fn table_keys(&self) -> CoreResult<Vec<TableKey>> {
        Ok((0..self.table_count()?)
            .map(|i| TableKey::new(i as u32))
            .collect())
    }

    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the name is taken and
    /// [`CoreError::ReadOnly`] outside a write transaction.
    pub fn add_table(&self, name: &str) -> CoreResult<Table> {
        if self.find_table(name)?.is_some() {
            return Err(CoreError::invalid_operation(format!(
                "table '{name}' already exists"
            )));
        }
        self.top.check_writable()?;
        let root = ClusterTree::create_root(&self.alloc, &[]);
        let schema = self.alloc.alloc(Block::Schema(TableSchema::new(name)));
        let table_top = self
            .alloc
            .alloc(Block::Slots(vec![Slot::Ref(root), Slot::Ref(schema)]));
        let index = self.top.push(Slot::Ref(table_top))?;
        let key = TableKey::new(index as u32);
        debug!(table = %key, name, "table added");
        self.get_table(key)
    }

    /// Looks a table up by name.
    ///
    /// # Errors
    ///
    /// Fails if a schema cannot be resolved.
    pub fn find_table(&self, name: &str) -> CoreResult<Option<TableKey>> {
        for key in self.table_keys()? {
            if self.get_table(key)?.name()? == name {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Table named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableNotFound`] if no such table exists.
    pub fn table(&self, name: &str) -> CoreResult<Table> {
        match self.find_table(name)? {
            Some(key) => self.get_table(key),
            None => Err(CoreError::TableNotFound {
                table: name.to_string(),
            }),
        }
    }

    /// Table with key `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableNotFound`] if no such table exists.
    pub fn get_table(&self, key: TableKey) -> CoreResult<Table> {
        if self.top.get_child_ref(key.index())?.is_null() {
            return Err(CoreError::table_not_found(key));
        }
        Ok(Table {
            group: self.clone(),
            key,
            top: Arc::new(SlotLink::new(
                Arc::clone(&self.alloc),
                self.top.clone(),
                key.index(),
            )),
        })
    }
}

/// A table of objects.
#[derive(Clone)]
pub struct Table {
    group: Group,
    key: TableKey,
    top: Arc<SlotLink>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("key", &self.key)
            .field("name", &self.name().ok())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.group.top, &other.group.top)
    }
}

impl Table {
    /// Key of the table.
    #[must_use]
    pub fn key(&self) -> TableKey {
        self.key
    }

    /// Group holding the table.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    fn alloc(&self) -> &Arc<Allocator> {
        &self.group.alloc
    }

    /// Current schema.
    ///
    /// # Errors
    ///
    /// Fails if the schema block cannot be resolved.
    pub fn schema(&self) -> CoreResult<TableSchema> {
        let r = self.top.get_child_ref(SCHEMA_SLOT)?;
        Ok(self.alloc().resolve(r)?.schema()?.clone())
    }

    fn update_schema<R>(&self, f: impl FnOnce(&mut TableSchema) -> CoreResult<R>) -> CoreResult<R> {
        let r = self.top.writable_child(SCHEMA_SLOT)?;
        self.alloc().update(r, |b| f(b.schema_mut()?))
    }

    /// Table name.
    ///
    /// # Errors
    ///
    /// Fails if the schema block cannot be resolved.
    pub fn name(&self) -> CoreResult<String> {
        Ok(self.schema()?.name)
    }

    /// Cluster tree of the table's objects.
    ///
    /// # Errors
    ///
    /// Fails if the schema block cannot be resolved.
    pub fn tree(&self) -> CoreResult<ClusterTree> {
        let schema = self.schema()?;
        Ok(ClusterTree::new(
            Arc::clone(self.alloc()),
            self.top.clone(),
            CLUSTER_SLOT,
            self.key,
            schema.columns,
            self.group.config.node_max,
        ))
    }

    /// Key of the column named `name`.
    ///
    /// # Errors
    ///
    /// Fails if the schema block cannot be resolved.
    pub fn column_key(&self, name: &str) -> CoreResult<Option<ColKey>> {
        Ok(self.schema()?.find(name))
    }

    fn column(&self, col: ColKey) -> CoreResult<(usize, ColumnSpec)> {
        let schema = self.schema()?;
        let pos = schema.resolve(col)?;
        Ok((pos, schema.columns[pos].clone()))
    }

    /// Adds `spec` after the last column, in the leaves and the schema.
    fn append_column(&self, spec: ColumnSpec) -> CoreResult<ColKey> {
        let mut tree = self.tree()?;
        let pos = tree.columns().len();
        tree.insert_column(pos, spec.clone())?;
        let tag = spec.tag;
        self.update_schema(|s| {
            s.next_tag = s.next_tag.max(tag + 1);
            s.columns.push(spec);
            Ok(())
        })?;
        Ok(ColKey::new(pos as u32, tag))
    }

    fn drop_column(&self, pos: usize) -> CoreResult<()> {
        let mut tree = self.tree()?;
        tree.remove_column(pos)?;
        self.update_schema(|s| {
            s.columns.remove(pos);
            Ok(())
        })
    }

    fn check_new_name(&self, schema: &TableSchema, name: &str) -> CoreResult<()> {
        if schema.find(name).is_some() {
            return Err(CoreError::invalid_operation(format!(
                "column '{name}' already exists in '{}'",
                schema.name
            )));
        }
        Ok(())
    }

    /// Adds a column holding plain values or dictionaries.
    ///
    /// Existing objects get the column's default value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for a duplicate name and
    /// [`CoreError::InvalidColumn`] for link types, which have their own
    /// constructor.
    pub fn add_column(&self, name: &str, ty: ColumnType, nullable: bool) -> CoreResult<ColKey> {
        if matches!(ty, ColumnType::Link { .. } | ColumnType::BackLink { .. }) {
            return Err(CoreError::invalid_column(
                "link columns are added with add_link_column",
            ));
        }
        let schema = self.schema()?;
        self.check_new_name(&schema, name)?;
        let col = self.append_column(ColumnSpec::new(name, schema.next_tag, ty, nullable))?;
        debug!(table = %self.key, name, %col, "column added");
        Ok(col)
    }

    /// Adds a link column to `target` and the paired backlink column there.
    ///
    /// With `cascade`, a target loses its last strong origin is erased too.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableNotFound`] for an unknown target.
    pub fn add_link_column(&self, name: &str, target: TableKey, cascade: bool) -> CoreResult<ColKey> {
        let target_table = self.group.get_table(target)?;
        let schema = self.schema()?;
        self.check_new_name(&schema, name)?;
        let origin_tag = schema.next_tag;
        let backlink_tag = if target == self.key {
            origin_tag + 1
        } else {
            target_table.schema()?.next_tag
        };
        let col = self.append_column(ColumnSpec::new(
            name,
            origin_tag,
            ColumnType::Link {
                target,
                cascade,
                backlink_tag,
            },
            true,
        ))?;
        target_table.append_column(ColumnSpec::new(
            format!("__backlink_{}_{origin_tag}", self.key.0),
            backlink_tag,
            ColumnType::BackLink {
                origin_table: self.key,
                origin_tag,
                strong: cascade,
            },
            false,
        ))?;
        debug!(table = %self.key, name, %target, cascade, "link column added");
        Ok(col)
    }

    /// Removes a column. Removing a link column removes its backlink column.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] for a stale key and
    /// [`CoreError::InvalidOperation`] for a backlink column.
    pub fn remove_column(&self, col: ColKey) -> CoreResult<()> {
        let (pos, spec) = self.column(col)?;
        match spec.ty {
            ColumnType::BackLink { .. } => {
                return Err(CoreError::invalid_operation(format!(
                    "backlink column '{}' is removed with its link column",
                    spec.name
                )))
            }
            ColumnType::Link {
                target,
                backlink_tag,
                ..
            } => {
                self.unlink_all(pos, &spec)?;
                self.drop_column(pos)?;
                let target_table = self.group.get_table(target)?;
                let bpos = target_table
                    .schema()?
                    .position_of_tag(backlink_tag)
                    .ok_or_else(|| CoreError::corruption("link column without backlink column"))?;
                target_table.drop_column(bpos)?;
            }
            _ => self.drop_column(pos)?,
        }
        debug!(table = %self.key, column = %spec.name, "column removed");
        Ok(())
    }

    /// Clears every link of column `pos`, without cascading.
    fn unlink_all(&self, pos: usize, spec: &ColumnSpec) -> CoreResult<()> {
        let tree = self.tree()?;
        for key in tree.keys()? {
            if tree.get_value(key, pos)?.as_link().is_some() {
                self.relink(key, pos, spec, None, false)?;
            }
        }
        Ok(())
    }

    /// Converts a string column to enumerated storage.
    ///
    /// Reads and writes keep using strings; only the layout changes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] unless the column is a plain
    /// string column.
    pub fn enumerate_string_column(&self, col: ColKey) -> CoreResult<()> {
        let (pos, spec) = self.column(col)?;
        let mut tree = self.tree()?;
        let mut keys = tree.distinct_strings(pos)?;
        if !spec.nullable {
            if let Err(at) = keys.binary_search(&String::new()) {
                keys.insert(at, String::new());
            }
        }
        tree.upgrade_string_to_enum(pos, keys.clone())?;
        self.update_schema(|s| {
            s.columns[pos].enum_keys = Some(keys);
            Ok(())
        })
    }

    /// Number of objects.
    ///
    /// # Errors
    ///
    /// Fails if the tree cannot be resolved.
    pub fn size(&self) -> CoreResult<usize> {
        self.tree()?.size()
    }

    /// Object keys in ascending order.
    ///
    /// # Errors
    ///
    /// Fails if the tree cannot be resolved.
    pub fn keys(&self) -> CoreResult<Vec<ObjKey>> {
        self.tree()?.keys()
    }

    /// Whether `key` names a live object.
    ///
    /// # Errors
    ///
    /// Fails if the tree cannot be resolved.
    pub fn is_valid(&self, key: ObjKey) -> CoreResult<bool> {
        self.tree()?.is_valid(key)
    }

    /// Creates an object under the next unused key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] outside a write transaction.
    pub fn create_object(&self) -> CoreResult<ObjKey> {
        let key = ObjKey::new(self.schema()?.next_key);
        self.create_object_with_key(key)?;
        Ok(key)
    }

    /// Creates an object under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateKey`] if `key` is taken.
    pub fn create_object_with_key(&self, key: ObjKey) -> CoreResult<()> {
        self.tree()?.insert(key)?;
        self.update_schema(|s| {
            s.next_key = s.next_key.max(key.value().saturating_add(1));
            Ok(())
        })?;
        trace!(table = %self.key, %key, "object created");
        Ok(())
    }

    /// Value of `col` for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] for a missing object.
    pub fn get(&self, key: ObjKey, col: ColKey) -> CoreResult<Mixed> {
        let (pos, _) = self.column(col)?;
        self.tree()?.get_value(key, pos)
    }

    /// Stores `value` in `col` for `key`.
    ///
    /// Link columns go through [`Table::set_link`] so that backlinks stay in
    /// step.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] for a value the column cannot
    /// hold and [`CoreError::KeyNotFound`] for a missing object.
    pub fn set(&self, key: ObjKey, col: ColKey, value: impl Into<Mixed>) -> CoreResult<()> {
        let value = value.into();
        let (pos, spec) = self.column(col)?;
        spec.check_value(&value)?;
        if let ColumnType::Link { .. } = spec.ty {
            return self.set_link(key, col, value.as_link());
        }
        let tree = self.tree()?;
        if spec.storage() == ColumnStorage::Enum {
            let index = match value.as_str() {
                None => -1,
                Some(s) => self.enum_index(pos, s)?,
            };
            return tree.set_enum_index(key, pos, index);
        }
        tree.set_value(key, pos, value).map(|_| ())
    }

    /// Index of `s` among the enum keys of column `pos`, adding it if new.
    fn enum_index(&self, pos: usize, s: &str) -> CoreResult<i64> {
        let keys = self.schema()?.columns[pos]
            .enum_keys
            .clone()
            .unwrap_or_default();
        if let Some(i) = keys.iter().position(|k| k == s) {
            return Ok(i as i64);
        }
        self.update_schema(|schema| {
            let keys = schema.columns[pos].enum_keys.get_or_insert_with(Vec::new);
            keys.push(s.to_string());
            Ok(keys.len() as i64 - 1)
        })
    }

    /// Points the link column `col` of `key` at `target`, or clears it.
    ///
    /// The old target loses its backlink; if the column cascades and the old
    /// target has no strong origin left, it is erased.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if `key` or `target` is missing.
    pub fn set_link(&self, key: ObjKey, col: ColKey, target: Option<ObjKey>) -> CoreResult<()> {
        let (pos, spec) = self.column(col)?;
        if !matches!(spec.ty, ColumnType::Link { .. }) {
            return Err(CoreError::type_mismatch("link column", spec.type_name()));
        }
        self.relink(key, pos, &spec, target, true)
    }

    fn relink(
        &self,
        key: ObjKey,
        pos: usize,
        spec: &ColumnSpec,
        target: Option<ObjKey>,
        allow_cascade: bool,
    ) -> CoreResult<()> {
        let ColumnType::Link {
            target: target_key,
            cascade,
            backlink_tag,
        } = spec.ty
        else {
            return Err(CoreError::type_mismatch("link column", spec.type_name()));
        };
        let target_table = self.group.get_table(target_key)?;
        let bpos = target_table
            .schema()?
            .position_of_tag(backlink_tag)
            .ok_or_else(|| CoreError::corruption("link column without backlink column"))?;
        if let Some(t) = target {
            if !target_table.is_valid(t)? {
                return Err(CoreError::KeyNotFound { key: t });
            }
        }

        let tree = self.tree()?;
        let old = tree.get_value(key, pos)?.as_link();
        if old == target {
            return Ok(());
        }
        tree.set_value(key, pos, target.map_or(Mixed::Null, Mixed::Link))?;
        let target_tree = target_table.tree()?;
        if let Some(t) = target {
            target_tree.add_backlink(t, bpos, key)?;
        }
        if let Some(o) = old {
            if target_tree.is_valid(o)? {
                target_tree.remove_backlink(o, bpos, key)?;
                if cascade && allow_cascade && !target_tree.has_strong_backlinks(o)? {
                    let mut state = CascadeState::new();
                    target_table.erase_object(o, &mut state)?;
                }
            }
        }
        Ok(())
    }

    /// Origins in `origin` linking to `key` through the link column
    /// `link_col`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] if `link_col` does not point at
    /// this table.
    pub fn backlinks(&self, key: ObjKey, origin: &Table, link_col: ColKey) -> CoreResult<Vec<ObjKey>> {
        let (_, spec) = origin.column(link_col)?;
        let backlink_tag = match spec.ty {
            ColumnType::Link {
                target,
                backlink_tag,
                ..
            } if target == self.key => backlink_tag,
            _ => {
                return Err(CoreError::invalid_column(format!(
                    "'{}' does not link to {}",
                    spec.name, self.key
                )))
            }
        };
        let bpos = self
            .schema()?
            .position_of_tag(backlink_tag)
            .ok_or_else(|| CoreError::corruption("link column without backlink column"))?;
        self.tree()?.backlinks(key, bpos)
    }

    /// Total number of links pointing at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] for a missing object.
    pub fn backlink_count(&self, key: ObjKey) -> CoreResult<usize> {
        let tree = self.tree()?;
        let mut count = 0;
        for (pos, spec) in tree.columns().iter().enumerate() {
            if spec.storage() == ColumnStorage::BackLinks {
                count += tree.backlinks(key, pos)?.len();
            }
        }
        Ok(count)
    }

    fn dictionary_anchor(&self, key: ObjKey, col: ColKey) -> CoreResult<Arc<DictionaryAnchor>> {
        let (_, spec) = self.column(col)?;
        if spec.ty != ColumnType::Dictionary {
            return Err(CoreError::type_mismatch("dictionary column", spec.type_name()));
        }
        if !self.is_valid(key)? {
            return Err(CoreError::KeyNotFound { key });
        }
        Ok(Arc::new(DictionaryAnchor {
            table: self.clone(),
            key,
            tag: spec.tag,
        }))
    }

    /// Mutable dictionary stored in `col` of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] for a non-dictionary column.
    pub fn dictionary(&self, key: ObjKey, col: ColKey) -> CoreResult<Dictionary> {
        let anchor = self.dictionary_anchor(key, col)?;
        Ok(Dictionary::attached(
            Arc::clone(self.alloc()),
            anchor,
            self.group.config.dictionary_node_max,
        ))
    }

    /// Read-only dictionary stored in `col` of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] for a non-dictionary column.
    pub fn const_dictionary(&self, key: ObjKey, col: ColKey) -> CoreResult<ConstDictionary> {
        let anchor = self.dictionary_anchor(key, col)?;
        Ok(ConstDictionary::attached(
            Arc::clone(self.alloc()),
            anchor,
            self.group.config.dictionary_node_max,
        ))
    }

    /// Erases `key` and everything its removal cascades to.
    ///
    /// Objects reached through cascading links are erased once they have no
    /// strong origin left; links into erased objects are cleared. `cascade`
    /// records what was removed and guards against cycles. Returns the number
    /// of objects removed across all tables.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if `key` is missing.
    pub fn erase_object(&self, key: ObjKey, cascade: &mut CascadeState) -> CoreResult<usize> {
        if !self.is_valid(key)? {
            return Err(CoreError::KeyNotFound { key });
        }
        cascade.enqueue(self.key, key);
        let mut removed = 0;
        while let Some((table_key, obj)) = cascade.next() {
            let table = self.group.get_table(table_key)?;
            let tree = table.tree()?;
            if !tree.is_valid(obj)? {
                continue;
            }
            removed += tree.erase(obj, cascade)?;
            cascade.mark_erased(table_key, obj);
            trace!(table = %table_key, key = %obj, "object erased");

            for link in cascade.take_outgoing() {
                let target = self.group.get_table(link.target_table)?;
                let target_tree = target.tree()?;
                if !target_tree.is_valid(link.target_key)? {
                    continue;
                }
                let bpos = target
                    .schema()?
                    .position_of_tag(link.backlink_tag)
                    .ok_or_else(|| CoreError::corruption("link column without backlink column"))?;
                target_tree.remove_backlink(link.target_key, bpos, link.origin_key)?;
                if link.cascade && !target_tree.has_strong_backlinks(link.target_key)? {
                    cascade.enqueue(link.target_table, link.target_key);
                }
            }

            for link in cascade.take_incoming() {
                if cascade.contains(link.origin_table, link.origin_key) {
                    continue;
                }
                let origin = self.group.get_table(link.origin_table)?;
                let origin_tree = origin.tree()?;
                if !origin_tree.is_valid(link.origin_key)? {
                    continue;
                }
                let pos = origin
                    .schema()?
                    .position_of_tag(link.origin_tag)
                    .ok_or_else(|| CoreError::corruption("backlink column without link column"))?;
                if origin_tree.get_value(link.origin_key, pos)? == Mixed::Link(link.target_key) {
                    origin_tree.set_value(link.origin_key, pos, Mixed::Null)?;
                }
            }
        }
        if removed > 1 {
            debug!(table = %self.key, %key, removed, "cascading erase");
        }
        Ok(removed)
    }

    /// Erases `key` with a fresh cascade state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if `key` is missing.
    pub fn remove_object(&self, key: ObjKey) -> CoreResult<usize> {
        let mut cascade = CascadeState::new();
        self.erase_object(key, &mut cascade)
    }

    /// Checks the table's cluster tree.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] describing the first violation.
    pub fn verify(&self) -> CoreResult<()> {
        self.tree()?.verify()
    }
}

/// Anchors a dictionary in one cell of a dictionary column.
///
/// Child 0 is the keys tree, child 1 the values tree. The column is found by
/// tag on every access, so the anchor survives other columns being removed.
struct DictionaryAnchor {
    table: Table,
    key: ObjKey,
    tag: u32,
}

impl DictionaryAnchor {
    fn locate(&self) -> CoreResult<(ClusterTree, usize)> {
        let tree = self.table.tree()?;
        let pos = tree
            .columns()
            .iter()
            .position(|c| c.tag == self.tag)
            .ok_or_else(|| CoreError::invalid_column("dictionary column was removed"))?;
        Ok((tree, pos))
    }
}

impl ParentLink for DictionaryAnchor {
    fn get_child_ref(&self, ndx: usize) -> CoreResult<Ref> {
        let (tree, pos) = self.locate()?;
        tree.dictionary_ref(self.key, pos, ndx)
    }

    fn update_child_ref(&self, ndx: usize, new_ref: Ref) -> CoreResult<()> {
        let (tree, pos) = self.locate()?;
        tree.set_dictionary_ref(self.key, pos, ndx, new_ref)
    }

    fn check_writable(&self) -> CoreResult<()> {
        self.table.top.check_writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::parent::tests::RootCell;

    fn group(node_max: usize) -> (Arc<Allocator>, Group) {
        let alloc = Arc::new(Allocator::new());
        let top = Group::create_top(&alloc);
        let config = Arc::new(Config::new().node_max(node_max).dictionary_node_max(4));
        let group = Group::new(Arc::clone(&alloc), config, RootCell::new(top));
        (alloc, group)
    }

    #[test]
    fn tables_by_name_and_key() {
        let (_, group) = group(4);
        let a = group.add_table("a").unwrap();
        let b = group.add_table("b").unwrap();
        assert_eq!(group.table_count().unwrap(), 2);
        assert_eq!(group.table("b").unwrap(), b);
        assert_eq!(group.get_table(a.key()).unwrap().name().unwrap(), "a");
        assert!(matches!(
            group.add_table("a"),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            group.table("c"),
            Err(CoreError::TableNotFound { .. })
        ));
        assert!(group.get_table(TableKey::new(9)).is_err());
    }

    #[test]
    fn objects_and_values() {
        let (_, group) = group(4);
        let t = group.add_table("people").unwrap();
        let name = t.add_column("name", ColumnType::String, false).unwrap();
        let age = t.add_column("age", ColumnType::Int, true).unwrap();
        let keys: Vec<ObjKey> = (0..30).map(|_| t.create_object().unwrap()).collect();
        assert_eq!(keys[29], ObjKey::new(29));
        t.set(keys[3], name, "Ada").unwrap();
        t.set(keys[3], age, 36).unwrap();
        assert_eq!(t.get(keys[3], name).unwrap(), Mixed::from("Ada"));
        assert_eq!(t.get(keys[4], name).unwrap(), Mixed::from(""));
        assert_eq!(t.get(keys[4], age).unwrap(), Mixed::Null);
        assert!(matches!(
            t.set(keys[3], age, "old"),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            t.set(keys[3], name, Mixed::Null),
            Err(CoreError::TypeMismatch { .. })
        ));

        t.create_object_with_key(ObjKey::new(100)).unwrap();
        assert_eq!(t.create_object().unwrap(), ObjKey::new(101));
        assert!(matches!(
            t.create_object_with_key(ObjKey::new(100)),
            Err(CoreError::DuplicateKey { .. })
        ));
        t.verify().unwrap();
    }

    #[test]
    fn stale_column_key_is_rejected() {
        let (_, group) = group(4);
        let t = group.add_table("t").unwrap();
        let a = t.add_column("a", ColumnType::Int, false).unwrap();
        let b = t.add_column("b", ColumnType::Int, false).unwrap();
        let k = t.create_object().unwrap();
        t.set(k, b, 7).unwrap();
        t.remove_column(a).unwrap();
        assert_eq!(t.get(k, b).unwrap(), Mixed::from(7));
        assert!(matches!(t.get(k, a), Err(CoreError::InvalidColumn { .. })));
    }

    #[test]
    fn links_maintain_backlinks() {
        let (_, group) = group(4);
        let owners = group.add_table("owners").unwrap();
        let pets = group.add_table("pets").unwrap();
        let pet = owners.add_link_column("pet", pets.key(), false).unwrap();
        let o1 = owners.create_object().unwrap();
        let o2 = owners.create_object().unwrap();
        let p = pets.create_object().unwrap();

        owners.set_link(o1, pet, Some(p)).unwrap();
        owners.set(o2, pet, Mixed::Link(p)).unwrap();
        assert_eq!(pets.backlinks(p, &owners, pet).unwrap(), vec![o1, o2]);
        assert_eq!(pets.backlink_count(p).unwrap(), 2);

        owners.remove_object(o1).unwrap();
        assert_eq!(pets.backlinks(p, &owners, pet).unwrap(), vec![o2]);

        pets.remove_object(p).unwrap();
        assert_eq!(owners.get(o2, pet).unwrap(), Mixed::Null);
        assert!(matches!(
            owners.set_link(o2, pet, Some(ObjKey::new(55))),
            Err(CoreError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn cascade_follows_strong_links_only() {
        let (_, group) = group(4);
        let parents = group.add_table("parents").unwrap();
        let children = group.add_table("children").unwrap();
        let owned = parents.add_link_column("owned", children.key(), true).unwrap();
        let weak = parents.add_link_column("weak", children.key(), false).unwrap();

        let p1 = parents.create_object().unwrap();
        let p2 = parents.create_object().unwrap();
        let c1 = children.create_object().unwrap();
        let c2 = children.create_object().unwrap();
        let c3 = children.create_object().unwrap();
        parents.set_link(p1, owned, Some(c1)).unwrap();
        parents.set_link(p1, weak, Some(c3)).unwrap();
        parents.set_link(p1, owned, Some(c2)).unwrap();
        assert!(!children.is_valid(c1).unwrap());

        parents.set_link(p2, owned, Some(c2)).unwrap();
        let mut cascade = CascadeState::new();
        assert_eq!(parents.erase_object(p1, &mut cascade).unwrap(), 1);
        assert!(children.is_valid(c2).unwrap());
        assert!(children.is_valid(c3).unwrap());

        let mut cascade = CascadeState::new();
        assert_eq!(parents.erase_object(p2, &mut cascade).unwrap(), 2);
        assert_eq!(
            cascade.erased(),
            &[(parents.key(), p2), (children.key(), c2)]
        );
        assert_eq!(children.keys().unwrap(), vec![c3]);
    }

    #[test]
    fn cyclic_cascade_terminates() {
        let (_, group) = group(4);
        let nodes = group.add_table("nodes").unwrap();
        let next = nodes.add_link_column("next", nodes.key(), true).unwrap();
        let keys: Vec<ObjKey> = (0..10).map(|_| nodes.create_object().unwrap()).collect();
        for i in 0..10 {
            nodes.set_link(keys[i], next, Some(keys[(i + 1) % 10])).unwrap();
        }
        let other = nodes.create_object().unwrap();

        let mut cascade = CascadeState::new();
        assert_eq!(nodes.erase_object(keys[0], &mut cascade).unwrap(), 10);
        assert_eq!(cascade.erased().len(), 10);
        assert_eq!(nodes.keys().unwrap(), vec![other]);
        nodes.verify().unwrap();
    }

    #[test]
    fn removing_a_link_column_drops_its_backlinks() {
        let (_, group) = group(4);
        let a = group.add_table("a").unwrap();
        let b = group.add_table("b").unwrap();
        let link = a.add_link_column("to_b", b.key(), true).unwrap();
        let backlink = b.schema().unwrap().col_key(0).unwrap();
        assert!(matches!(
            b.remove_column(backlink),
            Err(CoreError::InvalidOperation { .. })
        ));
        let ka = a.create_object().unwrap();
        let kb = b.create_object().unwrap();
        a.set_link(ka, link, Some(kb)).unwrap();

        a.remove_column(link).unwrap();
        assert!(b.schema().unwrap().columns.is_empty());
        assert!(b.is_valid(kb).unwrap());
    }

    #[test]
    fn enumerated_column_reads_and_writes_strings() {
        let (_, group) = group(4);
        let t = group.add_table("t").unwrap();
        let color = t.add_column("color", ColumnType::String, false).unwrap();
        let keys: Vec<ObjKey> = (0..20).map(|_| t.create_object().unwrap()).collect();
        for (i, k) in keys.iter().enumerate() {
            t.set(*k, color, if i % 2 == 0 { "red" } else { "green" }).unwrap();
        }
        t.enumerate_string_column(color).unwrap();
        assert_eq!(
            t.schema().unwrap().columns[0].enum_keys,
            Some(vec![String::new(), "green".to_string(), "red".to_string()])
        );
        assert_eq!(t.get(keys[2], color).unwrap(), Mixed::from("red"));

        t.set(keys[2], color, "blue").unwrap();
        assert_eq!(t.get(keys[2], color).unwrap(), Mixed::from("blue"));
        let k = t.create_object().unwrap();
        assert_eq!(t.get(k, color).unwrap(), Mixed::from(""));
        t.verify().unwrap();
    }

    #[test]
    fn dictionary_lives_in_its_cell() {
        let (_, group) = group(4);
        let t = group.add_table("t").unwrap();
        let dict_col = t.add_column("attrs", ColumnType::Dictionary, true).unwrap();
        let keys: Vec<ObjKey> = (0..12).map(|_| t.create_object().unwrap()).collect();

        let mut d = t.dictionary(keys[5], dict_col).unwrap();
        for i in 0..20 {
            d.insert(format!("k{i}"), i).unwrap();
        }
        // Splits in the cluster tree move the cell; the anchor follows it.
        for _ in 0..40 {
            t.create_object().unwrap();
        }
        let view = t.const_dictionary(keys[5], dict_col).unwrap();
        assert_eq!(view.size().unwrap(), 20);
        assert_eq!(view.get("k7").unwrap(), Mixed::from(7));
        assert_eq!(t.const_dictionary(keys[6], dict_col).unwrap().size().unwrap(), 0);
        assert!(matches!(
            t.dictionary(keys[5], ColKey::new(0, 99)),
            Err(CoreError::InvalidColumn { .. })
        ));

        t.remove_object(keys[5]).unwrap();
        assert!(view.size().is_err());
        t.verify().unwrap();
    }
}
