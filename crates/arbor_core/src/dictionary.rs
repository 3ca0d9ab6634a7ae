//! Per-object dictionaries.
//!
//! A dictionary is a map from [`Mixed`] to [`Mixed`] stored as two parallel
//! [`BPlusTree`]s: one of keys, one of values. Entries keep insertion order
//! because new keys are appended, never sorted in.
//!
//! An attached dictionary does not own its trees. It reaches them through an
//! anchor, a [`ParentLink`] exposing the keys root at index 0 and the values
//! root at index 1. Before every operation the dictionary compares the
//! allocator's content version with the one it last synchronised at, and
//! reloads both roots from the anchor if they differ. A handle obtained
//! before a transaction boundary therefore sees the new state lazily.
//!
//! Key lookup is a linear scan of the keys tree.

use crate::alloc::{Allocator, ParentLink};
use crate::bptree::BPlusTree;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::value::Mixed;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::trace;

const KEYS: usize = 0;
const VALUES: usize = 1;

struct Trees {
    content_version: Option<u64>,
    keys: BPlusTree<Mixed>,
    values: BPlusTree<Mixed>,
}

/// Read access to a dictionary.
pub struct ConstDictionary {
    alloc: Arc<Allocator>,
    anchor: Option<Arc<dyn ParentLink>>,
    trees: Mutex<Trees>,
}

impl ConstDictionary {
    fn with_anchor(
        alloc: Arc<Allocator>,
        anchor: Option<Arc<dyn ParentLink>>,
        node_max: usize,
    ) -> Self {
        let mut keys = BPlusTree::new(Arc::clone(&alloc), node_max);
        let mut values = BPlusTree::new(Arc::clone(&alloc), node_max);
        if let Some(anchor) = &anchor {
            keys.set_parent(Arc::clone(anchor), KEYS);
            values.set_parent(Arc::clone(anchor), VALUES);
        }
        Self {
            alloc,
            anchor,
            trees: Mutex::new(Trees {
                content_version: None,
                keys,
                values,
            }),
        }
    }

    /// Creates a view of the dictionary held by `anchor`.
    pub fn attached(alloc: Arc<Allocator>, anchor: Arc<dyn ParentLink>, node_max: usize) -> Self {
        Self::with_anchor(alloc, Some(anchor), node_max)
    }

    /// Reloads both roots from the anchor if anything changed since the last
    /// access.
    fn update_if_needed(&self, trees: &mut Trees) -> CoreResult<()> {
        if self.anchor.is_none() {
            return Ok(());
        }
        let current = self.alloc.content_version();
        if trees.content_version == Some(current) {
            return Ok(());
        }
        let keys = trees.keys.init_from_parent()?;
        let values = trees.values.init_from_parent()?;
        if keys != values {
            return Err(CoreError::corruption(
                "dictionary has a keys tree without a values tree",
            ));
        }
        if keys && trees.keys.size()? != trees.values.size()? {
            return Err(CoreError::corruption(format!(
                "dictionary holds {} keys but {} values",
                trees.keys.size()?,
                trees.values.size()?
            )));
        }
        trees.content_version = Some(current);
        Ok(())
    }

    fn with_trees<R>(&self, f: impl FnOnce(&mut Trees) -> CoreResult<R>) -> CoreResult<R> {
        let mut trees = self.trees.lock();
        self.update_if_needed(&mut trees)?;
        f(&mut trees)
    }

    /// Whether the backing trees exist.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn is_attached(&self) -> CoreResult<bool> {
        self.with_trees(|t| Ok(t.keys.is_attached()))
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn size(&self) -> CoreResult<usize> {
        self.with_trees(|t| t.keys.size())
    }

    /// Whether the dictionary holds no entries.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.size()? == 0)
    }

    /// Position of `key`.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn find(&self, key: &Mixed) -> CoreResult<Option<usize>> {
        self.with_trees(|t| t.keys.find_first(key))
    }

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn contains(&self, key: &Mixed) -> CoreResult<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryKeyNotFound`] if absent.
    pub fn get(&self, key: impl Into<Mixed>) -> CoreResult<Mixed> {
        let key = key.into();
        self.try_get(&key)?.ok_or_else(|| CoreError::DictionaryKeyNotFound {
            key: key.to_string(),
        })
    }

    /// Value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn try_get(&self, key: &Mixed) -> CoreResult<Option<Mixed>> {
        self.with_trees(|t| match t.keys.find_first(key)? {
            Some(i) => t.values.get(i).map(Some),
            None => Ok(None),
        })
    }

    /// Entry at position `ndx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] past the end.
    pub fn get_pair(&self, ndx: usize) -> CoreResult<(Mixed, Mixed)> {
        self.with_trees(|t| Ok((t.keys.get(ndx)?, t.values.get(ndx)?)))
    }

    /// Iterates over the entries in insertion order.
    ///
    /// The iterator works on the version current when it was created.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn iter(&self) -> CoreResult<impl Iterator<Item = (Mixed, Mixed)>> {
        self.with_trees(|t| Ok(t.keys.iter()?.zip(t.values.iter()?)))
    }

    /// Collects the entries in insertion order.
    ///
    /// # Errors
    ///
    /// Fails if the anchor cannot be resolved.
    pub fn to_vec(&self) -> CoreResult<Vec<(Mixed, Mixed)>> {
        Ok(self.iter()?.collect())
    }

    /// Whether both dictionaries hold the same entries in the same order.
    ///
    /// # Errors
    ///
    /// Fails if either anchor cannot be resolved.
    pub fn equals(&self, other: &ConstDictionary) -> CoreResult<bool> {
        if std::ptr::eq(self, other) {
            return Ok(true);
        }
        if self.size()? != other.size()? {
            return Ok(false);
        }
        Ok(self.to_vec()? == other.to_vec()?)
    }
}

impl PartialEq for ConstDictionary {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other).unwrap_or(false)
    }
}

impl fmt::Debug for ConstDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_vec() {
            Ok(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Err(e) => write!(f, "ConstDictionary(<{e}>)"),
        }
    }
}

/// A mutable dictionary.
///
/// Dereferences to [`ConstDictionary`] for reads.
///
/// # Example
///
/// ```rust,ignore
/// let mut dict = table.dictionary(obj, col)?;
/// let (_, inserted) = dict.insert("Hello", 9)?;
/// assert!(inserted);
/// dict.insert("Hello", 10)?;
/// assert_eq!(dict.get("Hello")?, Mixed::from(10));
/// ```
#[derive(Debug)]
pub struct Dictionary {
    inner: ConstDictionary,
}

impl Deref for Dictionary {
    type Target = ConstDictionary;

    fn deref(&self) -> &ConstDictionary {
        &self.inner
    }
}

impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    /// Creates a standalone dictionary with private storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ConstDictionary::with_anchor(
                Arc::new(Allocator::new()),
                None,
                Config::default().dictionary_node_max,
            ),
        }
    }

    /// Creates a mutable view of the dictionary held by `anchor`.
    pub fn attached(alloc: Arc<Allocator>, anchor: Arc<dyn ParentLink>, node_max: usize) -> Self {
        Self {
            inner: ConstDictionary::attached(alloc, anchor, node_max),
        }
    }

    /// Allocates the backing trees unless they exist.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn create(&mut self) -> CoreResult<()> {
        self.inner.with_trees(|t| {
            if !t.keys.is_attached() {
                t.keys.create()?;
                t.values.create()?;
                trace!("dictionary storage created");
            }
            Ok(())
        })
    }

    /// Releases the backing trees.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn destroy(&mut self) -> CoreResult<()> {
        self.inner.with_trees(|t| {
            t.keys.destroy()?;
            t.values.destroy()?;
            trace!("dictionary storage released");
            Ok(())
        })
    }

    /// Inserts or overwrites an entry.
    ///
    /// A new key is appended and reported with `true`; an existing key keeps
    /// its position, gets the new value, and is reported with `false`.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn insert(
        &mut self,
        key: impl Into<Mixed>,
        value: impl Into<Mixed>,
    ) -> CoreResult<(usize, bool)> {
        let (key, value) = (key.into(), value.into());
        self.create()?;
        self.inner.with_trees(|t| match t.keys.find_first(&key)? {
            Some(i) => {
                t.values.set(i, value)?;
                Ok((i, false))
            }
            None => {
                let i = t.keys.size()?;
                t.keys.add(key)?;
                t.values.add(value)?;
                Ok((i, true))
            }
        })
    }

    /// Removes `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn erase(&mut self, key: impl Into<Mixed>) -> CoreResult<bool> {
        let key = key.into();
        self.inner.with_trees(|t| match t.keys.find_first(&key)? {
            Some(i) => {
                t.keys.erase(i)?;
                t.values.erase(i)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Removes every entry, keeping the storage.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.inner.with_trees(|t| {
            if t.keys.size()? > 0 {
                t.keys.clear()?;
                t.values.clear()?;
            }
            Ok(())
        })
    }

    /// Settable access to `key`, inserting a null value if it is missing.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn entry(&mut self, key: impl Into<Mixed>) -> CoreResult<Entry<'_>> {
        let key = key.into();
        if !self.contains(&key)? {
            self.insert(key.clone(), Mixed::Null)?;
        }
        Ok(Entry { dict: self, key })
    }

    /// Copies the entries into a new standalone dictionary.
    ///
    /// The copy shares nothing with `self`: clearing either leaves the other
    /// intact.
    ///
    /// # Errors
    ///
    /// Fails if `self` cannot be read.
    pub fn try_clone(&self) -> CoreResult<Dictionary> {
        let mut copy = Dictionary::new();
        if self.is_attached()? {
            copy.create()?;
        }
        for (k, v) in self.to_vec()? {
            copy.insert(k, v)?;
        }
        Ok(copy)
    }
}

/// A dictionary slot returned by [`Dictionary::entry`].
pub struct Entry<'a> {
    dict: &'a mut Dictionary,
    key: Mixed,
}

impl Entry<'_> {
    /// Key of the entry.
    #[must_use]
    pub fn key(&self) -> &Mixed {
        &self.key
    }

    /// Current value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryKeyNotFound`] if the entry was erased
    /// meanwhile.
    pub fn get(&self) -> CoreResult<Mixed> {
        self.dict.get(self.key.clone())
    }

    /// Replaces the value.
    ///
    /// # Errors
    ///
    /// Fails if the anchor refuses the write.
    pub fn set(&mut self, value: impl Into<Mixed>) -> CoreResult<()> {
        self.dict.insert(self.key.clone(), value).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Block, Ref, Slot, SlotLink};
    use crate::alloc::parent::tests::RootCell;
    use crate::types::Version;

    #[test]
    fn hello_goodbye() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.insert("Hello", 9).unwrap(), (0, true));
        assert_eq!(dict.get("Hello").unwrap(), Mixed::from(9));
        assert_eq!(dict.insert("Hello", 10).unwrap(), (0, false));
        assert_eq!(dict.get("Hello").unwrap(), Mixed::from(10));
        assert_eq!(dict.insert("Goodbye", "cruel world").unwrap(), (1, true));
        assert_eq!(dict.size().unwrap(), 2);
        assert_eq!(
            dict.to_vec().unwrap(),
            vec![
                (Mixed::from("Hello"), Mixed::from(10)),
                (Mixed::from("Goodbye"), Mixed::from("cruel world")),
            ]
        );
        assert!(matches!(
            dict.get("Missing"),
            Err(CoreError::DictionaryKeyNotFound { .. })
        ));

        let mut other = dict.try_clone().unwrap();
        assert_eq!(other, dict);
        dict.clear().unwrap();
        assert_eq!(dict.size().unwrap(), 0);
        assert_eq!(other.size().unwrap(), 2);
        assert_eq!(other.get("Goodbye").unwrap(), Mixed::from("cruel world"));

        other.insert("Goodbye", 100.0).unwrap();
        assert_eq!(other.get("Goodbye").unwrap(), Mixed::from(100.0));
        assert!(other.erase("Goodbye").unwrap());
        assert_eq!(other.size().unwrap(), 1);
        assert!(!other.erase("Goodbye").unwrap());
        assert_ne!(other, dict);
    }

    #[test]
    fn clear_keeps_storage() {
        let mut dict = Dictionary::new();
        dict.insert(1, 1).unwrap();
        dict.clear().unwrap();
        assert!(dict.is_attached().unwrap());
        dict.insert(2, 2).unwrap();
        assert_eq!(dict.get_pair(0).unwrap(), (Mixed::from(2), Mixed::from(2)));
    }

    #[test]
    fn entry_auto_vivifies() {
        let mut dict = Dictionary::new();
        {
            let entry = dict.entry("missing").unwrap();
            assert_eq!(entry.get().unwrap(), Mixed::Null);
        }
        assert_eq!(dict.size().unwrap(), 1);
        dict.entry("missing").unwrap().set(5).unwrap();
        assert_eq!(dict.get("missing").unwrap(), Mixed::from(5));
        assert_eq!(dict.size().unwrap(), 1);
    }

    #[test]
    fn erase_preserves_order() {
        let mut dict = Dictionary::new();
        for i in 0..50 {
            dict.insert(i, i * 2).unwrap();
        }
        for i in (0..50).step_by(3) {
            dict.erase(i).unwrap();
        }
        let keys: Vec<i64> = dict
            .to_vec()
            .unwrap()
            .into_iter()
            .filter_map(|(k, _)| k.as_int())
            .collect();
        let expected: Vec<i64> = (0..50).filter(|i| i % 3 != 0).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn distinct_kinds_are_distinct_keys() {
        let mut dict = Dictionary::new();
        dict.insert(1, "int").unwrap();
        dict.insert(1.0, "double").unwrap();
        dict.insert(Mixed::Null, "null").unwrap();
        assert_eq!(dict.size().unwrap(), 3);
        assert_eq!(dict.get(1.0).unwrap(), Mixed::from("double"));
    }

    /// Anchor holding both roots in a slot list below a root cell.
    fn anchored() -> (Arc<Allocator>, Arc<RootCell>, Arc<SlotLink>) {
        let alloc = Arc::new(Allocator::new());
        let holder = alloc.alloc(Block::Slots(vec![Slot::Null, Slot::Null]));
        let cell = RootCell::new(holder);
        let link = Arc::new(SlotLink::new(Arc::clone(&alloc), cell.clone(), 0));
        (alloc, cell, link)
    }

    #[test]
    fn attached_handles_see_each_others_writes() {
        let (alloc, _, link) = anchored();
        let mut writer = Dictionary::attached(Arc::clone(&alloc), link.clone(), 4);
        let reader = ConstDictionary::attached(Arc::clone(&alloc), link.clone(), 4);
        assert!(!reader.is_attached().unwrap());

        writer.insert("a", 1).unwrap();
        assert_eq!(reader.get("a").unwrap(), Mixed::from(1));
        for i in 0..20 {
            writer.insert(i, i).unwrap();
        }
        assert_eq!(reader.size().unwrap(), 21);
        assert!(reader.equals(&writer).unwrap());

        writer.destroy().unwrap();
        assert!(!reader.is_attached().unwrap());
        assert_eq!(link.get_child_ref(0).unwrap(), Ref::NULL);
    }

    #[test]
    fn round_trip_through_commit() {
        let (alloc, cell, link) = anchored();
        let mut dict = Dictionary::attached(Arc::clone(&alloc), link.clone(), 4);
        for i in 0..10 {
            dict.insert(format!("k{i}"), i).unwrap();
        }
        alloc.commit(Version::new(1));
        let committed = *cell.root.lock();

        dict.insert("late", true).unwrap();
        assert_ne!(*cell.root.lock(), committed);

        let old_link = Arc::new(SlotLink::new(
            Arc::clone(&alloc),
            RootCell::new(committed),
            0,
        ));
        let old = ConstDictionary::attached(Arc::clone(&alloc), old_link, 4);
        assert_eq!(old.size().unwrap(), 10);
        assert_eq!(old.get("k3").unwrap(), Mixed::from(3));
        assert!(!old.contains(&Mixed::from("late")).unwrap());
        assert_eq!(dict.size().unwrap(), 11);
    }

    #[test]
    fn read_only_anchor_refuses_writes() {
        let (alloc, cell, link) = anchored();
        let mut dict = Dictionary::attached(Arc::clone(&alloc), link, 4);
        dict.insert("a", 1).unwrap();
        alloc.commit(Version::new(1));
        *cell.writable.lock() = false;
        assert!(matches!(dict.insert("b", 2), Err(CoreError::ReadOnly)));
        assert!(matches!(dict.clear(), Err(CoreError::ReadOnly)));
        assert_eq!(dict.size().unwrap(), 1);
    }
}
