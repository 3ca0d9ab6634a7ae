//! A plain in-memory reference model of a dictionary.

use crate::generators::DictOp;
use arbor_core::{CoreResult, Dictionary, Mixed};

/// Insertion-ordered key/value list with the same overwrite and erase
/// semantics as [`Dictionary`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictModel {
    entries: Vec<(Mixed, Mixed)>,
}

impl DictModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites; returns the position and whether the key is new.
    pub fn insert(&mut self, key: Mixed, value: Mixed) -> (usize, bool) {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(i) => {
                self.entries[i].1 = value;
                (i, false)
            }
            None => {
                self.entries.push((key, value));
                (self.entries.len() - 1, true)
            }
        }
    }

    /// Removes `key`; returns whether it was present.
    pub fn erase(&mut self, key: &Mixed) -> bool {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &Mixed) -> Option<&Mixed> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the model is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[(Mixed, Mixed)] {
        &self.entries
    }

    /// Applies `op` to both the model and `dict`, asserting that they report
    /// the same outcome.
    ///
    /// # Errors
    ///
    /// Propagates failures from `dict`.
    pub fn apply(&mut self, dict: &mut Dictionary, op: &DictOp) -> CoreResult<()> {
        match op {
            DictOp::Insert(k, v) => {
                let expected = self.insert(k.clone(), v.clone());
                let actual = dict.insert(k.clone(), v.clone())?;
                assert_eq!(actual, expected, "insert {k:?}");
            }
            DictOp::Erase(k) => {
                let expected = self.erase(k);
                let actual = dict.erase(k.clone())?;
                assert_eq!(actual, expected, "erase {k:?}");
            }
            DictOp::Clear => {
                self.clear();
                dict.clear()?;
            }
        }
        Ok(())
    }
}
