//! Database configuration.

use crate::error::{CoreError, CoreResult};

/// Smallest fanout a tree accepts. Below this a split cannot leave both
/// halves at or above the minimum occupancy.
pub const MIN_NODE_MAX: usize = 4;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum rows per cluster leaf and children per inner node.
    pub node_max: usize,

    /// Maximum entries per leaf and children per inner node of the ordered
    /// trees backing dictionaries.
    pub dictionary_node_max: usize,

    /// Whether to sync the storage backend on every commit.
    pub sync_on_commit: bool,

    /// Whether to reclaim retired nodes after each commit.
    pub reclaim_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_max: 256,
            dictionary_node_max: 256,
            sync_on_commit: true,
            reclaim_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cluster fanout.
    #[must_use]
    pub const fn node_max(mut self, value: usize) -> Self {
        self.node_max = value;
        self
    }

    /// Sets the dictionary tree fanout.
    #[must_use]
    pub const fn dictionary_node_max(mut self, value: usize) -> Self {
        self.dictionary_node_max = value;
        self
    }

    /// Sets whether to sync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether to reclaim retired nodes after each commit.
    #[must_use]
    pub const fn reclaim_on_commit(mut self, value: bool) -> Self {
        self.reclaim_on_commit = value;
        self
    }

    /// Minimum occupancy of a non-root cluster node.
    #[must_use]
    pub const fn node_min(&self) -> usize {
        self.node_max / 2
    }

    /// Checks that the fanouts are usable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if a fanout is below
    /// [`MIN_NODE_MAX`].
    pub fn validate(&self) -> CoreResult<()> {
        if self.node_max < MIN_NODE_MAX {
            return Err(CoreError::invalid_operation(format!(
                "node_max {} below minimum {MIN_NODE_MAX}",
                self.node_max
            )));
        }
        if self.dictionary_node_max < MIN_NODE_MAX {
            return Err(CoreError::invalid_operation(format!(
                "dictionary_node_max {} below minimum {MIN_NODE_MAX}",
                self.dictionary_node_max
            )));
        }
        Ok(())
    }
}
