//! Test fixtures and helpers.

use arbor_core::{Config, Database};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Name of the node log inside a file fixture's directory.
pub const LOG_FILE: &str = "arbor.log";

/// Configuration with small fanouts so a handful of objects already
/// produces multi-level trees.
#[must_use]
pub fn test_config() -> Config {
    Config::new()
        .node_max(4)
        .dictionary_node_max(4)
        .sync_on_commit(false)
}

/// A test database that cleans up after itself.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    /// Temporary directory (kept alive for file-based databases).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database with [`test_config`].
    #[must_use]
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates a new in-memory test database.
    #[must_use]
    pub fn memory_with(config: Config) -> Self {
        let db = Database::open_in_memory(config.clone()).expect("Failed to create database");
        Self {
            db,
            config,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database in a temporary directory.
    #[must_use]
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config();
        let db = Database::open_file(config.clone(), &temp_dir.path().join(LOG_FILE))
            .expect("Failed to create database");
        Self {
            db,
            config,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the node log path for file-based databases.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join(LOG_FILE))
    }

    /// Closes and reopens the database from its log.
    ///
    /// In-memory databases have nothing to reopen from and are returned
    /// unchanged.
    #[must_use]
    pub fn reopen(self) -> Self {
        let Some(path) = self.path() else {
            return self;
        };
        let Self {
            db,
            config,
            temp_dir,
        } = self;
        drop(db);
        let db = Database::open_file(config.clone(), &path).expect("Failed to reopen database");
        Self {
            db,
            config,
            temp_dir,
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("file fixture has a path");
    f(&test_db.db, &path)
}

/// Common test scenarios.
pub mod scenarios {
    use arbor_core::{ColKey, ColumnType, Database, ObjKey};

    /// Column keys of the table built by [`populate_items`].
    #[derive(Debug, Clone, Copy)]
    pub struct ItemColumns {
        /// Integer column holding the row's ordinal.
        pub value: ColKey,
        /// String column holding `item-{ordinal}`.
        pub label: ColKey,
        /// Dictionary column with one `"ordinal"` entry per row.
        pub attrs: ColKey,
    }

    /// Creates table `name` with `count` objects and commits it.
    pub fn populate_items(db: &Database, name: &str, count: usize) -> (ItemColumns, Vec<ObjKey>) {
        let wt = db.begin_write().expect("Failed to begin write");
        let table = wt.group().add_table(name).expect("Failed to add table");
        let cols = ItemColumns {
            value: table.add_column("value", ColumnType::Int, false).unwrap(),
            label: table.add_column("label", ColumnType::String, true).unwrap(),
            attrs: table
                .add_column("attrs", ColumnType::Dictionary, true)
                .unwrap(),
        };
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let key = table.create_object().unwrap();
            table.set(key, cols.value, i as i64).unwrap();
            table.set(key, cols.label, format!("item-{i}")).unwrap();
            let mut dict = table.dictionary(key, cols.attrs).unwrap();
            dict.insert("ordinal", i as i64).unwrap();
            keys.push(key);
        }
        wt.commit().expect("Failed to commit");
        (cols, keys)
    }

    /// Creates table `name` whose objects form a ring of `len` strong
    /// links (each object owns the next one) and commits it.
    pub fn strong_ring(db: &Database, name: &str, len: usize) -> (ColKey, Vec<ObjKey>) {
        let wt = db.begin_write().expect("Failed to begin write");
        let table = wt.group().add_table(name).expect("Failed to add table");
        let next = table.add_link_column("next", table.key(), true).unwrap();
        let keys: Vec<ObjKey> = (0..len).map(|_| table.create_object().unwrap()).collect();
        for (i, &key) in keys.iter().enumerate() {
            let target = keys[(i + 1) % len];
            table.set_link(key, next, Some(target)).unwrap();
        }
        wt.commit().expect("Failed to commit");
        (next, keys)
    }
}
