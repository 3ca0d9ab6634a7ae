//! Database handle and transactions.
//!
//! One writer at a time, any number of readers. A reader pins the committed
//! version it started at; the writer builds the next version beside it through
//! copy-on-write, so nothing a reader can reach is ever changed in place.
//!
//! Both kinds of transaction own a context that holds their top reference.
//! Every group, table and dictionary handle resolves through that context,
//! which is how a handle notices that its transaction moved to a newer
//! version or ended.

use crate::alloc::{Allocator, ParentLink, Ref};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::persist::NodeLog;
use crate::table::{Group, Table};
use crate::types::Version;
use arbor_storage::{FileBackend, StorageBackend};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
    Ended,
}

#[derive(Debug)]
struct CtxState {
    top: Ref,
    version: Version,
    mode: Mode,
}

/// Root of every handle opened inside one transaction.
struct TxnContext {
    state: Mutex<CtxState>,
}

impl TxnContext {
    fn new(top: Ref, version: Version, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CtxState { top, version, mode }),
        })
    }

    fn top(&self) -> Ref {
        self.state.lock().top
    }

    fn set_mode(&self, mode: Mode) {
        self.state.lock().mode = mode;
    }

    fn move_to(&self, top: Ref, version: Version) {
        let mut state = self.state.lock();
        state.top = top;
        state.version = version;
    }
}

impl ParentLink for TxnContext {
    fn get_child_ref(&self, _ndx: usize) -> CoreResult<Ref> {
        let state = self.state.lock();
        if state.mode == Mode::Ended {
            return Err(CoreError::TransactionEnded);
        }
        Ok(state.top)
    }

    fn update_child_ref(&self, _ndx: usize, new_ref: Ref) -> CoreResult<()> {
        let mut state = self.state.lock();
        match state.mode {
            Mode::Write => {
                state.top = new_ref;
                Ok(())
            }
            Mode::Read => Err(CoreError::ReadOnly),
            Mode::Ended => Err(CoreError::TransactionEnded),
        }
    }

    fn check_writable(&self) -> CoreResult<()> {
        match self.state.lock().mode {
            Mode::Write => Ok(()),
            Mode::Read => Err(CoreError::ReadOnly),
            Mode::Ended => Err(CoreError::TransactionEnded),
        }
    }
}

struct Shared {
    alloc: Arc<Allocator>,
    config: Arc<Config>,
    committed: RwLock<(Ref, Version)>,
    write_lock: Mutex<()>,
    readers: Mutex<BTreeMap<Version, usize>>,
    log: Mutex<Option<NodeLog>>,
}

impl Shared {
    fn register_reader(&self, version: Version) {
        *self.readers.lock().entry(version).or_insert(0) += 1;
    }

    fn unregister_reader(&self, version: Version) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&version);
            }
        }
    }

    /// Registers a reader at the latest committed version. The version is
    /// pinned before a commit can publish past it and reclaim its blocks.
    fn pin_committed(&self) -> (Ref, Version) {
        let committed = self.committed.read();
        self.register_reader(committed.1);
        *committed
    }

    fn oldest_reader(&self) -> Option<Version> {
        self.readers.lock().keys().next().copied()
    }

    fn group(&self, ctx: &Arc<TxnContext>) -> Group {
        Group::new(Arc::clone(&self.alloc), Arc::clone(&self.config), ctx.clone())
    }
}

/// An open database.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open_in_memory(Config::default())?;
/// let wt = db.begin_write()?;
/// let people = wt.group().add_table("people")?;
/// let name = people.add_column("name", ColumnType::String, false)?;
/// let key = people.create_object()?;
/// people.set(key, name, "Ada")?;
/// wt.commit()?;
///
/// let rt = db.begin_read()?;
/// assert_eq!(rt.table("people")?.size()?, 1);
/// ```
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("version", &self.committed_version())
            .field("blocks", &self.shared.alloc.block_count())
            .finish_non_exhaustive()
    }
}

impl Database {
    fn with_parts(
        config: Config,
        alloc: Allocator,
        top: Ref,
        version: Version,
        log: Option<NodeLog>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                alloc: Arc::new(alloc),
                config: Arc::new(config),
                committed: RwLock::new((top, version)),
                write_lock: Mutex::new(()),
                readers: Mutex::new(BTreeMap::new()),
                log: Mutex::new(log),
            }),
        }
    }

    /// Opens a database that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for an invalid configuration.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        config.validate()?;
        let alloc = Allocator::new();
        let top = Group::create_top(&alloc);
        alloc.commit(Version::new(0));
        Ok(Self::with_parts(config, alloc, top, Version::new(0), None))
    }

    /// Opens a database persisted in `backend`, recovering its last commit.
    ///
    /// # Errors
    ///
    /// Fails for an invalid configuration, a backend error, or a log whose
    /// last commit cannot be rebuilt.
    pub fn open(config: Config, backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        config.validate()?;
        let mut log = NodeLog::new(backend);
        match log.recover()? {
            Some(recovered) => {
                let alloc = Allocator::with_blocks(recovered.blocks, recovered.next_ref);
                info!(version = %recovered.version, "database opened");
                Ok(Self::with_parts(
                    config,
                    alloc,
                    recovered.top,
                    recovered.version,
                    Some(log),
                ))
            }
            None => {
                let alloc = Allocator::new();
                let top = Group::create_top(&alloc);
                let version = Version::new(0);
                log.append_commit(
                    &alloc.pending_blocks(),
                    top,
                    version,
                    alloc.next_ref(),
                    config.sync_on_commit,
                )?;
                alloc.commit(version);
                info!("database created");
                Ok(Self::with_parts(config, alloc, top, version, Some(log)))
            }
        }
    }

    /// Opens or creates a database in the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or locked, or recovery fails.
    pub fn open_file(config: Config, path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(config, Box::new(backend))
    }

    /// The configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The shared allocator.
    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.shared.alloc
    }

    /// Latest committed version.
    #[must_use]
    pub fn committed_version(&self) -> Version {
        self.shared.committed.read().1
    }

    /// Starts a read transaction on the latest committed version.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for symmetry with writes.
    pub fn begin_read(&self) -> CoreResult<ReadTransaction> {
        let (top, version) = self.shared.pin_committed();
        let ctx = TxnContext::new(top, version, Mode::Read);
        Ok(ReadTransaction::from_parts(Arc::clone(&self.shared), ctx, version))
    }

    /// Starts the write transaction, waiting for the running one to end.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for symmetry with reads.
    pub fn begin_write(&self) -> CoreResult<WriteTransaction<'_>> {
        let guard = self.shared.write_lock.lock();
        let (top, version) = *self.shared.committed.read();
        let ctx = TxnContext::new(top, version, Mode::Write);
        let group = self.shared.group(&ctx);
        debug!(base = %version, "write transaction started");
        Ok(WriteTransaction {
            db: self,
            ctx,
            group,
            base: version,
            _guard: guard,
            done: false,
        })
    }

    /// Drops retired blocks that no live reader can reach. Returns how many
    /// were dropped.
    pub fn reclaim(&self) -> usize {
        self.shared.alloc.reclaim(self.shared.oldest_reader())
    }

    /// Versions currently pinned by readers, oldest first.
    #[must_use]
    pub fn pinned_versions(&self) -> Vec<Version> {
        self.shared.readers.lock().keys().copied().collect()
    }
}

/// A read-only view of one committed version.
pub struct ReadTransaction {
    shared: Arc<Shared>,
    ctx: Arc<TxnContext>,
    group: Group,
    version: Version,
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ReadTransaction {
    /// Wraps a context whose reader registration the caller already made.
    fn from_parts(shared: Arc<Shared>, ctx: Arc<TxnContext>, version: Version) -> Self {
        let group = shared.group(&ctx);
        Self {
            shared,
            ctx,
            group,
            version,
        }
    }

    /// Version the transaction reads.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Tables of this version.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Table named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableNotFound`] if no such table exists.
    pub fn table(&self, name: &str) -> CoreResult<Table> {
        self.group.table(name)
    }

    /// Moves to the latest committed version. Returns the new version.
    ///
    /// Handles opened earlier stay valid and see the new version on their
    /// next access.
    pub fn advance_read(&mut self) -> Version {
        let (top, version) = self.shared.pin_committed();
        self.shared.unregister_reader(self.version);
        if version == self.version {
            return version;
        }
        self.ctx.move_to(top, version);
        self.shared.alloc.invalidate();
        debug!(from = %self.version, to = %version, "read transaction advanced");
        self.version = version;
        version
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.ctx.set_mode(Mode::Ended);
        self.shared.unregister_reader(self.version);
    }
}

/// The single write transaction.
///
/// Dropping it without committing rolls it back.
pub struct WriteTransaction<'db> {
    db: &'db Database,
    ctx: Arc<TxnContext>,
    group: Group,
    base: Version,
    _guard: MutexGuard<'db, ()>,
    done: bool,
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl WriteTransaction<'_> {
    /// Tables of the version being built.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Table named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableNotFound`] if no such table exists.
    pub fn table(&self, name: &str) -> CoreResult<Table> {
        self.group.table(name)
    }

    /// Version the transaction started from.
    #[must_use]
    pub fn base_version(&self) -> Version {
        self.base
    }

    /// Logs and publishes the new version. With `keep_reading`, registers a
    /// reader at it before reclaiming.
    fn publish(&mut self, keep_reading: bool) -> CoreResult<Version> {
        let shared = &self.db.shared;
        let top = self.ctx.top();
        let version = self.base.next();

        if let Some(log) = shared.log.lock().as_mut() {
            let blocks = shared.alloc.pending_blocks();
            let logged = log.append_commit(
                &blocks,
                top,
                version,
                shared.alloc.next_ref(),
                shared.config.sync_on_commit,
            );
            if let Err(e) = logged {
                warn!(%version, error = %e, "commit failed, rolling back");
                self.abandon();
                return Err(e);
            }
        }

        shared.alloc.commit(version);
        *shared.committed.write() = (top, version);
        if keep_reading {
            shared.register_reader(version);
        }
        self.done = true;
        if shared.config.reclaim_on_commit {
            shared.alloc.reclaim(shared.oldest_reader());
        }
        debug!(%version, "write transaction committed");
        Ok(version)
    }

    fn abandon(&mut self) {
        self.ctx.set_mode(Mode::Ended);
        self.db.shared.alloc.rollback();
        self.done = true;
    }

    /// Commits and ends the transaction.
    ///
    /// # Errors
    ///
    /// Fails if the commit cannot be logged; the transaction is rolled back
    /// in that case.
    pub fn commit(mut self) -> CoreResult<Version> {
        let version = self.publish(false)?;
        self.ctx.set_mode(Mode::Ended);
        Ok(version)
    }

    /// Commits and keeps the handles opened in this transaction usable as a
    /// read transaction on the new version.
    ///
    /// # Errors
    ///
    /// Fails if the commit cannot be logged; the transaction is rolled back
    /// in that case.
    pub fn commit_and_continue_as_read(mut self) -> CoreResult<ReadTransaction> {
        let version = self.publish(true)?;
        self.ctx.set_mode(Mode::Read);
        self.ctx.move_to(self.ctx.top(), version);
        Ok(ReadTransaction::from_parts(
            Arc::clone(&self.db.shared),
            Arc::clone(&self.ctx),
            version,
        ))
    }

    /// Discards every change.
    pub fn rollback(mut self) {
        self.abandon();
        debug!(base = %self.base, "write transaction rolled back");
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abandon();
            debug!(base = %self.base, "uncommitted write transaction dropped");
        }
    }
}
