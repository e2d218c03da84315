//! The public store facade.
//!
//! A [`Depot`] pairs an open [`Space`](crate::space) with a name prefix.
//! The prefix scopes named roots directory-style, so independent
//! sub-applications can share one backing file without name collisions:
//!
//! ```rust,ignore
//! let depot = Depot::open("/var/lib/myapp/depot")?;
//! let metrics = depot.subdir("metrics");
//! let counter = metrics.root_var("requests", || 0u64)?; // full name "metrics/requests"
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{DepotError, Result};
use crate::refs::{RootVar, ValRef};
use crate::space::{Space, SpaceOptions};
use crate::tx::{run_tx, Durability, Tx};
use crate::wire;

/// Row counts of the durable tables, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepotStats {
    /// Stored values (records in the `values` table).
    pub values: u64,
    /// Bound named roots.
    pub named_roots: u64,
    /// Addresses queued for garbage collection.
    pub gc_backlog: u64,
}

/// A handle to an open store: the per-file space plus a root-name prefix.
///
/// Clones and [`Depot::subdir`] derivatives share the same space (same
/// writer, same caches, same file lock); the space shuts down when the
/// last handle (depot, [`ValRef`] or [`RootVar`]) drops.
#[derive(Clone)]
pub struct Depot {
    space: Arc<Space>,
    prefix: Vec<u8>,
}

impl Depot {
    /// Opens (creating if absent) the store directory with default
    /// options.
    ///
    /// Fails with [`DepotError::LockContention`] when the directory is
    /// already open, in this process or any other.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(dir, SpaceOptions::default())
    }

    /// Opens the store directory with explicit options.
    pub fn open_with(dir: impl AsRef<Path>, options: SpaceOptions) -> Result<Self> {
        Ok(Self {
            space: Space::open(dir.as_ref(), options)?,
            prefix: Vec::new(),
        })
    }

    /// A derived handle whose named roots live under `name/`.
    pub fn subdir(&self, name: &str) -> Depot {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(b'/');
        Depot {
            space: self.space.clone(),
            prefix,
        }
    }

    /// The directory backing this store.
    pub fn dir(&self) -> &Path {
        self.space.dir()
    }

    fn full_name(&self, name: &str) -> Vec<u8> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(name.as_bytes());
        full
    }

    /// Stores `value`, returning an immutable reference to it.
    ///
    /// Equal serializations deduplicate: storing a byte-equal value twice
    /// yields references to the same address sharing one cache slot.
    pub fn vref<T: Codec>(&self, value: &T) -> Result<ValRef<T>> {
        self.space.vref_value(value)
    }

    /// Reconstructs a typed reference from a raw address, as previously
    /// obtained from [`ValRef::address`] and persisted elsewhere (a root,
    /// a log, another store).
    ///
    /// The address is not validated here; a dangling or mistyped address
    /// surfaces as a parse error at first load.
    pub fn ref_at<T: Codec>(&self, addr: u64) -> Result<ValRef<T>> {
        if addr == wire::NULL_ADDR {
            return Err(DepotError::Parse("null address has no value".into()));
        }
        self.space.register_ref(addr)
    }

    /// Resolves the named root, creating it with `init` on first use.
    ///
    /// The returned variable shares one STM cell with every other resolver
    /// of the same full name. Re-opening a name at a different element
    /// type fails with [`DepotError::TypeMismatch`].
    pub fn root_var<T: Codec>(&self, name: &str, init: impl FnOnce() -> T) -> Result<RootVar<T>> {
        self.space.resolve_root(self.full_name(name), init)
    }

    /// Unbinds a named root, releasing its value to the collector once
    /// unreferenced.
    pub fn remove_root(&self, name: &str) -> Result<()> {
        self.space.unbind_root(self.full_name(name))
    }

    /// Runs a transaction; returns at STM commit, before the write reaches
    /// disk.
    pub fn transact<R>(&self, body: impl FnMut(&mut Tx) -> Result<R>) -> Result<R> {
        run_tx(Durability::Relaxed, body)
    }

    /// Runs a transaction and blocks until it is fsynced.
    pub fn transact_durable<R>(&self, body: impl FnMut(&mut Tx) -> Result<R>) -> Result<R> {
        run_tx(Durability::Durable, body)
    }

    /// Blocks until every previously submitted write is committed and
    /// synced. One barrier also advances one round of incremental garbage
    /// collection.
    pub fn sync(&self) -> Result<()> {
        self.space.sync_barrier()
    }

    /// Current row counts of the durable tables.
    pub fn stats(&self) -> Result<DepotStats> {
        let (values, named_roots, gc_backlog) = self.space.table_counts()?;
        Ok(DepotStats {
            values,
            named_roots,
            gc_backlog,
        })
    }

    /// True when a committed record exists at `addr`.
    pub fn contains_addr(&self, addr: u64) -> Result<bool> {
        self.space.contains_addr(addr)
    }
}

impl fmt::Debug for Depot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Depot")
            .field("dir", &self.space.dir())
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}
