//! The backing environment: LMDB through `heed`.
//!
//! One store directory holds one LMDB environment plus an advisory lock
//! file. The environment is opened with `NO_SYNC`: the writer thread
//! decides when to pay for an fsync (at durability points), not every
//! commit.
//!
//! ## Logical Tables
//!
//! | Table    | Key                  | Value                              |
//! |----------|----------------------|------------------------------------|
//! | `values` | address (u64 BE)     | encoded record (see [`crate::wire`]) |
//! | `vroots` | full name bytes      | address (u64 BE)                   |
//! | `caddrs` | content hash (u64 BE)| address list sharing that hash     |
//! | `refcts` | address (u64 BE)     | refcount; absent ⇔ zero, pending GC |
//! | `refct0` | sequence (u64 BE)    | address awaiting collection (FIFO) |
//! | `meta`   | name string          | allocator state (`next_addr`)      |
//!
//! ## Locking
//!
//! LMDB itself would allow a second process to attach to the environment;
//! this store's single-writer design does not. An exclusive lock on
//! `depot.lock` is taken before the environment opens, and a contended
//! lock fails fast with [`DepotError::LockContention`].
//!
//! ## Reader Isolation
//!
//! Read snapshots come straight from LMDB's MVCC: a read transaction pins
//! its view of every table until it ends, and the engine defers physical
//! page reuse until no reader references the page. The writer thread above
//! this module only ever performs logical deletion.

use std::fs::{File, TryLockError};
use std::path::{Path, PathBuf};

use heed::byteorder::BigEndian;
use heed::types::{Bytes, Str, U64};
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};

use crate::error::{DepotError, Result};

const LOCK_FILE: &str = "depot.lock";
const MAX_DBS: u32 = 8;

/// Meta key persisting the address allocator's high-water mark.
pub(crate) const META_NEXT_ADDR: &str = "next_addr";

type AddrKey = U64<BigEndian>;

/// Handles to the logical tables of one environment.
#[derive(Clone, Copy)]
pub(crate) struct Tables {
    pub values: Database<AddrKey, Bytes>,
    pub vroots: Database<Bytes, AddrKey>,
    pub caddrs: Database<AddrKey, Bytes>,
    pub refcts: Database<AddrKey, AddrKey>,
    pub refct0: Database<AddrKey, AddrKey>,
    pub meta: Database<Str, AddrKey>,
}

/// One opened store directory: environment, tables and the exclusive lock.
pub(crate) struct Engine {
    env: Env,
    tables: Tables,
    dir: PathBuf,
    _lock_file: File,
}

impl Engine {
    /// Opens (creating if needed) the environment at `dir`, taking the
    /// exclusive advisory lock first.
    pub(crate) fn open(dir: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let lock_file = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        match lock_file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(DepotError::LockContention(dir.to_path_buf()));
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(MAX_DBS);
        // SAFETY: the exclusive lock above guarantees this process is the
        // only opener of the environment, and every durability point calls
        // `force_sync` explicitly to compensate for NO_SYNC.
        #[allow(unsafe_code)]
        let env = unsafe {
            options.flags(EnvFlags::NO_SYNC);
            options.open(dir)?
        };

        let tables = {
            let mut txn = env.write_txn()?;
            let values = env.create_database::<AddrKey, Bytes>(&mut txn, Some("values"))?;
            let vroots = env.create_database::<Bytes, AddrKey>(&mut txn, Some("vroots"))?;
            let caddrs = env.create_database::<AddrKey, Bytes>(&mut txn, Some("caddrs"))?;
            let refcts = env.create_database::<AddrKey, AddrKey>(&mut txn, Some("refcts"))?;
            let refct0 = env.create_database::<AddrKey, AddrKey>(&mut txn, Some("refct0"))?;
            let meta = env.create_database::<Str, AddrKey>(&mut txn, Some("meta"))?;
            txn.commit()?;
            Tables {
                values,
                vroots,
                caddrs,
                refcts,
                refct0,
                meta,
            }
        };

        Ok(Self {
            env,
            tables,
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Runs `f` inside a read snapshot.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Tables, &RoTxn<'_>) -> Result<T>) -> Result<T> {
        let txn = self.env.read_txn()?;
        let out = f(&self.tables, &txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Begins the writer's mutating transaction.
    pub(crate) fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Flushes buffered pages to stable storage (the durability point).
    pub(crate) fn sync_to_disk(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }
}
