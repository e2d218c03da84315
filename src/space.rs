//! The per-file address space.
//!
//! A [`Space`] is the singleton behind one store directory: the backing
//! environment, the weak handle tables, the in-flight (pending) content
//! index, the pin table the collector honors, the address-block allocator
//! and the channel to the single writer thread.
//!
//! ## Storing a value
//!
//! `vref` runs the value's codec, hashes the encoded record, and probes the
//! content index for an existing byte-equal record: first among pending
//! (not yet committed) writes, then among committed ones through the
//! `caddrs` hash buckets. A hit pins the address, registers a handle and
//! returns it: equal values deduplicate to one address and one shared cache
//! slot. A miss allocates a fresh address, registers the record as pending
//! and enqueues the write.
//!
//! The probe runs under the pending-index lock (so concurrent `vref`s of
//! equal bytes serialize) and the reclaim lock (so the collector cannot
//! delete a candidate between the probe and the pin).
//!
//! ## Loading a value
//!
//! `load_value` consults the reference's cache slot, then the pending
//! index, then a read snapshot of the `values` table, parsing with a
//! full-consumption check and filling the slot with the computed weight.

use std::any::TypeId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use crate::cache::weight_class;
use crate::codec::{Codec, GetCursor, PutBuffer};
use crate::ephemeron::{RefTable, RootTable, SweepEntry};
use crate::engine::Engine;
use crate::error::{DepotError, Result};
use crate::refs::{RefInner, RootInner, RootVar, ValRef};
use crate::stm::TVar;
use crate::wire;
use crate::writer::{self, Command, WorkerHandle, WriterCtx};

/// Addresses handed to this thread's allocator in one writer round trip.
const ADDR_BLOCK: u64 = 256;

static NEXT_SPACE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Tunables for opening a store.
#[derive(Debug, Clone)]
pub struct SpaceOptions {
    /// Maximum size of the backing memory map.
    pub map_size: usize,
    /// How long the writer waits for more work before closing a batch.
    pub commit_latency: Duration,
    /// Grace window granted to batch-mates of a durable commit.
    pub durable_grace: Duration,
    /// Bound of the writer command queue.
    pub queue_capacity: usize,
    /// Soft in-memory budget for cached values, in bytes. When the summed
    /// weight of cached slots exceeds it, the sweep evicts aggressively.
    pub cache_budget: Option<u64>,
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            map_size: 256 * 1024 * 1024,
            commit_latency: Duration::from_millis(5),
            durable_grace: Duration::from_millis(1),
            queue_capacity: 128,
            cache_budget: None,
        }
    }
}

/// Records enqueued to the writer but not yet committed, indexed for dedup
/// (by hash) and for reads (by address).
pub(crate) struct PendingIndex {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
pub(crate) struct PendingInner {
    by_hash: HashMap<u64, Vec<(u64, Arc<Vec<u8>>)>>,
    by_addr: HashMap<u64, Arc<Vec<u8>>>,
}

impl PendingIndex {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner::default()),
        }
    }

    pub(crate) fn locked(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn get_by_addr(&self, addr: u64) -> Option<Arc<Vec<u8>>> {
        self.locked().by_addr.get(&addr).cloned()
    }

    /// Forgets records that reached the committed state.
    pub(crate) fn remove_committed(&self, entries: &[(u64, u64)]) {
        let mut inner = self.locked();
        for (hash, addr) in entries {
            inner.remove(*hash, *addr);
        }
    }
}

impl PendingInner {
    pub(crate) fn find(&self, hash: u64, record: &[u8]) -> Option<u64> {
        let bucket = self.by_hash.get(&hash)?;
        bucket
            .iter()
            .find(|(_, stored)| stored.as_slice() == record)
            .map(|(addr, _)| *addr)
    }

    pub(crate) fn insert(&mut self, hash: u64, addr: u64, record: Arc<Vec<u8>>) {
        self.by_hash
            .entry(hash)
            .or_default()
            .push((addr, record.clone()));
        self.by_addr.insert(addr, record);
    }

    pub(crate) fn remove(&mut self, hash: u64, addr: u64) {
        if let Some(bucket) = self.by_hash.get_mut(&hash) {
            bucket.retain(|(a, _)| *a != addr);
            if bucket.is_empty() {
                self.by_hash.remove(&hash);
            }
        }
        self.by_addr.remove(&addr);
    }
}

/// Transient pins protecting addresses mid-adoption from the collector.
pub(crate) struct PinTable {
    pins: Mutex<HashMap<u64, usize>>,
}

impl PinTable {
    fn new() -> Self {
        Self {
            pins: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pins(&self) -> MutexGuard<'_, HashMap<u64, usize>> {
        self.pins.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn pin(&self, addr: u64) {
        *self.lock_pins().entry(addr).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&self, addr: u64) {
        let mut pins = self.lock_pins();
        if let Some(count) = pins.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&addr);
            }
        }
    }

    pub(crate) fn is_pinned(&self, addr: u64) -> bool {
        self.lock_pins().contains_key(&addr)
    }
}

/// The space's sticky failure: set once by the writer, observed by every
/// subsequent operation.
pub(crate) struct FailCell {
    slot: Mutex<Option<DepotError>>,
}

impl FailCell {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, err: DepotError) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn get(&self) -> Option<DepotError> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

struct AddrBlock {
    next: u64,
    end: u64,
}

/// The shared state behind one store directory. Handles hold it in an
/// `Arc`; the writer thread holds only the components it needs, so the
/// space (and with it the command channel) shuts down when the last handle
/// drops.
pub(crate) struct Space {
    me: Weak<Space>,
    engine: Arc<Engine>,
    refs: Arc<RefTable>,
    roots: Arc<RootTable>,
    pending: Arc<PendingIndex>,
    pins: Arc<PinTable>,
    reclaim: Arc<Mutex<()>>,
    fail: Arc<FailCell>,
    alloc: Mutex<AddrBlock>,
    commit_lock: Mutex<()>,
    id: u64,
    writer_tx: SyncSender<Command>,
    _worker: WorkerHandle,
}

impl Space {
    /// Opens the store directory, spawning its writer thread.
    pub(crate) fn open(dir: &Path, opts: SpaceOptions) -> Result<Arc<Space>> {
        let engine = Arc::new(Engine::open(dir, opts.map_size)?);
        let refs = Arc::new(RefTable::new());
        let roots = Arc::new(RootTable::new());
        let pending = Arc::new(PendingIndex::new());
        let pins = Arc::new(PinTable::new());
        let reclaim = Arc::new(Mutex::new(()));
        let fail = Arc::new(FailCell::new());

        let (writer_tx, writer_rx) = mpsc::sync_channel(opts.queue_capacity.max(1));
        let ctx = WriterCtx {
            engine: engine.clone(),
            refs: refs.clone(),
            pins: pins.clone(),
            pending: pending.clone(),
            fail: fail.clone(),
            reclaim: reclaim.clone(),
            commit_latency: opts.commit_latency,
            durable_grace: opts.durable_grace,
            cache_budget: opts.cache_budget,
        };
        let join = thread::Builder::new()
            .name("depot-writer".into())
            .spawn(move || writer::run(ctx, writer_rx))?;

        Ok(Arc::new_cyclic(|me| Space {
            me: me.clone(),
            engine,
            refs,
            roots,
            pending,
            pins,
            reclaim,
            fail,
            alloc: Mutex::new(AddrBlock { next: 0, end: 0 }),
            commit_lock: Mutex::new(()),
            id: NEXT_SPACE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            writer_tx,
            _worker: WorkerHandle::new(join),
        }))
    }

    fn arc(&self) -> Result<Arc<Space>> {
        self.me.upgrade().ok_or_else(|| {
            DepotError::InternalInvariant("space used during teardown".into())
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn dir(&self) -> &Path {
        self.engine.dir()
    }

    pub(crate) fn ref_table(&self) -> &RefTable {
        &self.refs
    }

    pub(crate) fn root_table(&self) -> &RootTable {
        &self.roots
    }

    pub(crate) fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn check_fail(&self) -> Result<()> {
        match self.fail.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn closed_error(&self) -> DepotError {
        self.fail.get().unwrap_or(DepotError::WriterClosed)
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        self.writer_tx.send(cmd).map_err(|_| self.closed_error())
    }

    /// Stores `value`, deduplicating against byte-equal records.
    pub(crate) fn vref_value<T: Codec>(&self, value: &T) -> Result<ValRef<T>> {
        self.check_fail()?;
        let mut w = PutBuffer::new();
        value.put(&mut w)?;
        let (payload, children, keepalive) = w.finish();
        let record = Arc::new(wire::encode_record(&payload, &children));
        let hash = wire::content_hash(&record);
        let mut keepalive = Some(keepalive);

        loop {
            // Probe under the pending lock (serializes concurrent vrefs of
            // equal bytes) and the reclaim lock (holds the collector off a
            // candidate until it is pinned).
            {
                let pend = self.pending.locked();
                let reclaim = self.reclaim.lock().unwrap_or_else(|p| p.into_inner());
                let found = match pend.find(hash, &record) {
                    Some(addr) => Some(addr),
                    None => self.probe_committed(hash, &record)?,
                };
                if let Some(addr) = found {
                    self.pins.pin(addr);
                    drop(reclaim);
                    drop(pend);
                    let vr = self.register_ref::<T>(addr);
                    self.pins.unpin(addr);
                    return vr;
                }
            }

            // Miss: allocate an address (may round-trip to the writer),
            // then re-check for a racing insert before claiming the hash.
            let addr = self.allocate_addr()?;
            {
                let mut pend = self.pending.locked();
                if pend.find(hash, &record).is_some() {
                    continue;
                }
                pend.insert(hash, addr, record.clone());
            }
            let vr = self.register_ref::<T>(addr)?;
            let keep = keepalive.take().unwrap_or_default();
            if let Err(err) = self.send(Command::PutValue {
                addr,
                hash,
                record: record.clone(),
                keepalive: keep,
            }) {
                self.pending.locked().remove(hash, addr);
                return Err(err);
            }
            return Ok(vr);
        }
    }

    fn probe_committed(&self, hash: u64, record: &[u8]) -> Result<Option<u64>> {
        self.engine.read(|tables, txn| {
            let candidates = match tables.caddrs.get(txn, &hash)? {
                Some(bucket) => wire::decode_addr_list(bucket)?,
                None => return Ok(None),
            };
            for candidate in candidates {
                if let Some(stored) = tables.values.get(txn, &candidate)? {
                    if stored == record {
                        return Ok(Some(candidate));
                    }
                }
            }
            Ok(None)
        })
    }

    fn allocate_addr(&self) -> Result<u64> {
        {
            let mut block = self.alloc.lock().unwrap_or_else(|p| p.into_inner());
            if block.next < block.end {
                let addr = block.next;
                block.next += 1;
                return Ok(addr);
            }
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.send(Command::ReserveAddrs {
            count: ADDR_BLOCK,
            reply: reply_tx,
        })?;
        let start = reply_rx.recv().map_err(|_| self.closed_error())?;
        let mut block = self.alloc.lock().unwrap_or_else(|p| p.into_inner());
        block.next = start + 1;
        block.end = start + ADDR_BLOCK;
        Ok(start)
    }

    /// Returns the (unique) live handle for `(addr, T)`, creating it when
    /// absent.
    pub(crate) fn register_ref<T: Codec>(&self, addr: u64) -> Result<ValRef<T>> {
        let me = self.arc()?;
        let entry = self
            .refs
            .get_or_insert(addr, TypeId::of::<T>(), move || {
                Arc::new(RefInner::<T>::new(addr, me)) as Arc<dyn SweepEntry>
            });
        let inner = entry.into_any().downcast::<RefInner<T>>().map_err(|_| {
            DepotError::InternalInvariant(format!(
                "reference table type confusion at address {addr}"
            ))
        })?;
        Ok(ValRef::from_inner(inner))
    }

    /// Materializes a child reference while parsing a parent record. The
    /// parent's existence keeps the child's refcount positive, so no pin is
    /// needed here.
    pub(crate) fn adopt_child<T: Codec>(&self, addr: u64) -> Result<ValRef<T>> {
        if addr == wire::NULL_ADDR {
            return Err(DepotError::Parse("null address in child list".into()));
        }
        self.register_ref(addr)
    }

    /// Dereferences `inner`: cache slot, then pending record, then a read
    /// snapshot of the backing store.
    pub(crate) fn load_value<T: Codec>(&self, inner: &RefInner<T>) -> Result<Arc<T>> {
        if let Some(value) = inner.slot().get() {
            return Ok(value);
        }
        let addr = inner.addr();
        let (value, weight) = if let Some(record) = self.pending.get_by_addr(addr) {
            self.parse_record::<T>(&record)?
        } else {
            self.engine.read(|tables, txn| {
                let raw = tables.values.get(txn, &addr)?.ok_or_else(|| {
                    DepotError::Parse(format!("no value stored at address {addr}"))
                })?;
                self.parse_record::<T>(raw)
            })?
        };
        let value = Arc::new(value);
        inner.slot().fill(value.clone(), weight);
        Ok(value)
    }

    fn parse_record<T: Codec>(&self, record: &[u8]) -> Result<(T, u8)> {
        let me = self.arc()?;
        let (payload, children) = wire::decode_record(record)?;
        let mut cursor = GetCursor::new(payload, &children, Some(&me));
        let value = T::get(&mut cursor)?;
        cursor.expect_consumed()?;
        Ok((value, weight_class(payload.len(), children.len())))
    }

    /// Resolves (or creates) the named root, guaranteeing one STM cell per
    /// name process-wide.
    pub(crate) fn resolve_root<T: Codec>(
        &self,
        full_name: Vec<u8>,
        init: impl FnOnce() -> T,
    ) -> Result<RootVar<T>> {
        self.check_fail()?;
        let me = self.arc()?;
        let display_name = String::from_utf8_lossy(&full_name).into_owned();
        let entry = self.roots.resolve(&full_name, || {
            let bound = self
                .engine
                .read(|tables, txn| Ok(tables.vroots.get(txn, &full_name[..])?))?;
            let inner: Arc<RootInner<T>> = match bound {
                Some(addr) => {
                    let value = Arc::new(self.load_record_at::<T>(addr)?);
                    Arc::new(RootInner::new(
                        TVar::new(value),
                        full_name.clone(),
                        me.clone(),
                    ))
                }
                None => {
                    let value = Arc::new(init());
                    let vr = self.vref_value::<T>(&value)?;
                    self.send(Command::RootBind {
                        name: full_name.clone(),
                        addr: vr.address(),
                        keepalive: vr.erased_handle(),
                    })?;
                    Arc::new(RootInner::new(TVar::new(value), full_name.clone(), me.clone()))
                }
            };
            Ok(inner as Arc<dyn std::any::Any + Send + Sync>)
        })?;
        let inner = entry
            .downcast::<RootInner<T>>()
            .map_err(|_| DepotError::TypeMismatch { name: display_name })?;
        Ok(RootVar::from_inner(inner))
    }

    fn load_record_at<T: Codec>(&self, addr: u64) -> Result<T> {
        if let Some(record) = self.pending.get_by_addr(addr) {
            return Ok(self.parse_record::<T>(&record)?.0);
        }
        self.engine.read(|tables, txn| {
            let raw = tables
                .values
                .get(txn, &addr)?
                .ok_or_else(|| DepotError::Parse(format!("no value stored at address {addr}")))?;
            Ok(self.parse_record::<T>(raw)?.0)
        })
    }

    /// Unbinds a named root on disk and forgets its in-memory cell.
    pub(crate) fn unbind_root(&self, full_name: Vec<u8>) -> Result<()> {
        self.check_fail()?;
        self.roots.remove(&full_name);
        self.send(Command::RootUnbind { name: full_name })
    }

    /// Blocks until every previously enqueued command is committed (and
    /// synced) or the writer reports failure.
    pub(crate) fn sync_barrier(&self) -> Result<()> {
        self.check_fail()?;
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.send(Command::Sync { done: done_tx })?;
        match done_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Row counts of the durable tables: `(values, vroots, refct0)`.
    pub(crate) fn table_counts(&self) -> Result<(u64, u64, u64)> {
        self.engine.read(|tables, txn| {
            Ok((
                tables.values.len(txn)?,
                tables.vroots.len(txn)?,
                tables.refct0.len(txn)?,
            ))
        })
    }

    /// True when a record exists at `addr` (committed only).
    pub(crate) fn contains_addr(&self, addr: u64) -> Result<bool> {
        self.engine
            .read(|tables, txn| Ok(tables.values.get(txn, &addr)?.is_some()))
    }
}
