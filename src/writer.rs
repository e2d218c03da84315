//! The single writer and incremental garbage collector.
//!
//! Exactly one thread per space owns all mutating access to the backing
//! environment. Its command stream carries value writes, transaction logs,
//! root binds and address reservations; everything except reservations is
//! folded into batches, each committed as one engine transaction.
//!
//! ## Batching
//!
//! The writer accumulates commands until the queue momentarily drains, a
//! bounded delay ("tick") elapses, or a durability-requiring item has
//! waited out its short grace window. This amortizes the per-transaction
//! synchronization across bursts while bounding latency.
//!
//! ## Commit Sequence
//!
//! 1. Drain queued commands into an ordered batch.
//! 2. Value writes land in `values`, join their `caddrs` hash bucket, and
//!    contribute refcount ingress for their children.
//! 3. Transaction-log entries run their put-thunks *here* (serialization is
//!    lazy: callers never pay encoding cost), intern the result through the
//!    same dedup path as `vref`, swap the named root and adjust refcounts.
//!    Later writes to the same root within one batch supersede earlier
//!    ones.
//! 4. Addresses whose refcount reached zero join the `refct0` queue.
//! 5. Incremental GC: a bounded number of queue entries are popped;
//!    re-referenced addresses are dropped from the queue, pinned or
//!    in-memory-live addresses are requeued, and the rest are deleted with
//!    their children decremented (possibly enqueueing further zeros).
//! 6. The engine transaction commits. If any batch item requested
//!    durability the environment is fsynced, then waiters are signalled.
//!
//! A map-full condition or an invariant violation (refcount underflow,
//! inconsistent hash bucket, missing child) fails the batch, signals every
//! waiter with the error, records it as the space's sticky failure and
//! halts the thread; later commands are answered with the same error.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use heed::RwTxn;
use tracing::{debug, error};

use crate::codec::ErasedHandle;
use crate::engine::{Engine, Tables, META_NEXT_ADDR};
use crate::ephemeron::RefTable;
use crate::error::{DepotError, Result};
use crate::space::{FailCell, PendingIndex, PinTable};
use crate::wire;

/// A root update whose serialization is deferred to the writer.
pub(crate) trait PendingPut: Send {
    /// Runs the codec, producing `(payload, children)`.
    fn encode(&self) -> Result<(Vec<u8>, Vec<u64>)>;
}

/// One root write carried by a transaction log.
pub(crate) struct RootWrite {
    pub name: Vec<u8>,
    pub put: Box<dyn PendingPut>,
}

/// The writer's command stream.
pub(crate) enum Command {
    /// A freshly allocated value (already registered as pending).
    PutValue {
        addr: u64,
        hash: u64,
        record: Arc<Vec<u8>>,
        keepalive: Vec<ErasedHandle>,
    },
    /// A committed transaction log. `done` is present for durable commits.
    TxCommit {
        entries: Vec<RootWrite>,
        done: Option<SyncSender<Result<()>>>,
    },
    /// Binds `name` to an existing address.
    RootBind {
        name: Vec<u8>,
        addr: u64,
        keepalive: ErasedHandle,
    },
    /// Unbinds `name`, releasing its reference.
    RootUnbind { name: Vec<u8> },
    /// Grants a block of fresh addresses. Answered immediately, outside any
    /// batch.
    ReserveAddrs { count: u64, reply: SyncSender<u64> },
    /// A barrier: answered once every earlier command is committed and
    /// synced.
    Sync { done: SyncSender<Result<()>> },
}

/// Everything the writer thread borrows from its space.
pub(crate) struct WriterCtx {
    pub engine: Arc<Engine>,
    pub refs: Arc<RefTable>,
    pub pins: Arc<PinTable>,
    pub pending: Arc<PendingIndex>,
    pub fail: Arc<FailCell>,
    pub reclaim: Arc<Mutex<()>>,
    pub commit_latency: Duration,
    pub durable_grace: Duration,
    pub cache_budget: Option<u64>,
}

/// Join-on-drop wrapper for the writer thread.
pub(crate) struct WorkerHandle {
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(join: JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.join.take() {
            // Batch keepalives hold the space, so the last space handle can
            // drop on the writer thread itself; it must not join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

enum Work {
    Put {
        addr: u64,
        hash: u64,
        record: Arc<Vec<u8>>,
        _keepalive: Vec<ErasedHandle>,
    },
    Roots {
        entries: Vec<RootWrite>,
        done: Option<SyncSender<Result<()>>>,
    },
    Bind {
        name: Vec<u8>,
        addr: u64,
        _keepalive: ErasedHandle,
    },
    Unbind {
        name: Vec<u8>,
    },
    Barrier {
        done: SyncSender<Result<()>>,
    },
}

struct WriterState {
    next_addr: u64,
    refct0_seq: u64,
    gc_backlog: bool,
    batches: u64,
}

impl WriterState {
    fn boot(ctx: &WriterCtx) -> Result<Self> {
        ctx.engine.read(|tables, txn| {
            let next_addr = tables.meta.get(txn, META_NEXT_ADDR)?.unwrap_or(1).max(1);
            let refct0_seq = match tables.refct0.last(txn)? {
                Some((seq, _)) => seq + 1,
                None => 0,
            };
            let gc_backlog = tables.refct0.first(txn)?.is_some();
            Ok(Self {
                next_addr,
                refct0_seq,
                gc_backlog,
                batches: 0,
            })
        })
    }

    fn next_refct0_seq(&mut self) -> u64 {
        let seq = self.refct0_seq;
        self.refct0_seq += 1;
        seq
    }
}

struct CommitSummary {
    puts: usize,
    roots: usize,
    binds: usize,
    collected: u64,
    gc_popped: usize,
}

/// The writer thread entry point.
pub(crate) fn run(ctx: WriterCtx, rx: Receiver<Command>) {
    let mut state = match WriterState::boot(&ctx) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "writer failed to boot");
            ctx.fail.set(err.clone());
            halted_drain(&rx, err);
            return;
        }
    };

    let mut batch: Vec<Work> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut disconnected = false;

    loop {
        if disconnected && batch.is_empty() {
            break;
        }

        // Wait for work: block indefinitely when fully idle, poll against
        // the tick deadline otherwise.
        let idle = batch.is_empty() && !state.gc_backlog;
        let received = if disconnected {
            None
        } else if idle {
            match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => {
                    disconnected = true;
                    None
                }
            }
        } else {
            let limit = *deadline.get_or_insert_with(|| Instant::now() + ctx.commit_latency);
            let now = Instant::now();
            if now >= limit {
                None
            } else {
                match rx.recv_timeout(limit - now) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        None
                    }
                }
            }
        };

        if let Some(cmd) = received {
            absorb(cmd, &mut batch, &mut deadline, &mut state, &ctx);
        }
        // Opportunistically drain the burst that is already queued.
        while let Ok(cmd) = rx.try_recv() {
            absorb(cmd, &mut batch, &mut deadline, &mut state, &ctx);
        }

        let due = deadline.is_some_and(|limit| Instant::now() >= limit);
        let should_commit = if !batch.is_empty() {
            // The queue just drained (or the tick fired); close the batch.
            true
        } else {
            state.gc_backlog && (due || disconnected)
        };

        if should_commit {
            match commit_batch(&ctx, &mut state, std::mem::take(&mut batch)) {
                Ok(summary) => {
                    state.batches += 1;
                    debug!(
                        batch = state.batches,
                        puts = summary.puts,
                        roots = summary.roots,
                        binds = summary.binds,
                        collected = summary.collected,
                        gc_popped = summary.gc_popped,
                        "batch committed"
                    );
                    deadline = None;
                    ctx.refs.sweep_all(ctx.cache_budget);
                }
                Err(err) => {
                    error!(error = %err, "writer halting after failed batch");
                    ctx.fail.set(err.clone());
                    if !disconnected {
                        halted_drain(&rx, err);
                    }
                    return;
                }
            }
        }
    }
}

fn absorb(
    cmd: Command,
    batch: &mut Vec<Work>,
    deadline: &mut Option<Instant>,
    state: &mut WriterState,
    ctx: &WriterCtx,
) {
    match cmd {
        Command::ReserveAddrs { count, reply } => {
            let start = state.next_addr;
            state.next_addr += count;
            let _ = reply.send(start);
        }
        Command::PutValue {
            addr,
            hash,
            record,
            keepalive,
        } => {
            push_work(
                batch,
                deadline,
                ctx,
                false,
                Work::Put {
                    addr,
                    hash,
                    record,
                    _keepalive: keepalive,
                },
            );
        }
        Command::TxCommit { entries, done } => {
            let durable = done.is_some();
            push_work(batch, deadline, ctx, durable, Work::Roots { entries, done });
        }
        Command::RootBind {
            name,
            addr,
            keepalive,
        } => {
            push_work(
                batch,
                deadline,
                ctx,
                false,
                Work::Bind {
                    name,
                    addr,
                    _keepalive: keepalive,
                },
            );
        }
        Command::RootUnbind { name } => {
            push_work(batch, deadline, ctx, false, Work::Unbind { name });
        }
        Command::Sync { done } => {
            push_work(batch, deadline, ctx, true, Work::Barrier { done });
        }
    }
}

fn push_work(
    batch: &mut Vec<Work>,
    deadline: &mut Option<Instant>,
    ctx: &WriterCtx,
    durable: bool,
    work: Work,
) {
    batch.push(work);
    if deadline.is_none() {
        *deadline = Some(Instant::now() + ctx.commit_latency);
    }
    if durable {
        let grace = Instant::now() + ctx.durable_grace;
        if deadline.is_none_or(|limit| grace < limit) {
            *deadline = Some(grace);
        }
    }
}

/// After a halt: answer every subsequent command with the sticky error
/// until all senders disconnect.
fn halted_drain(rx: &Receiver<Command>, err: DepotError) {
    for cmd in rx.iter() {
        match cmd {
            Command::TxCommit { done: Some(done), .. } => {
                let _ = done.send(Err(err.clone()));
            }
            Command::Sync { done } => {
                let _ = done.send(Err(err.clone()));
            }
            _ => {}
        }
    }
}

fn commit_batch(
    ctx: &WriterCtx,
    state: &mut WriterState,
    works: Vec<Work>,
) -> Result<CommitSummary> {
    let responders: Vec<SyncSender<Result<()>>> = works
        .iter()
        .filter_map(|work| match work {
            Work::Roots {
                done: Some(done), ..
            } => Some(done.clone()),
            Work::Barrier { done } => Some(done.clone()),
            _ => None,
        })
        .collect();
    let outcome = apply_batch(ctx, state, &works, !responders.is_empty());
    // Release the batch (and with it every keepalive handle) before waking
    // any waiter: a waiter may tear the space down as soon as it returns.
    drop(works);
    match &outcome {
        Ok(_) => {
            for done in &responders {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => {
            for done in &responders {
                let _ = done.send(Err(err.clone()));
            }
        }
    }
    outcome
}

fn apply_batch(
    ctx: &WriterCtx,
    state: &mut WriterState,
    works: &[Work],
    durable: bool,
) -> Result<CommitSummary> {
    let tables = *ctx.engine.tables();
    let mut txn = ctx.engine.write_txn()?;
    let mut delta: HashMap<u64, i64> = HashMap::new();
    let mut committed_puts: Vec<(u64, u64)> = Vec::new();
    let mut summary = CommitSummary {
        puts: 0,
        roots: 0,
        binds: 0,
        collected: 0,
        gc_popped: 0,
    };

    // Within one batch, only the last write to a given root is applied.
    let mut last_root_write: HashMap<Vec<u8>, (usize, usize)> = HashMap::new();
    for (w_idx, work) in works.iter().enumerate() {
        if let Work::Roots { entries, .. } = work {
            for (e_idx, entry) in entries.iter().enumerate() {
                last_root_write.insert(entry.name.clone(), (w_idx, e_idx));
            }
        }
    }

    for (w_idx, work) in works.iter().enumerate() {
        match work {
            Work::Put {
                addr,
                hash,
                record,
                _keepalive: _,
            } => {
                tables.values.put(&mut txn, addr, record)?;
                bucket_add(&tables, &mut txn, *hash, *addr)?;
                delta.entry(*addr).or_insert(0);
                for child in wire::decode_children(record)? {
                    *delta.entry(child).or_insert(0) += 1;
                }
                committed_puts.push((*hash, *addr));
                summary.puts += 1;
            }
            Work::Roots { entries, done: _ } => {
                for (e_idx, entry) in entries.iter().enumerate() {
                    if last_root_write.get(&entry.name) != Some(&(w_idx, e_idx)) {
                        continue;
                    }
                    let (payload, children) = entry.put.encode()?;
                    let record = wire::encode_record(&payload, &children);
                    let hash = wire::content_hash(&record);
                    let addr = intern_record(&tables, &mut txn, state, &record, hash, &mut delta)?;
                    swap_root(&tables, &mut txn, &entry.name, addr, &mut delta)?;
                    summary.roots += 1;
                }
            }
            Work::Bind {
                name,
                addr,
                _keepalive: _,
            } => {
                swap_root(&tables, &mut txn, name, *addr, &mut delta)?;
                summary.binds += 1;
            }
            Work::Unbind { name } => {
                let old = tables.vroots.get(&txn, &name[..])?;
                if let Some(old) = old {
                    tables.vroots.delete(&mut txn, &name[..])?;
                    *delta.entry(old).or_insert(0) -= 1;
                }
            }
            Work::Barrier { done: _ } => {}
        }
    }

    apply_refcount_deltas(&tables, &mut txn, state, delta)?;

    // Incremental GC, bounded so its cost stays proportional to the batch.
    // The reclaim lock is held through the engine commit so an adopting
    // vref can never race a deletion.
    let reclaim = ctx.reclaim.lock().unwrap_or_else(|p| p.into_inner());
    let quota = works.len().max(16) * 2;
    let (collected, popped, deferred) = collect_garbage(ctx, &tables, &mut txn, state, quota)?;
    summary.collected = collected;
    summary.gc_popped = popped;

    let backlog_remains = tables.refct0.first(&txn)?.is_some();
    state.gc_backlog = backlog_remains && popped > deferred;

    tables.meta.put(&mut txn, META_NEXT_ADDR, &state.next_addr)?;
    txn.commit()?;
    drop(reclaim);

    ctx.pending.remove_committed(&committed_puts);

    if durable {
        ctx.engine.sync_to_disk()?;
    }
    Ok(summary)
}

fn swap_root(
    tables: &Tables,
    txn: &mut RwTxn<'_>,
    name: &[u8],
    addr: u64,
    delta: &mut HashMap<u64, i64>,
) -> Result<()> {
    let old = tables.vroots.get(txn, name)?;
    if old == Some(addr) {
        return Ok(());
    }
    tables.vroots.put(txn, name, &addr)?;
    *delta.entry(addr).or_insert(0) += 1;
    if let Some(old) = old {
        *delta.entry(old).or_insert(0) -= 1;
    }
    Ok(())
}

/// Interns a record through the content index: an existing byte-equal
/// record's address is reused, otherwise a fresh address is written.
fn intern_record(
    tables: &Tables,
    txn: &mut RwTxn<'_>,
    state: &mut WriterState,
    record: &[u8],
    hash: u64,
    delta: &mut HashMap<u64, i64>,
) -> Result<u64> {
    let candidates = match tables.caddrs.get(txn, &hash)? {
        Some(bucket) => wire::decode_addr_list(bucket)?,
        None => Vec::new(),
    };
    for candidate in candidates {
        let matches = match tables.values.get(txn, &candidate)? {
            Some(stored) => stored == record,
            None => false,
        };
        if matches {
            return Ok(candidate);
        }
    }
    let addr = state.next_addr;
    state.next_addr += 1;
    tables.values.put(txn, &addr, record)?;
    bucket_add(tables, txn, hash, addr)?;
    delta.entry(addr).or_insert(0);
    for child in wire::decode_children(record)? {
        *delta.entry(child).or_insert(0) += 1;
    }
    Ok(addr)
}

fn apply_refcount_deltas(
    tables: &Tables,
    txn: &mut RwTxn<'_>,
    state: &mut WriterState,
    delta: HashMap<u64, i64>,
) -> Result<()> {
    let mut ordered: Vec<(u64, i64)> = delta.into_iter().collect();
    ordered.sort_unstable();
    let mut zeroes: Vec<u64> = Vec::new();
    for (addr, d) in ordered {
        if addr == wire::NULL_ADDR {
            return Err(DepotError::InternalInvariant(
                "null address appeared in a refcount adjustment".into(),
            ));
        }
        let current = tables.refcts.get(txn, &addr)?;
        match current {
            Some(count) => {
                let next = count as i128 + d as i128;
                if next < 0 {
                    return Err(DepotError::InternalInvariant(format!(
                        "refcount underflow at address {addr}"
                    )));
                }
                if next == 0 {
                    tables.refcts.delete(txn, &addr)?;
                    zeroes.push(addr);
                } else {
                    tables.refcts.put(txn, &addr, &(next as u64))?;
                }
            }
            None => {
                if d > 0 {
                    tables.refcts.put(txn, &addr, &(d as u64))?;
                } else if d == 0 {
                    zeroes.push(addr);
                } else {
                    return Err(DepotError::InternalInvariant(format!(
                        "refcount underflow at address {addr}"
                    )));
                }
            }
        }
    }
    for addr in zeroes {
        let seq = state.next_refct0_seq();
        tables.refct0.put(txn, &seq, &addr)?;
    }
    Ok(())
}

/// Pops up to `quota` entries from the zero queue. Returns
/// `(collected, popped, deferred)`.
fn collect_garbage(
    ctx: &WriterCtx,
    tables: &Tables,
    txn: &mut RwTxn<'_>,
    state: &mut WriterState,
    quota: usize,
) -> Result<(u64, usize, usize)> {
    let mut collected = 0u64;
    let mut popped = 0usize;
    let mut deferred = 0usize;

    while popped < quota {
        let head = tables.refct0.first(txn)?;
        let Some((seq, addr)) = head else { break };
        tables.refct0.delete(txn, &seq)?;
        popped += 1;

        // Re-referenced since it was queued.
        if tables.refcts.get(txn, &addr)?.is_some() {
            continue;
        }
        // A live in-process handle (or a mid-adoption pin) defers
        // reclamation.
        if ctx.pins.is_pinned(addr) || ctx.refs.is_live(addr) {
            let seq = state.next_refct0_seq();
            tables.refct0.put(txn, &seq, &addr)?;
            deferred += 1;
            continue;
        }
        let record = match tables.values.get(txn, &addr)? {
            Some(record) => record.to_vec(),
            None => continue,
        };
        for child in wire::decode_children(&record)? {
            let count = tables.refcts.get(txn, &child)?.ok_or_else(|| {
                DepotError::InternalInvariant(format!(
                    "child {child} of reclaimed address {addr} has no refcount"
                ))
            })?;
            if count <= 1 {
                tables.refcts.delete(txn, &child)?;
                let seq = state.next_refct0_seq();
                tables.refct0.put(txn, &seq, &child)?;
            } else {
                tables.refcts.put(txn, &child, &(count - 1))?;
            }
        }
        bucket_remove(tables, txn, wire::content_hash(&record), addr)?;
        tables.values.delete(txn, &addr)?;
        collected += 1;
    }
    Ok((collected, popped, deferred))
}

fn bucket_add(tables: &Tables, txn: &mut RwTxn<'_>, hash: u64, addr: u64) -> Result<()> {
    let mut addrs = match tables.caddrs.get(txn, &hash)? {
        Some(bucket) => wire::decode_addr_list(bucket)?,
        None => Vec::new(),
    };
    addrs.push(addr);
    tables.caddrs.put(txn, &hash, &wire::encode_addr_list(&addrs))?;
    Ok(())
}

fn bucket_remove(tables: &Tables, txn: &mut RwTxn<'_>, hash: u64, addr: u64) -> Result<()> {
    let mut addrs = match tables.caddrs.get(txn, &hash)? {
        Some(bucket) => wire::decode_addr_list(bucket)?,
        None => {
            return Err(DepotError::InternalInvariant(format!(
                "hash bucket {hash:#x} missing while reclaiming address {addr}"
            )))
        }
    };
    let before = addrs.len();
    addrs.retain(|a| *a != addr);
    if addrs.len() == before {
        return Err(DepotError::InternalInvariant(format!(
            "address {addr} missing from hash bucket {hash:#x}"
        )));
    }
    if addrs.is_empty() {
        tables.caddrs.delete(txn, &hash)?;
    } else {
        tables.caddrs.put(txn, &hash, &wire::encode_addr_list(&addrs))?;
    }
    Ok(())
}
