//! Persistent transactions.
//!
//! A [`Tx`] composes an STM transaction with an append-only log of root
//! writes. Reads and writes of [`RootVar`]s go through the STM cell, so
//! concurrent transactions conflict and retry exactly like plain STM
//! transactions; in addition, every root write appends `(root, value)` to
//! the log. Re-writes of one root within a transaction coalesce; only the
//! last value survives to the log.
//!
//! On commit, the STM validates and commits, then each touched space's
//! writer receives that space's slice of the log. Serialization is lazy:
//! the writer runs the codec, so the committing thread never pays encoding
//! cost, and the writer can batch overlapping writes to one root by
//! keeping only the newest.
//!
//! ## Ordering
//!
//! Each space's commit lock is held around (STM commit + log handoff), and
//! locks are acquired in space-id order, so the writer applies logs in STM
//! commit order and cross-space transactions cannot deadlock. A
//! transaction spanning several spaces commits each space independently:
//! a crash between two spaces' engine commits can leave them mutually
//! inconsistent.
//!
//! ## Durability
//!
//! [`Durability::Relaxed`] returns at STM commit; the write becomes
//! durable at the writer's next sync point. [`Durability::Durable`] blocks
//! until every touched space has committed *and* fsynced the batch holding
//! this log.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use crate::codec::{Codec, PutBuffer};
use crate::error::Result;
use crate::refs::{RootInner, RootVar};
use crate::space::Space;
use crate::stm::{Stm, TVar};
use crate::writer::{Command, PendingPut, RootWrite};

/// Whether a commit waits for the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Return at STM commit; durable after the writer's next sync.
    Relaxed,
    /// Block until the write is fsynced.
    Durable,
}

struct RootPending<T: Codec> {
    value: Arc<T>,
    _root: Arc<RootInner<T>>,
}

impl<T: Codec> PendingPut for RootPending<T> {
    fn encode(&self) -> Result<(Vec<u8>, Vec<u64>)> {
        let mut w = PutBuffer::new();
        self.value.put(&mut w)?;
        let (payload, children, _keepalive) = w.finish();
        Ok((payload, children))
    }
}

struct LogEntry {
    space: Arc<Space>,
    name: Vec<u8>,
    put: Box<dyn PendingPut>,
}

/// An in-flight persistent transaction.
pub struct Tx {
    stm: Stm,
    log: Vec<LogEntry>,
    log_index: HashMap<u64, usize>,
}

impl Tx {
    fn new() -> Self {
        Self {
            stm: Stm::new(),
            log: Vec::new(),
            log_index: HashMap::new(),
        }
    }

    /// Reads a persistent variable.
    pub fn read<T: Codec>(&mut self, var: &RootVar<T>) -> Arc<T> {
        self.stm.read(var.cell())
    }

    /// Writes a persistent variable. The in-memory cell updates at commit;
    /// the durable write follows through the space's writer.
    pub fn write<T: Codec>(&mut self, var: &RootVar<T>, value: T) {
        let value = Arc::new(value);
        self.stm.write(var.cell(), value.clone());
        let entry = LogEntry {
            space: var.space().clone(),
            name: var.name().to_vec(),
            put: Box::new(RootPending {
                value,
                _root: var.inner_arc(),
            }),
        };
        let id = var.cell().id();
        match self.log_index.get(&id) {
            Some(&idx) => self.log[idx] = entry,
            None => {
                self.log_index.insert(id, self.log.len());
                self.log.push(entry);
            }
        }
    }

    /// Reads a non-persistent transactional variable inside this
    /// transaction.
    pub fn read_tvar<V: Clone + Send + Sync + 'static>(&mut self, var: &TVar<V>) -> V {
        self.stm.read(var)
    }

    /// Writes a non-persistent transactional variable inside this
    /// transaction.
    pub fn write_tvar<V: Clone + Send + Sync + 'static>(&mut self, var: &TVar<V>, value: V) {
        self.stm.write(var, value)
    }
}

/// Runs `body` as a transaction, retrying on STM conflicts until it
/// commits. A body error aborts without committing anything.
pub(crate) fn run_tx<R>(
    durability: Durability,
    mut body: impl FnMut(&mut Tx) -> Result<R>,
) -> Result<R> {
    loop {
        let mut tx = Tx::new();
        let out = body(&mut tx)?;
        let Tx { stm, log, .. } = tx;

        if log.is_empty() {
            if stm.commit() {
                return Ok(out);
            }
            continue;
        }

        // Touched spaces, in id order, each locked across the commit point
        // so the writer queue preserves STM commit order.
        let mut spaces: Vec<Arc<Space>> = Vec::new();
        for entry in &log {
            if !spaces.iter().any(|s| s.id() == entry.space.id()) {
                spaces.push(entry.space.clone());
            }
        }
        spaces.sort_by_key(|s| s.id());
        for space in &spaces {
            space.check_fail()?;
        }
        let guards: Vec<_> = spaces.iter().map(|s| s.commit_guard()).collect();

        if !stm.commit() {
            drop(guards);
            continue;
        }

        // The STM state is committed; hand each space its slice of the log.
        let mut waits = Vec::new();
        let mut grouped: Vec<(Arc<Space>, Vec<RootWrite>)> =
            spaces.iter().map(|s| (s.clone(), Vec::new())).collect();
        for entry in log {
            let slot = grouped
                .iter_mut()
                .find(|(s, _)| s.id() == entry.space.id());
            if let Some((_, writes)) = slot {
                writes.push(RootWrite {
                    name: entry.name,
                    put: entry.put,
                });
            }
        }
        for (space, entries) in grouped {
            if entries.is_empty() {
                continue;
            }
            let done = match durability {
                Durability::Durable => {
                    let (done_tx, done_rx) = mpsc::sync_channel(1);
                    waits.push((space.clone(), done_rx));
                    Some(done_tx)
                }
                Durability::Relaxed => None,
            };
            space.send(Command::TxCommit { entries, done })?;
        }
        drop(guards);

        for (space, done_rx) in waits {
            match done_rx.recv() {
                Ok(result) => result?,
                Err(_) => return Err(space.closed_error()),
            }
        }
        return Ok(out);
    }
}
