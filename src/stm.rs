//! A minimal optimistic STM over versioned cells.
//!
//! Persistent transactions need an in-process transactional-memory
//! substrate to compose with; this module provides the smallest one that
//! supports them. A [`TVar`] is a versioned cell. A transaction records the
//! version of every cell it reads and stages every write privately; at
//! commit, all recorded versions are validated under a process-wide commit
//! lock and the staged writes are applied with bumped versions. Any
//! validation failure retries the whole transaction body.
//!
//! Reads never block writers and writers never block readers; only the
//! commit point itself is serialized. Within a doomed transaction (one that
//! will fail validation) reads of *different* cells may observe mutually
//! inconsistent values; the commit-time validation rejects such a
//! transaction before its effects or results escape, so transaction bodies
//! must be free of side effects other than through the transaction itself.
//!
//! Non-persistent shared state can participate in the same transaction as
//! persistent variables: build a [`TVar`] and read or write it through the
//! transaction handle.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_TVAR_ID: AtomicU64 = AtomicU64::new(1);
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

struct Versioned<T> {
    version: u64,
    value: T,
}

struct TVarInner<T> {
    id: u64,
    cell: Mutex<Versioned<T>>,
}

impl<T> TVarInner<T> {
    fn lock_cell(&self) -> MutexGuard<'_, Versioned<T>> {
        self.cell.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A transactional variable: a shared, versioned mutable cell.
pub struct TVar<T: Clone + Send + Sync + 'static> {
    inner: Arc<TVarInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TVar<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(TVarInner {
                id: NEXT_TVAR_ID.fetch_add(1, Ordering::Relaxed),
                cell: Mutex::new(Versioned { version: 0, value }),
            }),
        }
    }

    /// Reads the current value outside any transaction.
    pub fn load(&self) -> T {
        self.inner.lock_cell().value.clone()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identity of the underlying cell.
    pub(crate) fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

trait AnyTVar: Send + Sync {
    fn current_version(&self) -> u64;
    fn store_erased(&self, value: Box<dyn Any>);
}

impl<T: Clone + Send + Sync + 'static> AnyTVar for TVarInner<T> {
    fn current_version(&self) -> u64 {
        self.lock_cell().version
    }

    fn store_erased(&self, value: Box<dyn Any>) {
        if let Ok(value) = value.downcast::<T>() {
            let mut cell = self.lock_cell();
            cell.version += 1;
            cell.value = *value;
        }
    }
}

/// An in-flight transaction: a read set of observed versions and a private
/// write set.
#[derive(Default)]
pub struct Stm {
    reads: Vec<(Arc<dyn AnyTVar>, u64)>,
    writes: Vec<(Arc<dyn AnyTVar>, Box<dyn Any>)>,
    write_index: HashMap<u64, usize>,
}

impl Stm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Transactional read. Sees this transaction's own earlier writes.
    pub fn read<T: Clone + Send + Sync + 'static>(&mut self, var: &TVar<T>) -> T {
        if let Some(&idx) = self.write_index.get(&var.inner.id) {
            if let Some(staged) = self.writes[idx].1.downcast_ref::<T>() {
                return staged.clone();
            }
        }
        let cell = var.inner.lock_cell();
        let value = cell.value.clone();
        let version = cell.version;
        drop(cell);
        self.reads
            .push((var.inner.clone() as Arc<dyn AnyTVar>, version));
        value
    }

    /// Transactional write. Staged privately; later reads of the same cell
    /// in this transaction observe it, and re-writes coalesce to the last.
    pub fn write<T: Clone + Send + Sync + 'static>(&mut self, var: &TVar<T>, value: T) {
        let id = var.inner.id;
        match self.write_index.get(&id) {
            Some(&idx) => {
                self.writes[idx].1 = Box::new(value);
            }
            None => {
                self.write_index.insert(id, self.writes.len());
                self.writes
                    .push((var.inner.clone() as Arc<dyn AnyTVar>, Box::new(value)));
            }
        }
    }

    /// Validates the read set and applies the write set atomically.
    /// Returns `false` when a read cell changed since it was observed; the
    /// caller retries.
    pub(crate) fn commit(self) -> bool {
        let _commit = COMMIT_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        for (var, observed) in &self.reads {
            if var.current_version() != *observed {
                return false;
            }
        }
        for (var, value) in self.writes {
            var.store_erased(value);
        }
        true
    }
}

/// Runs `body` in a transaction, retrying until it commits cleanly.
///
/// The body may run several times; it must not have effects outside the
/// transaction.
pub fn atomically<R>(mut body: impl FnMut(&mut Stm) -> R) -> R {
    loop {
        let mut stm = Stm::new();
        let out = body(&mut stm);
        if stm.commit() {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn read_your_writes() {
        let var = TVar::new(1u32);
        atomically(|stm| {
            assert_eq!(stm.read(&var), 1);
            stm.write(&var, 2);
            assert_eq!(stm.read(&var), 2);
        });
        assert_eq!(var.load(), 2);
    }

    #[test]
    fn rewrites_coalesce() {
        let var = TVar::new(0u32);
        atomically(|stm| {
            stm.write(&var, 1);
            stm.write(&var, 2);
            stm.write(&var, 3);
        });
        assert_eq!(var.load(), 3);
    }

    #[test]
    fn concurrent_increments_all_land() {
        let var = TVar::new(0u64);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let var = var.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        atomically(|stm| {
                            let v = stm.read(&var);
                            stm.write(&var, v + 1);
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("increment thread panicked");
        }
        assert_eq!(var.load(), 2000);
    }

    #[test]
    fn conflicting_read_forces_retry() {
        let var = TVar::new(0u32);
        let mut attempts = 0;
        atomically(|stm| {
            attempts += 1;
            let v = stm.read(&var);
            if attempts == 1 {
                // Interfere from outside: the first attempt must not commit.
                atomically(|inner| {
                    let cur = inner.read(&var);
                    inner.write(&var, cur + 10);
                });
            }
            stm.write(&var, v + 1);
        });
        assert!(attempts >= 2);
        assert_eq!(var.load(), 11);
    }
}
