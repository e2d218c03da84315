//! Weak in-memory indexes of live handles.
//!
//! Two tables keep the process-wide view of which values and roots are
//! currently held: references are indexed by `(address, type)` and roots by
//! their full name. Entries are weak (their presence never keeps a handle
//! alive) and each handle's destructor prunes its own entry, so the tables
//! track exactly the live population.
//!
//! The tables serve three masters:
//!
//! - **Structure sharing**: resolving an address or name that is already
//!   live returns the existing cell, so equal handles share one cache slot
//!   (or one STM cell) and compare equal by identity.
//! - **Reclamation safety**: the garbage collector consults the reference
//!   table before deleting a zero-refcount address; a live entry defers the
//!   deletion.
//! - **Cache sweeping**: the writer walks the reference table after each
//!   batch to age and evict cache slots.
//!
//! The reference table buckets by address and distinguishes entries by
//! `TypeId`, so two references of different declared types at one address
//! coexist with distinct cells.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::Result;

/// A table entry that can be aged by the cache sweep and recovered at its
/// concrete type.
pub(crate) trait SweepEntry: Send + Sync + 'static {
    /// One sweep step; returns the weight in bytes still cached.
    fn sweep(&self, pressure: bool) -> u64;

    /// Current cached weight in bytes without aging the slot.
    fn cached_weight(&self) -> u64;

    /// Upcast for typed downcasting at lookup time.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type RefBucket = Vec<(TypeId, Weak<dyn SweepEntry>)>;

/// The live-reference index: address → per-type weak entries.
pub(crate) struct RefTable {
    buckets: Mutex<HashMap<u64, RefBucket>>,
}

impl RefTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<u64, RefBucket>> {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the live entry for `(addr, tid)`, creating one with `make`
    /// when absent. The factory runs under the table lock, which is what
    /// guarantees at most one cell per key.
    pub(crate) fn get_or_insert(
        &self,
        addr: u64,
        tid: TypeId,
        make: impl FnOnce() -> Arc<dyn SweepEntry>,
    ) -> Arc<dyn SweepEntry> {
        let mut buckets = self.lock_buckets();
        let bucket = buckets.entry(addr).or_default();
        for (entry_tid, weak) in bucket.iter_mut() {
            if *entry_tid == tid {
                if let Some(live) = weak.upgrade() {
                    return live;
                }
                let fresh = make();
                *weak = Arc::downgrade(&fresh);
                return fresh;
            }
        }
        let fresh = make();
        bucket.push((tid, Arc::downgrade(&fresh)));
        fresh
    }

    /// Drops the `(addr, tid)` entry if its referent is gone. Called from
    /// handle destructors; the dangling check keeps a racing re-register
    /// from being clobbered.
    pub(crate) fn remove_dangling(&self, addr: u64, tid: TypeId) {
        let mut buckets = self.lock_buckets();
        if let Some(bucket) = buckets.get_mut(&addr) {
            bucket.retain(|(entry_tid, weak)| *entry_tid != tid || weak.strong_count() > 0);
            if bucket.is_empty() {
                buckets.remove(&addr);
            }
        }
    }

    /// True when any live reference of any type exists at `addr`.
    pub(crate) fn is_live(&self, addr: u64) -> bool {
        self.lock_buckets()
            .get(&addr)
            .is_some_and(|bucket| bucket.iter().any(|(_, weak)| weak.strong_count() > 0))
    }

    /// Ages every live cache slot once. Dead entries encountered along the
    /// way are pruned. When the summed cached weight exceeds `budget`, a
    /// second pressure pass evicts everything not read since the last
    /// sweep.
    pub(crate) fn sweep_all(&self, budget: Option<u64>) {
        let live: Vec<Arc<dyn SweepEntry>> = {
            let mut buckets = self.lock_buckets();
            buckets.retain(|_, bucket| {
                bucket.retain(|(_, weak)| weak.strong_count() > 0);
                !bucket.is_empty()
            });
            buckets
                .values()
                .flat_map(|bucket| bucket.iter().filter_map(|(_, weak)| weak.upgrade()))
                .collect()
        };
        let mut total: u64 = 0;
        for entry in &live {
            total = total.saturating_add(entry.sweep(false));
        }
        if let Some(limit) = budget {
            if total > limit {
                for entry in &live {
                    entry.sweep(true);
                }
            }
        }
    }

    /// Number of live entries (test support).
    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.lock_buckets()
            .values()
            .map(|b| b.iter().filter(|(_, w)| w.strong_count() > 0).count())
            .sum()
    }
}

/// The live-root index: full name → weak STM cell holder.
pub(crate) struct RootTable {
    cells: Mutex<HashMap<Vec<u8>, Weak<dyn Any + Send + Sync>>>,
}

impl RootTable {
    pub(crate) fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cells(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Weak<dyn Any + Send + Sync>>> {
        self.cells.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the live cell for `name`, creating one with `make` when
    /// absent. Runs `make` under the table lock so a name resolves to at
    /// most one cell process-wide.
    pub(crate) fn resolve(
        &self,
        name: &[u8],
        make: impl FnOnce() -> Result<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        let mut cells = self.lock_cells();
        if let Some(weak) = cells.get(name) {
            if let Some(live) = weak.upgrade() {
                return Ok(live);
            }
        }
        let fresh = make()?;
        cells.insert(name.to_vec(), Arc::downgrade(&fresh));
        Ok(fresh)
    }

    /// Drops the entry for `name` if its referent is gone.
    pub(crate) fn remove_dangling(&self, name: &[u8]) {
        let mut cells = self.lock_cells();
        if let Some(weak) = cells.get(name) {
            if weak.strong_count() == 0 {
                cells.remove(name);
            }
        }
    }

    /// Unconditionally forgets `name` (root unbind).
    pub(crate) fn remove(&self, name: &[u8]) {
        self.lock_cells().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        weight: u64,
    }

    impl SweepEntry for Probe {
        fn sweep(&self, _pressure: bool) -> u64 {
            self.weight
        }

        fn cached_weight(&self) -> u64 {
            self.weight
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn same_key_shares_one_entry() {
        let table = RefTable::new();
        let tid = TypeId::of::<Probe>();
        let first = table.get_or_insert(7, tid, || Arc::new(Probe { weight: 1 }));
        let second = table.get_or_insert(7, tid, || Arc::new(Probe { weight: 2 }));
        assert_eq!(second.cached_weight(), 1);
        assert_eq!(table.live_count(), 1);
        drop((first, second));
        assert!(!table.is_live(7));
    }

    #[test]
    fn distinct_types_get_distinct_entries() {
        struct Other;
        impl SweepEntry for Other {
            fn sweep(&self, _p: bool) -> u64 {
                0
            }
            fn cached_weight(&self) -> u64 {
                0
            }
            fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }
        let table = RefTable::new();
        let a = table.get_or_insert(7, TypeId::of::<Probe>(), || Arc::new(Probe { weight: 1 }));
        let b = table.get_or_insert(7, TypeId::of::<Other>(), || Arc::new(Other));
        assert_eq!(table.live_count(), 2);
        assert!(table.is_live(7));
        drop(a);
        table.remove_dangling(7, TypeId::of::<Probe>());
        assert!(table.is_live(7));
        drop(b);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn root_names_resolve_to_one_cell() {
        let table = RootTable::new();
        let first = table
            .resolve(b"app/counter", || Ok(Arc::new(1u32) as _))
            .unwrap();
        let second = table
            .resolve(b"app/counter", || Ok(Arc::new(2u32) as _))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        drop((first, second));
        table.remove_dangling(b"app/counter");
        let third = table
            .resolve(b"app/counter", || Ok(Arc::new(3u32) as _))
            .unwrap();
        assert_eq!(*third.downcast::<u32>().unwrap(), 3);
    }
}
