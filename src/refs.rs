//! The two public handle types.
//!
//! - [`ValRef<T>`]: an immutable, typed reference to a content-addressed
//!   value. Cheap to clone, compares by identity, dereferences through an
//!   embedded cache slot ([`ValRef::load`]).
//! - [`RootVar<T>`]: a named, mutable persistent variable whose current
//!   value lives in an STM cell and whose updates flow through
//!   transactions ([`crate::Tx`]).
//!
//! Both handles register themselves in their space's weak tables on
//! creation and prune their entry on drop, which is what makes equal
//! addresses (or equal names) resolve to *the same* cell for as long as
//! any handle is alive.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::cache::{CachePolicy, CacheSlot};
use crate::codec::{Codec, ErasedHandle, GetCursor, PutBuffer};
use crate::ephemeron::SweepEntry;
use crate::error::Result;
use crate::space::Space;
use crate::stm::TVar;

/// An immutable reference to a stored value of type `T`.
///
/// Obtained from [`Depot::vref`](crate::Depot::vref) (which content-
/// addresses and stores the value) or by parsing a stored parent value
/// whose codec consumed it as a child. Two references to the same address
/// at the same type are the same reference: they share one cache slot and
/// compare equal.
///
/// Dropping every clone of a reference does not delete the value; it only
/// releases the in-memory protection. The value is reclaimed once its
/// on-disk refcount is zero *and* no live handle remains.
pub struct ValRef<T: Codec> {
    inner: Arc<RefInner<T>>,
}

pub(crate) struct RefInner<T: Codec> {
    addr: u64,
    slot: CacheSlot<T>,
    space: Arc<Space>,
}

impl<T: Codec> RefInner<T> {
    pub(crate) fn new(addr: u64, space: Arc<Space>) -> Self {
        Self {
            addr,
            slot: CacheSlot::new(),
            space,
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self.addr
    }

    pub(crate) fn slot(&self) -> &CacheSlot<T> {
        &self.slot
    }
}

impl<T: Codec> SweepEntry for RefInner<T> {
    fn sweep(&self, pressure: bool) -> u64 {
        self.slot.sweep(pressure)
    }

    fn cached_weight(&self) -> u64 {
        self.slot.cached_weight()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl<T: Codec> Drop for RefInner<T> {
    fn drop(&mut self) {
        self.space
            .ref_table()
            .remove_dangling(self.addr, TypeId::of::<T>());
    }
}

impl<T: Codec> ValRef<T> {
    pub(crate) fn from_inner(inner: Arc<RefInner<T>>) -> Self {
        Self { inner }
    }

    /// The stable 64-bit address of the referenced value.
    pub fn address(&self) -> u64 {
        self.inner.addr
    }

    /// Dereferences: returns the value, from cache or by reading and
    /// parsing the backing store.
    pub fn load(&self) -> Result<Arc<T>> {
        self.inner.space.load_value(&self.inner)
    }

    /// True when the value is currently held in this reference's cache
    /// slot.
    pub fn is_cached(&self) -> bool {
        self.inner.slot.is_cached()
    }

    /// Changes the cache retention policy of the currently cached value.
    pub fn set_cache_policy(&self, policy: CachePolicy) {
        self.inner.slot.set_policy(policy);
    }

    /// Pins the cached value against eviction until [`Self::cache_unlock`].
    pub fn cache_lock(&self) {
        self.inner.slot.lock_value();
    }

    /// Releases one cache pin.
    pub fn cache_unlock(&self) {
        self.inner.slot.unlock_value();
    }

    pub(crate) fn erased_handle(&self) -> ErasedHandle {
        self.inner.clone()
    }
}

impl<T: Codec> Clone for ValRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Codec> PartialEq for ValRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Codec> Eq for ValRef<T> {}

impl<T: Codec> Hash for ValRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.addr.hash(state);
    }
}

impl<T: Codec> fmt::Debug for ValRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValRef")
            .field("addr", &self.inner.addr)
            .field("cached", &self.inner.slot.is_cached())
            .finish()
    }
}

/// A reference serializes as a pure child: zero payload bytes, one entry
/// in the child list.
impl<T: Codec> Codec for ValRef<T> {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        w.put_child(self);
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        r.take_child()
    }
}

/// A named persistent variable holding a value of type `T`.
///
/// The current value is shared in memory through an STM cell; updates go
/// through [`Tx::write`](crate::Tx::write) and are made durable by the
/// space's writer thread. Two variables resolved under the same full name
/// are the same variable (one cell), and compare equal.
pub struct RootVar<T: Codec> {
    inner: Arc<RootInner<T>>,
}

pub(crate) struct RootInner<T: Codec> {
    cell: TVar<Arc<T>>,
    name: Vec<u8>,
    space: Arc<Space>,
}

impl<T: Codec> RootInner<T> {
    pub(crate) fn new(cell: TVar<Arc<T>>, name: Vec<u8>, space: Arc<Space>) -> Self {
        Self { cell, name, space }
    }
}

impl<T: Codec> Drop for RootInner<T> {
    fn drop(&mut self) {
        self.space.root_table().remove_dangling(&self.name);
    }
}

impl<T: Codec> RootVar<T> {
    pub(crate) fn from_inner(inner: Arc<RootInner<T>>) -> Self {
        Self { inner }
    }

    /// The full (prefix-qualified) name of this variable.
    pub fn name(&self) -> &[u8] {
        &self.inner.name
    }

    /// Reads the current value outside any transaction.
    ///
    /// Equivalent to a single-read transaction; for multi-variable
    /// consistency use [`Depot::transact`](crate::Depot::transact).
    pub fn get(&self) -> Arc<T> {
        self.inner.cell.load()
    }

    pub(crate) fn cell(&self) -> &TVar<Arc<T>> {
        &self.inner.cell
    }

    pub(crate) fn space(&self) -> &Arc<Space> {
        &self.inner.space
    }

    pub(crate) fn inner_arc(&self) -> Arc<RootInner<T>> {
        self.inner.clone()
    }
}

impl<T: Codec> Clone for RootVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Codec> PartialEq for RootVar<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.cell.same_cell(&other.inner.cell)
    }
}

impl<T: Codec> Eq for RootVar<T> {}

impl<T: Codec> fmt::Debug for RootVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootVar")
            .field("name", &String::from_utf8_lossy(&self.inner.name))
            .finish()
    }
}
