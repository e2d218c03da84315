//! # Depot
//!
//! A persistent, content-addressed value store backed by a memory-mapped
//! key-value engine (LMDB), combined with transactionally updated named
//! variables. Depot lets an application manipulate a working set much
//! larger than RAM by transparently paging immutable values from disk on
//! demand, while keeping a bounded in-memory cache with deterministic
//! structure sharing.
//!
//! ## The Two Handles
//!
//! * [`ValRef<T>`], an immutable reference: an opaque, typed handle to a
//!   value stored at a stable 64-bit address. Equal values deduplicate to
//!   the same address, and equal references share one cache slot.
//!   [`ValRef::load`] returns the value, from cache or by reading and
//!   parsing the backing store.
//! * [`RootVar<T>`], a persistent variable: a named, mutable cell whose
//!   current value is shared in memory through a small STM and durably
//!   committed by a single background writer via transactions.
//!
//! ## Architecture
//!
//! ```text
//! caller ──vref──▶ Codec ──▶ content index (dedup) ──▶ writer queue
//!                                                         │ batch
//! caller ◀─load── cache slot ◀── Codec ◀── read snapshot ◀─┘ commit
//! ```
//!
//! Values serialize as `(payload bytes, child references)` with the two
//! streams strictly separated, so garbage collection walks the reference
//! graph without parsing user data. A value's children must exist before
//! it can be stored, which rules out reference cycles among immutable
//! values by construction; mutable [`RootVar`]s may form cycles through
//! names.
//!
//! All mutation funnels through one writer thread per store: it batches
//! queued work into single engine transactions, maintains reference
//! counts, retires unreferenced values incrementally, and signals durable
//! committers after fsync. Readers run against MVCC snapshots and never
//! block on the writer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use depot::{Depot, Blob};
//!
//! # fn main() -> depot::Result<()> {
//! let depot = Depot::open("/tmp/example-depot")?;
//!
//! // Content-addressed immutable values.
//! let big = depot.vref(&Blob(vec![0u8; 1 << 20]))?;
//!
//! // A named, transactional variable holding a reference to the blob.
//! let current = depot.root_var("current", || big.clone())?;
//! depot.transact(|tx| {
//!     let _previous = tx.read(&current);
//!     tx.write(&current, big.clone());
//!     Ok(())
//! })?;
//!
//! // Block until it is on disk.
//! depot.sync()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! Any number of threads may load references, store values and run
//! transactions concurrently. Exactly one writer thread per store owns
//! the backing engine's write transactions; durable commits block on its
//! fsync signal, relaxed commits return at STM commit. A store directory
//! is protected by an exclusive lock: a second open, from this process or
//! another, fails fast.
//!
//! ## Storable Types
//!
//! A type is storable when it implements [`Codec`]: a deterministic
//! `put`/`get` pair subject to the round-trip law (`get(put(v)) ≡ v`,
//! consuming exactly what was produced). Impls are provided for common
//! scalars and containers, for [`ValRef`] itself (values referencing
//! values), for raw byte [`Blob`]s, and for any serde type via
//! [`SerdeBlob`].

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::panic))]

pub mod cache;
pub mod codec;
pub mod error;
pub mod refs;
pub mod stm;
pub mod store;
pub mod tx;
pub mod wire;

mod engine;
mod ephemeron;
mod space;
mod writer;

pub use cache::CachePolicy;
pub use codec::{Blob, Codec, GetCursor, PutBuffer, SerdeBlob};
pub use error::{DepotError, Result};
pub use refs::{RootVar, ValRef};
pub use space::SpaceOptions;
pub use stm::{atomically, Stm, TVar};
pub use store::{Depot, DepotStats};
pub use tx::{Durability, Tx};
