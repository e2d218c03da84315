//! Centralized error handling for Depot.
//!
//! All failure conditions are surfaced as [`DepotError`] values through the
//! crate-wide [`Result`] alias; the library itself never panics (enforced by
//! `#![deny(clippy::panic)]` and `#![deny(clippy::unwrap_used)]`).
//!
//! ## Error Categories
//!
//! - **Parse** ([`DepotError::Parse`]): a stored record could not be decoded,
//!   a cursor ran out of bytes or children, or an isolated parser left
//!   residue. Recoverable inside [`GetCursor::alternative`].
//! - **TypeMismatch** ([`DepotError::TypeMismatch`]): a named root was
//!   re-opened at an incompatible element type.
//! - **StoreFull** ([`DepotError::StoreFull`]): the backing environment
//!   refused a write because its map is exhausted. Sticky: the writer halts
//!   and subsequent operations on the space report the failure.
//! - **LockContention** ([`DepotError::LockContention`]): another process (or
//!   another handle in this process) holds the store's exclusive lock.
//!   Fatal at open.
//! - **InternalInvariant** ([`DepotError::InternalInvariant`]): a refcount
//!   underflow, hash-bucket inconsistency or missing child row. The writer
//!   halts and pending durable commits are failed with this error.
//!
//! Engine and I/O sources are wrapped in `Arc` so that errors stay `Clone`
//! and can be fanned out to every waiter of a failed batch.
//!
//! [`GetCursor::alternative`]: crate::codec::GetCursor::alternative

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// A specialized `Result` type for Depot operations.
pub type Result<T> = std::result::Result<T, DepotError>;

/// The master error enum covering all failure domains in Depot.
#[derive(Debug, Clone)]
pub enum DepotError {
    /// Malformed or truncated serialized data, or an isolated parser that
    /// did not consume exactly its byte/child window.
    Parse(String),

    /// A named root already exists with a different element type.
    TypeMismatch {
        /// The full (prefixed) root name that was being resolved.
        name: String,
    },

    /// The backing environment's map size is exhausted.
    StoreFull,

    /// The store directory is locked by another opener.
    LockContention(PathBuf),

    /// A durable on-disk invariant was found violated. Unrecoverable; the
    /// writer thread halts.
    InternalInvariant(String),

    /// An error reported by the backing LMDB environment.
    Engine(Arc<heed::Error>),

    /// A low-level I/O failure outside the environment (lock file, paths).
    Io(Arc<io::Error>),

    /// The writer thread has shut down or halted; the command was not
    /// accepted. The space's sticky error, when set, is reported instead.
    WriterClosed,
}

impl fmt::Display for DepotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::TypeMismatch { name } => {
                write!(f, "root {name:?} is already open at a different type")
            }
            Self::StoreFull => write!(f, "backing store is full"),
            Self::LockContention(path) => {
                write!(f, "store at {} is locked by another opener", path.display())
            }
            Self::InternalInvariant(msg) => write!(f, "internal invariant violated: {msg}"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::WriterClosed => write!(f, "writer thread is no longer running"),
        }
    }
}

impl std::error::Error for DepotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e.as_ref()),
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<heed::Error> for DepotError {
    fn from(err: heed::Error) -> Self {
        match err {
            heed::Error::Mdb(heed::MdbError::MapFull) => Self::StoreFull,
            other => Self::Engine(Arc::new(other)),
        }
    }
}

impl From<io::Error> for DepotError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
