//! The serialization protocol: how values become `(payload, children)`.
//!
//! A storable type implements [`Codec`], a pair of inverse operations:
//!
//! - [`Codec::put`] appends raw bytes to a [`PutBuffer`] and records child
//!   references *beside* the bytes, never inside them. The two streams stay
//!   strictly disjoint so the garbage collector can walk outgoing references
//!   without parsing user payloads.
//! - [`Codec::get`] is a recursive-descent parser over a [`GetCursor`]: a
//!   bounded byte cursor plus a bounded queue of incoming child addresses.
//!
//! ## The Round-Trip Law
//!
//! For every value `v`: `get(put(v))` must yield a value equivalent to `v`,
//! consuming *exactly* the bytes and children that `put` produced. Every
//! impl in this module is covered by a round-trip test; implement the same
//! property test for your own types.
//!
//! ## Isolation and Alternatives
//!
//! [`GetCursor::isolate`] runs a sub-parser against an exact window of `n`
//! bytes and `k` children and fails unless the window is consumed precisely,
//! which makes composite formats self-delimiting. [`GetCursor::alternative`]
//! makes parse failures recoverable: it snapshots the cursor, tries the
//! first branch, and on a parse failure rewinds and tries the second.
//!
//! ## Provided Impls
//!
//! Fixed-width little-endian scalars, `bool`, `()`, `String`, `Option<T>`,
//! `Vec<T>`, tuples up to arity 3, [`Blob`] (length-prefixed raw bytes),
//! [`ValRef<T>`](crate::ValRef) (a pure child reference: zero payload
//! bytes), and [`SerdeBlob<T>`] which stores any serde type as one opaque
//! bincode leaf.

use std::any::Any;
use std::sync::Arc;

use crate::error::{DepotError, Result};
use crate::refs::ValRef;
use crate::space::Space;
use crate::wire;

/// A strong, type-erased handle kept alive while a write is in flight.
pub(crate) type ErasedHandle = Arc<dyn Any + Send + Sync>;

/// A type that can be stored in a depot.
///
/// `put` and `get` must be deterministic inverses (see the module docs for
/// the round-trip law). `put` is total: it only fails by explicitly
/// returning an error, which aborts the enclosing store operation.
pub trait Codec: Sized + Send + Sync + 'static {
    /// Serializes `self` into payload bytes and child references.
    fn put(&self, w: &mut PutBuffer) -> Result<()>;

    /// Parses a value back out of a payload cursor.
    fn get(r: &mut GetCursor<'_>) -> Result<Self>;
}

/// The write side of the codec: an append-only byte buffer plus an ordered
/// list of child references.
///
/// The buffer grows geometrically; [`PutBuffer::reserve`] requests at least
/// `n` writable bytes ahead of a burst of small appends.
#[derive(Default)]
pub struct PutBuffer {
    bytes: Vec<u8>,
    children: Vec<u64>,
    keepalive: Vec<ErasedHandle>,
}

impl PutBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ensures at least `additional` more bytes can be written without
    /// reallocation.
    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Appends raw payload bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Appends a variable-length unsigned integer (used for all counts and
    /// lengths in the provided impls).
    pub fn put_varint(&mut self, value: u64) {
        wire::encode_varint(&mut self.bytes, value);
    }

    /// Records a child reference.
    ///
    /// The child's address joins the ordered child list, and a strong handle
    /// is retained so the referenced value cannot be reclaimed while this
    /// write is still queued.
    pub fn put_child<T: Codec>(&mut self, child: &ValRef<T>) {
        self.children.push(child.address());
        self.keepalive.push(child.erased_handle());
    }

    /// Number of payload bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when no payload bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of children recorded so far.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn finish(self) -> (Vec<u8>, Vec<u64>, Vec<ErasedHandle>) {
        (self.bytes, self.children, self.keepalive)
    }
}

/// The read side of the codec: a byte cursor bounded by a limit, together
/// with a bounded window of incoming child addresses.
pub struct GetCursor<'a> {
    payload: &'a [u8],
    pos: usize,
    limit: usize,
    children: &'a [u64],
    child_pos: usize,
    child_limit: usize,
    space: Option<&'a Arc<Space>>,
}

impl<'a> GetCursor<'a> {
    pub(crate) fn new(
        payload: &'a [u8],
        children: &'a [u64],
        space: Option<&'a Arc<Space>>,
    ) -> Self {
        Self {
            payload,
            pos: 0,
            limit: payload.len(),
            children,
            child_pos: 0,
            child_limit: children.len(),
            space,
        }
    }

    /// Payload bytes still available inside the current limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Child references still available inside the current window.
    pub fn remaining_children(&self) -> usize {
        self.child_limit - self.child_pos
    }

    /// Consumes exactly `n` payload bytes.
    pub fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DepotError::Parse(format!(
                "input exhausted: wanted {n} bytes, {} available",
                self.remaining()
            )));
        }
        let out = &self.payload[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consumes one byte.
    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    /// Consumes a variable-length unsigned integer.
    pub fn take_varint(&mut self) -> Result<u64> {
        let window = &self.payload[self.pos..self.limit];
        let (value, consumed) = wire::decode_varint(window)?;
        self.pos += consumed;
        Ok(value)
    }

    /// Consumes the next child address, materializing a typed reference.
    ///
    /// The child is *not* loaded; the returned handle pages it in on first
    /// dereference.
    pub fn take_child<T: Codec>(&mut self) -> Result<ValRef<T>> {
        if self.child_pos >= self.child_limit {
            return Err(DepotError::Parse("child list exhausted".into()));
        }
        let addr = self.children[self.child_pos];
        let space = self.space.ok_or_else(|| {
            DepotError::Parse("cursor is not bound to a space; child references unavailable".into())
        })?;
        self.child_pos += 1;
        space.adopt_child::<T>(addr)
    }

    /// Runs `f` against a window of exactly `n` bytes and `k` children.
    ///
    /// Fails with a parse error unless `f` succeeds *and* consumes the
    /// window precisely, with no shortfall and no residue.
    pub fn isolate<T>(
        &mut self,
        n: usize,
        k: usize,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.remaining() < n {
            return Err(DepotError::Parse(format!(
                "isolate window of {n} bytes exceeds remaining input"
            )));
        }
        if self.remaining_children() < k {
            return Err(DepotError::Parse(format!(
                "isolate window of {k} children exceeds remaining child list"
            )));
        }
        let outer = (self.limit, self.child_limit);
        self.limit = self.pos + n;
        self.child_limit = self.child_pos + k;
        let out = f(self);
        let consumed = self.pos == self.limit && self.child_pos == self.child_limit;
        (self.limit, self.child_limit) = outer;
        match out {
            Ok(value) if consumed => Ok(value),
            Ok(_) => Err(DepotError::Parse(
                "isolated parser left residue in its window".into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Tries `first`; on a parse failure, rewinds to the saved state and
    /// tries `second`.
    ///
    /// Only [`DepotError::Parse`] is recoverable here; I/O and engine
    /// errors propagate immediately.
    pub fn alternative<T>(
        &mut self,
        first: impl FnOnce(&mut Self) -> Result<T>,
        second: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = (self.pos, self.child_pos, self.limit, self.child_limit);
        match first(self) {
            Ok(value) => Ok(value),
            Err(DepotError::Parse(_)) => {
                (self.pos, self.child_pos, self.limit, self.child_limit) = saved;
                second(self)
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) fn expect_consumed(&self) -> Result<()> {
        if self.pos != self.limit {
            return Err(DepotError::Parse(format!(
                "{} unconsumed payload bytes after parse",
                self.limit - self.pos
            )));
        }
        if self.child_pos != self.child_limit {
            return Err(DepotError::Parse(format!(
                "{} unconsumed children after parse",
                self.child_limit - self.child_pos
            )));
        }
        Ok(())
    }
}

// --- SCALAR IMPLS ---

macro_rules! impl_scalar_codec {
    ($($t:ty),* $(,)?) => {$(
        impl Codec for $t {
            fn put(&self, w: &mut PutBuffer) -> Result<()> {
                w.put_bytes(&self.to_le_bytes());
                Ok(())
            }

            fn get(r: &mut GetCursor<'_>) -> Result<Self> {
                const N: usize = std::mem::size_of::<$t>();
                let bytes = r.take_bytes(N)?;
                let arr: [u8; N] = bytes
                    .try_into()
                    .map_err(|_| DepotError::Parse("scalar width mismatch".into()))?;
                Ok(<$t>::from_le_bytes(arr))
            }
        }
    )*};
}

impl_scalar_codec!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Codec for bool {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        w.put_u8(*self as u8);
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        match r.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DepotError::Parse(format!("invalid boolean byte {other}"))),
        }
    }
}

impl Codec for () {
    fn put(&self, _w: &mut PutBuffer) -> Result<()> {
        Ok(())
    }

    fn get(_r: &mut GetCursor<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Codec for String {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        w.put_varint(self.len() as u64);
        w.put_bytes(self.as_bytes());
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        let len = r.take_varint()? as usize;
        let bytes = r.take_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DepotError::Parse(format!("invalid UTF-8 in string: {e}")))
    }
}

impl<T: Codec> Codec for Option<T> {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        match self {
            None => {
                w.put_u8(0);
                Ok(())
            }
            Some(value) => {
                w.put_u8(1);
                value.put(w)
            }
        }
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        match r.take_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::get(r)?)),
            other => Err(DepotError::Parse(format!("invalid option tag {other}"))),
        }
    }
}

impl<T: Codec> Codec for Vec<T> {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        w.put_varint(self.len() as u64);
        for item in self {
            item.put(w)?;
        }
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        let count = r.take_varint()? as usize;
        // Guard the preallocation: a corrupt count must not balloon memory.
        let mut items = Vec::with_capacity(count.min(r.remaining().max(1)));
        for _ in 0..count {
            items.push(T::get(r)?);
        }
        Ok(items)
    }
}

impl<A: Codec, B: Codec> Codec for (A, B) {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        self.0.put(w)?;
        self.1.put(w)
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        Ok((A::get(r)?, B::get(r)?))
    }
}

impl<A: Codec, B: Codec, C: Codec> Codec for (A, B, C) {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        self.0.put(w)?;
        self.1.put(w)?;
        self.2.put(w)
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        Ok((A::get(r)?, B::get(r)?, C::get(r)?))
    }
}

/// A length-prefixed chunk of raw bytes.
///
/// The bulk-copy counterpart of `Vec<u8>`'s element-wise impl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Codec for Blob {
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        w.put_varint(self.0.len() as u64);
        w.put_bytes(&self.0);
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        let len = r.take_varint()? as usize;
        Ok(Blob(r.take_bytes(len)?.to_vec()))
    }
}

/// Stores any serde-serializable value as a single opaque bincode leaf.
///
/// The trade against a hand-written [`Codec`] impl: no child references (the
/// whole value is one payload), so large structures neither share structure
/// nor load lazily. Good for leaves, configuration records and test data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerdeBlob<T>(pub T);

impl<T> Codec for SerdeBlob<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn put(&self, w: &mut PutBuffer) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(&self.0, bincode::config::standard())
            .map_err(|e| DepotError::Parse(format!("bincode encode failed: {e}")))?;
        w.put_varint(bytes.len() as u64);
        w.put_bytes(&bytes);
        Ok(())
    }

    fn get(r: &mut GetCursor<'_>) -> Result<Self> {
        let len = r.take_varint()? as usize;
        let bytes = r.take_bytes(len)?;
        let (value, consumed) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DepotError::Parse(format!("bincode decode failed: {e}")))?;
        if consumed != len {
            return Err(DepotError::Parse(
                "bincode leaf left residue in its length prefix".into(),
            ));
        }
        Ok(SerdeBlob(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Codec + PartialEq + std::fmt::Debug>(value: T) {
        let mut w = PutBuffer::new();
        value.put(&mut w).unwrap();
        let (payload, children, _keep) = w.finish();
        assert!(children.is_empty(), "scalar round trips carry no children");
        let mut r = GetCursor::new(&payload, &[], None);
        let back = T::get(&mut r).unwrap();
        r.expect_consumed().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(0u8);
        round_trip(u16::MAX);
        round_trip(123_456u32);
        round_trip(u64::MAX);
        round_trip(-7i8);
        round_trip(i16::MIN);
        round_trip(-1_000_000i32);
        round_trip(i64::MIN);
        round_trip(3.5f32);
        round_trip(-2.25f64);
        round_trip(true);
        round_trip(false);
        round_trip(());
    }

    #[test]
    fn compounds_round_trip() {
        round_trip(String::from("hello depot"));
        round_trip(String::new());
        round_trip(Some(42u64));
        round_trip(Option::<u64>::None);
        round_trip(vec![1u32, 2, 3]);
        round_trip(Vec::<u32>::new());
        round_trip((1u8, String::from("two")));
        round_trip((1u8, 2u16, 3u32));
        round_trip(Blob(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        round_trip(SerdeBlob(vec![(String::from("k"), 9u64)]));
    }

    #[test]
    fn bool_rejects_junk() {
        let payload = [7u8];
        let mut r = GetCursor::new(&payload, &[], None);
        assert!(matches!(bool::get(&mut r), Err(DepotError::Parse(_))));
    }

    #[test]
    fn isolate_demands_exact_consumption() {
        // 17 payload bytes, parsed as one u8 plus a 16-byte tail.
        let payload: Vec<u8> = (0u8..17).collect();
        let mut r = GetCursor::new(&payload, &[], None);
        let out = r
            .isolate(17, 0, |c| {
                let head = c.take_u8()?;
                let tail = c.take_bytes(16)?;
                Ok((head, tail.len()))
            })
            .unwrap();
        assert_eq!(out, (0, 16));
        r.expect_consumed().unwrap();

        // Short window: the parser overruns the limit.
        let mut r = GetCursor::new(&payload, &[], None);
        let err = r.isolate(16, 0, |c| {
            c.take_u8()?;
            c.take_bytes(16).map(|_| ())
        });
        assert!(matches!(err, Err(DepotError::Parse(_))));

        // Wide window: residue is rejected.
        let mut r = GetCursor::new(&payload, &[], None);
        let err = r.isolate(17, 0, |c| c.take_u8().map(|_| ()));
        assert!(matches!(err, Err(DepotError::Parse(_))));
    }

    #[test]
    fn isolate_restores_limits_after_success() {
        let payload = [1u8, 2, 3, 4];
        let mut r = GetCursor::new(&payload, &[], None);
        r.isolate(2, 0, |c| {
            c.take_bytes(2)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.take_bytes(2).unwrap(), &[3, 4]);
    }

    #[test]
    fn alternative_rewinds_on_parse_failure() {
        let payload = [9u8, 7];
        let mut r = GetCursor::new(&payload, &[], None);
        let out = r
            .alternative(
                |c| {
                    c.take_u8()?;
                    Err(DepotError::Parse("wrong branch".into()))
                },
                |c| c.take_bytes(2).map(|b| b.to_vec()),
            )
            .unwrap();
        assert_eq!(out, vec![9, 7]);
        r.expect_consumed().unwrap();
    }

    #[test]
    fn alternative_propagates_hard_errors() {
        let payload = [1u8];
        let mut r = GetCursor::new(&payload, &[], None);
        let err = r.alternative(
            |_| Err(DepotError::StoreFull),
            |c| c.take_u8(),
        );
        assert!(matches!(err, Err(DepotError::StoreFull)));
    }
}
