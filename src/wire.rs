//! Defines the physical layout of stored records.
//!
//! Every value in the store is persisted as one *record* in the `values`
//! table. The payload bytes a codec produced and the addresses of its child
//! references are kept strictly apart so that the garbage collector can walk
//! outgoing references without ever parsing user bytes.
//!
//! ## Record Anatomy
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ varint: payload length                                   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload (opaque codec output, never contains addresses)  │
//! ├──────────────────────────────────────────────────────────┤
//! │ varint: child count                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ Child addresses (8 bytes each, big-endian)               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Addresses are fixed-width big-endian `u64` so the child list supports
//! O(1) indexing and sorts bytewise in address order. The same varint is
//! used for the address lists stored in `caddrs` hash buckets.
//!
//! ## Content Hashing
//!
//! A value's content hash is XxHash64 over the *entire* encoded record
//! (payload and children alike), so two values differing only in their
//! references hash apart. The hash is deterministic and stable across runs;
//! collisions are tolerated because every lookup through a hash bucket
//! re-checks full byte equality before claiming a match.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::{DepotError, Result};

/// The reserved null address. Never assigned to a live value.
pub const NULL_ADDR: u64 = 0;

/// Seed for the content hash. Changing it invalidates every `caddrs` bucket
/// of existing stores, so it is fixed forever.
const CONTENT_HASH_SEED: u64 = 0;

/// Computes the content hash of an encoded record.
pub fn content_hash(record: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(CONTENT_HASH_SEED);
    hasher.write(record);
    hasher.finish()
}

/// Appends a `u64` as a variable-length integer (LEB128, 7 bits per byte).
pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a variable-length integer. Returns `(value, bytes_consumed)`.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err(DepotError::Parse("varint overflow".into()));
        }
    }
    Err(DepotError::Parse("truncated varint".into()))
}

/// Encodes a `(payload, children)` pair into its on-disk record form.
pub fn encode_record(payload: &[u8], children: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + children.len() * 8 + 12);
    encode_varint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    encode_varint(&mut buf, children.len() as u64);
    for addr in children {
        buf.extend_from_slice(&addr.to_be_bytes());
    }
    buf
}

/// Splits a record into its payload slice and child address list.
///
/// Fails if the record is truncated or carries trailing garbage.
pub fn decode_record(data: &[u8]) -> Result<(&[u8], Vec<u64>)> {
    let (payload_len, consumed) = decode_varint(data)?;
    let payload_len = payload_len as usize;
    let rest = data
        .get(consumed..)
        .ok_or_else(|| DepotError::Parse("record header out of bounds".into()))?;
    let payload = rest
        .get(..payload_len)
        .ok_or_else(|| DepotError::Parse("record payload truncated".into()))?;
    let children = decode_addr_list(&rest[payload_len..])?;
    Ok((payload, children))
}

/// Decodes only the child addresses of a record, skipping over the payload.
///
/// This is the parser-free walk the garbage collector relies on.
pub fn decode_children(data: &[u8]) -> Result<Vec<u64>> {
    let (_, children) = decode_record(data)?;
    Ok(children)
}

/// Encodes an address list (`caddrs` bucket value).
pub fn encode_addr_list(addrs: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(addrs.len() * 8 + 2);
    encode_varint(&mut buf, addrs.len() as u64);
    for addr in addrs {
        buf.extend_from_slice(&addr.to_be_bytes());
    }
    buf
}

/// Decodes an address list, rejecting truncation and trailing bytes.
pub fn decode_addr_list(data: &[u8]) -> Result<Vec<u64>> {
    let (count, consumed) = decode_varint(data)?;
    let count = count as usize;
    let body = &data[consumed..];
    if body.len() != count * 8 {
        return Err(DepotError::Parse(format!(
            "address list length mismatch: {} entries declared, {} bytes present",
            count,
            body.len()
        )));
    }
    let mut addrs = Vec::with_capacity(count);
    for chunk in body.chunks_exact(8) {
        let bytes: [u8; 8] = chunk
            .try_into()
            .map_err(|_| DepotError::Parse("invalid address bytes".into()))?;
        addrs.push(u64::from_be_bytes(bytes));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        let samples = [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX];
        for v in samples {
            let mut buf = Vec::new();
            encode_varint(&mut buf, v);
            let (back, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(back, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn record_round_trip() {
        let payload = b"seventeen bytes!!";
        let children = vec![3u64, 9];
        let record = encode_record(payload, &children);
        let (p, c) = decode_record(&record).unwrap();
        assert_eq!(p, payload);
        assert_eq!(c, children);
        assert_eq!(decode_children(&record).unwrap(), children);
    }

    #[test]
    fn record_rejects_trailing_bytes() {
        let mut record = encode_record(b"x", &[7]);
        record.push(0);
        assert!(decode_record(&record).is_err());
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = encode_record(b"hello", &[]);
        let b = encode_record(b"hello", &[1]);
        assert_eq!(content_hash(&a), content_hash(&a));
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
