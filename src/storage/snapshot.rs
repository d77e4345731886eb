//! Snapshot payload for hashes with per-field deadlines.
//!
//! Each hash serializes as an encoding tag, a record count, then one record
//! per field: either `(field, value)` or, when the field carries a deadline,
//! `(expire_at_ms, field, value)`. The compact encodings write their runs in
//! stored order, so a reload reproduces the deadline-sorted layout; the
//! table form is a plain record list.
//!
//! Loading never expires anything — fields with past deadlines are restored
//! as stored and reclaimed once normal operation resumes — and every loaded
//! hash with a deadline re-enters the process-wide expiration index under
//! its minimum.

use crate::storage::db::{Db, Value};
use crate::storage::ebuckets::EXPIRE_TIME_INVALID;
use crate::storage::hash::HashValue;
use crate::storage::listpack::{Listpack, ListpackEx, LP_NO_TTL};
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

const TAG_LISTPACK: u8 = 0;
const TAG_LISTPACK_EX: u8 = 1;
const TAG_HT: u8 = 2;

const VAL_HASH: u8 = 0;
const VAL_STR: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot payload")]
    UnexpectedEof,

    #[error("unknown encoding tag: {0:#04x}")]
    BadTag(u8),

    #[error("record carries a deadline inside a no-TTL encoding")]
    DeadlineInPlainEncoding,
}

// --- primitive writers / readers --------------------------------------------

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], SnapshotError> {
    if input.len() < n {
        return Err(SnapshotError::UnexpectedEof);
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn get_u8(input: &mut &[u8]) -> Result<u8, SnapshotError> {
    Ok(take(input, 1)?[0])
}

fn get_u32(input: &mut &[u8]) -> Result<u32, SnapshotError> {
    Ok(u32::from_le_bytes(take(input, 4)?.try_into().unwrap()))
}

fn get_u64(input: &mut &[u8]) -> Result<u64, SnapshotError> {
    Ok(u64::from_le_bytes(take(input, 8)?.try_into().unwrap()))
}

fn get_bytes(input: &mut &[u8]) -> Result<Bytes, SnapshotError> {
    let len = get_u32(input)? as usize;
    Ok(Bytes::copy_from_slice(take(input, len)?))
}

// --- hash payload ------------------------------------------------------------

/// Append one hash's payload to `buf`.
pub fn encode_hash(h: &HashValue, buf: &mut Vec<u8>) {
    let tag = match h {
        HashValue::Listpack(_) => TAG_LISTPACK,
        HashValue::ListpackEx(_) => TAG_LISTPACK_EX,
        HashValue::Ht(_) => TAG_HT,
    };
    buf.push(tag);
    let entries = h.entries();
    put_u32(buf, entries.len() as u32);
    for (field, value, deadline) in entries {
        if deadline == EXPIRE_TIME_INVALID {
            buf.push(0);
        } else {
            buf.push(1);
            put_u64(buf, deadline);
        }
        put_bytes(buf, &field);
        put_bytes(buf, &value);
    }
}

/// Decode one hash's payload. `key` becomes the borrowed key reference of
/// the deadline-capable encodings.
pub fn decode_hash(input: &mut &[u8], key: &Bytes) -> Result<HashValue, SnapshotError> {
    let tag = get_u8(input)?;
    let count = get_u32(input)? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let deadline = match get_u8(input)? {
            0 => None,
            _ => Some(get_u64(input)?),
        };
        let field = get_bytes(input)?;
        let value = get_bytes(input)?;
        records.push((field, value, deadline));
    }

    match tag {
        TAG_LISTPACK => {
            let mut lp = Listpack::new();
            for (f, v, d) in records {
                if d.is_some() {
                    return Err(SnapshotError::DeadlineInPlainEncoding);
                }
                lp.set(f, v);
            }
            Ok(HashValue::Listpack(lp))
        }
        TAG_LISTPACK_EX => {
            let mut lp = ListpackEx::new(key.clone());
            // Ordered insert re-establishes the deadline-sorted layout even
            // if the payload was produced by an older writer.
            for (f, v, d) in records {
                lp.add_new(f, v, d.unwrap_or(LP_NO_TTL));
            }
            Ok(HashValue::ListpackEx(Box::new(lp)))
        }
        TAG_HT => Ok(HashValue::table_from_records(key, records)),
        other => Err(SnapshotError::BadTag(other)),
    }
}

// --- whole-database dump ------------------------------------------------------

/// Serialize every key. Hashes carry their per-field deadlines.
pub fn dump_db(db: &Db) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, val) in db.iter_values() {
        match val {
            Value::Hash(h) => {
                buf.push(VAL_HASH);
                put_bytes(&mut buf, key);
                encode_hash(h, &mut buf);
            }
            Value::Str(s) => {
                buf.push(VAL_STR);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, s);
            }
        }
    }
    buf
}

/// Load a dump produced by [`dump_db`]. Lazy expiration is suppressed for
/// the duration; hashes re-register in the expiration index as they land.
/// Returns the number of keys loaded.
pub fn load_db(db: &mut Db, mut data: &[u8]) -> Result<usize, SnapshotError> {
    db.loading = true;
    let result = (|| {
        let mut loaded = 0;
        while !data.is_empty() {
            let kind = get_u8(&mut data)?;
            let key = get_bytes(&mut data)?;
            let val = match kind {
                VAL_HASH => Value::Hash(decode_hash(&mut data, &key)?),
                VAL_STR => Value::Str(get_bytes(&mut data)?),
                other => return Err(SnapshotError::BadTag(other)),
            };
            db.install_loaded_value(key, val);
            loaded += 1;
        }
        Ok(loaded)
    })();
    db.loading = false;
    if let Ok(n) = result {
        info!(keys = n, "snapshot loaded");
    }
    result
}
