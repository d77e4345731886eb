//! Compact inline hash representations.
//!
//! Small hashes avoid the full table. Two shapes exist:
//!
//! - [`Listpack`]: a flat run of `(field, value)` pairs, used while no field
//!   has a deadline.
//! - [`ListpackEx`]: a run of `(field, value, expire_at)` triples kept
//!   ordered by deadline ascending, with `expire_at == 0` meaning "no TTL"
//!   and sorting after every finite deadline. Because of the ordering, the
//!   head of the run is always the next field to expire, and a whole batch
//!   of due fields is one leading-range delete.
//!
//! Lookup is a linear scan in both shapes; that is the deal these encodings
//! make, and the entry-count / value-length limits keep the scan short.

use crate::storage::ebuckets::{ExpireMeta, EXPIRE_TIME_INVALID};
use bytes::Bytes;

/// Deadline value meaning "no TTL" inside the triple encoding.
pub const LP_NO_TTL: u64 = 0;

/// Appending beyond this total payload size forces the table encoding.
pub const LP_SAFE_APPEND_LIMIT: usize = 1 << 30;

/// Plain pair-encoded hash. No field carries a deadline.
#[derive(Debug, Clone, Default)]
pub struct Listpack {
    entries: Vec<(Bytes, Bytes)>,
}

impl Listpack {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes, for the safe-append bound.
    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|(f, v)| f.len() + v.len()).sum()
    }

    pub fn get(&self, field: &[u8]) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(f, _)| f.as_ref() == field)
            .map(|(_, v)| v)
    }

    /// Insert or overwrite. Returns true on overwrite.
    pub fn set(&mut self, field: Bytes, value: Bytes) -> bool {
        if let Some(slot) = self.entries.iter_mut().find(|(f, _)| *f == field) {
            slot.1 = value;
            true
        } else {
            self.entries.push((field, value));
            false
        }
    }

    pub fn delete(&mut self, field: &[u8]) -> bool {
        if let Some(pos) = self.entries.iter().position(|(f, _)| f.as_ref() == field) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.entries.iter()
    }

    /// Upgrade to the triple encoding: every pair gets a "no TTL" slot and
    /// the whole run lands in the trailing no-TTL region unchanged.
    pub fn into_ex(self, key: Bytes) -> ListpackEx {
        ListpackEx {
            key,
            meta: ExpireMeta::detached(),
            entries: self
                .entries
                .into_iter()
                .map(|(field, value)| TtlEntry { field, value, expire_at: LP_NO_TTL })
                .collect(),
        }
    }
}

/// One `(field, value, expire_at)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlEntry {
    pub field: Bytes,
    pub value: Bytes,
    pub expire_at: u64,
}

impl TtlEntry {
    /// The deadline as the engine sees it: "no TTL" maps to the invalid
    /// sentinel so it compares as infinity.
    pub fn deadline(&self) -> u64 {
        if self.expire_at == LP_NO_TTL {
            EXPIRE_TIME_INVALID
        } else {
            self.expire_at
        }
    }
}

/// TTL-aware compact hash, ordered by deadline ascending.
#[derive(Debug, Clone)]
pub struct ListpackEx {
    /// The key this hash lives under in the keyspace. Kept current by
    /// rename/copy so expiration can address the key without a reverse
    /// lookup.
    pub key: Bytes,
    /// This hash's registration in the process-wide expiration index.
    pub meta: ExpireMeta,
    entries: Vec<TtlEntry>,
}

impl ListpackEx {
    pub fn new(key: Bytes) -> Self {
        Self { key, meta: ExpireMeta::detached(), entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.field.len() + e.value.len()).sum()
    }

    pub fn entries(&self) -> &[TtlEntry] {
        &self.entries
    }

    pub fn get(&self, field: &[u8]) -> Option<&TtlEntry> {
        self.entries.iter().find(|e| e.field.as_ref() == field)
    }

    /// Ordered-insert position: before the first entry with a strictly
    /// larger deadline, with the no-TTL run always last.
    fn insert_pos(&self, expire_at: u64) -> usize {
        if expire_at == LP_NO_TTL {
            return self.entries.len();
        }
        self.entries
            .iter()
            .position(|e| e.expire_at == LP_NO_TTL || e.expire_at > expire_at)
            .unwrap_or(self.entries.len())
    }

    /// Add a field known to be absent, placed by its deadline.
    pub fn add_new(&mut self, field: Bytes, value: Bytes, expire_at: u64) {
        let pos = self.insert_pos(expire_at);
        self.entries.insert(pos, TtlEntry { field, value, expire_at });
    }

    /// Insert or overwrite a field's value. Overwriting clears the TTL
    /// unless `keep_ttl` is set (the field keeps its slot in that case).
    /// Returns true on overwrite.
    pub fn set(&mut self, field: Bytes, value: Bytes, keep_ttl: bool) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.field == field) else {
            self.add_new(field, value, LP_NO_TTL);
            return false;
        };
        self.entries[pos].value = value;
        if !keep_ttl && self.entries[pos].expire_at != LP_NO_TTL {
            self.update_expiry_at(pos, LP_NO_TTL);
        }
        true
    }

    /// Move the entry at `pos` to the position its new deadline dictates.
    fn update_expiry_at(&mut self, pos: usize, expire_at: u64) {
        let mut entry = self.entries.remove(pos);
        entry.expire_at = expire_at;
        let new_pos = self.insert_pos(expire_at);
        self.entries.insert(new_pos, entry);
    }

    /// Re-key an existing field's deadline, preserving the ordering
    /// invariant. Returns false if the field is absent.
    pub fn update_expiry(&mut self, field: &[u8], expire_at: u64) -> bool {
        match self.entries.iter().position(|e| e.field.as_ref() == field) {
            Some(pos) => {
                self.update_expiry_at(pos, expire_at);
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, field: &[u8]) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.field.as_ref() == field) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Minimum finite deadline, or the invalid sentinel if every field is
    /// TTL-less. The ordering invariant makes this the head entry.
    pub fn min_expire(&self) -> u64 {
        match self.entries.first() {
            Some(e) if e.expire_at != LP_NO_TTL => e.expire_at,
            _ => EXPIRE_TIME_INVALID,
        }
    }

    /// Fields in the leading run that are due at `now`.
    pub fn expire_dry_run(&self, now: u64) -> u64 {
        self.entries
            .iter()
            .take_while(|e| e.expire_at != LP_NO_TTL && e.expire_at <= now)
            .count() as u64
    }

    /// Bulk-delete up to `max_items` due fields off the head. Returns the
    /// removed fields (for propagation) and the next finite deadline left,
    /// if any.
    pub fn expire_head(&mut self, now: u64, max_items: u64) -> (Vec<Bytes>, Option<u64>) {
        let mut n = 0usize;
        while n < self.entries.len()
            && (n as u64) < max_items
            && self.entries[n].expire_at != LP_NO_TTL
            && self.entries[n].expire_at <= now
        {
            n += 1;
        }
        let removed = self
            .entries
            .drain(..n)
            .map(|e| e.field)
            .collect();
        let next = match self.min_expire() {
            EXPIRE_TIME_INVALID => None,
            t => Some(t),
        };
        (removed, next)
    }
}
