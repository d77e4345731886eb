//! Hash value: dual-encoded field collection with per-field deadlines.
//!
//! A hash lives in one of three encodings and moves only forward:
//!
//! ```text
//!   Listpack ──(first deadline)──> ListpackEx ──┐
//!      │                                        ├──(too many / too large)──> Ht
//!      └────────────────────────────────────────┘
//! ```
//!
//! The table encoding itself has two states: plain, and promoted with an
//! expiration header (key reference, private bucket index over fields, and
//! the hash's own registration slot for the process-wide index). Promotion
//! happens in place on the first write that attaches a deadline.
//!
//! Encoding is never visible outside the storage layer except through the
//! serializer and `OBJECT ENCODING`.

use crate::storage::ebuckets::{EBuckets, ExpireAction, ExpireMeta, EXPIRE_TIME_INVALID};
use crate::storage::field::HField;
use crate::storage::listpack::{Listpack, ListpackEx, LP_NO_TTL};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::error;

/// A deadline is past once `now` reaches it. The invalid sentinel compares
/// greater than any clock value, so "no TTL" never expires.
#[inline]
pub fn is_past(deadline: u64, now: u64) -> bool {
    deadline <= now
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Listpack,
    ListpackEx,
    Ht,
}

impl HashEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            HashEncoding::Listpack => "listpack",
            HashEncoding::ListpackEx => "listpackex",
            HashEncoding::Ht => "hashtable",
        }
    }
}

/// Stored entry of the table encoding. The field's name inside [`HField`]
/// shares its buffer with the map key.
#[derive(Debug, Clone)]
pub struct HtEntry {
    pub field: HField,
    pub value: Bytes,
}

/// Expiration header of a promoted table hash.
#[derive(Debug, Clone)]
pub struct HtExpireMeta {
    /// The key this hash lives under in the keyspace.
    pub key: Bytes,
    /// Private index over this hash's deadline-carrying fields.
    pub hfe: EBuckets<Bytes>,
    /// This hash's registration in the process-wide index.
    pub meta: ExpireMeta,
}

/// Table-encoded hash, optionally promoted with an expiration header.
#[derive(Debug, Clone, Default)]
pub struct HtHash {
    fields: HashMap<Bytes, HtEntry>,
    expire_meta: Option<Box<HtExpireMeta>>,
}

/// Flags for plain field writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFlags {
    /// Preserve the existing field's deadline on overwrite (used by the
    /// increment paths). The default overwrite discards it.
    pub keep_ttl: bool,
}

/// Condition on the field itself during set-with-expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSetCond {
    CreateOrOverwrite,
    /// Missing field reports `NoConditionMet`.
    DontCreate,
    /// Missing field reports `NoField` (the expire command family).
    DontCreateReportNoField,
    /// Existing field reports `NoConditionMet`.
    DontOverwrite,
}

/// Condition on the deadline during set-with-expiry. A field without a TTL
/// behaves as if its deadline were infinity: `Gt` can never beat it, `Lt`
/// always does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireSetCond {
    None,
    Nx,
    Xx,
    Gt,
    Lt,
}

/// Per-field outcome of the set-with-expiry protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetExRes {
    NoField,
    NoConditionMet,
    Ok,
    /// New deadline was already past; the field was removed.
    Deleted,
}

impl SetExRes {
    /// Wire code replied per field.
    pub fn code(&self) -> i64 {
        match self {
            SetExRes::NoField => -2,
            SetExRes::NoConditionMet => 0,
            SetExRes::Ok => 1,
            SetExRes::Deleted => 2,
        }
    }
}

/// Per-field outcome of persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistRes {
    NoField,
    NoTtl,
    Ok,
}

impl PersistRes {
    pub fn code(&self) -> i64 {
        match self {
            PersistRes::NoField => -2,
            PersistRes::NoTtl => -1,
            PersistRes::Ok => 1,
        }
    }
}

/// Running state of one set-with-expiry batch (init → apply* → finalize).
#[derive(Debug)]
pub struct SetExState {
    /// The hash's registered minimum when the batch began.
    pub min_expire_before: u64,
    /// Minimum over the previous and new deadlines of every touched field.
    /// If this stays above `min_expire_before`, the batch cannot have moved
    /// the hash's minimum and the global index is left alone.
    pub min_expire_fields: u64,
    pub fields_deleted: u64,
    pub fields_updated: u64,
}

impl SetExState {
    pub fn new(min_expire_before: u64) -> Self {
        Self {
            min_expire_before,
            min_expire_fields: EXPIRE_TIME_INVALID,
            fields_deleted: 0,
            fields_updated: 0,
        }
    }

    fn touch(&mut self, deadline: u64) {
        if self.min_expire_fields > deadline {
            self.min_expire_fields = deadline;
        }
    }

    pub fn changed(&self) -> u64 {
        self.fields_deleted + self.fields_updated
    }
}

/// A hash value in the keyspace.
#[derive(Debug, Clone)]
pub enum HashValue {
    Listpack(Listpack),
    ListpackEx(Box<ListpackEx>),
    Ht(Box<HtHash>),
}

impl HashValue {
    /// Hashes are born tiny and TTL-less.
    pub fn new() -> Self {
        HashValue::Listpack(Listpack::new())
    }

    pub fn encoding(&self) -> HashEncoding {
        match self {
            HashValue::Listpack(_) => HashEncoding::Listpack,
            HashValue::ListpackEx(_) => HashEncoding::ListpackEx,
            HashValue::Ht(_) => HashEncoding::Ht,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HashValue::Listpack(lp) => lp.len(),
            HashValue::ListpackEx(lp) => lp.len(),
            HashValue::Ht(h) => h.fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length with fields already past their deadline subtracted (a dry-run
    /// count; nothing is deleted).
    pub fn len_subtract_expired(&self, now: u64) -> usize {
        match self {
            HashValue::Listpack(lp) => lp.len(),
            HashValue::ListpackEx(lp) => lp.len() - lp.expire_dry_run(now) as usize,
            HashValue::Ht(h) => match &h.expire_meta {
                Some(m) => h.fields.len() - m.hfe.expire_dry_run(now) as usize,
                None => h.fields.len(),
            },
        }
    }

    /// Raw read: value and deadline (invalid sentinel when none). No
    /// expiration logic here; the keyspace layer owns that.
    pub fn get(&self, field: &[u8]) -> Option<(&Bytes, u64)> {
        match self {
            HashValue::Listpack(lp) => lp.get(field).map(|v| (v, EXPIRE_TIME_INVALID)),
            HashValue::ListpackEx(lp) => lp.get(field).map(|e| (&e.value, e.deadline())),
            HashValue::Ht(h) => h
                .fields
                .get(field)
                .map(|e| (&e.value, e.field.expire_time())),
        }
    }

    /// Insert or overwrite a field. Overwrite discards the field's deadline
    /// unless `flags.keep_ttl`. Returns true on overwrite.
    pub fn set(&mut self, field: Bytes, value: Bytes, flags: SetFlags) -> bool {
        match self {
            HashValue::Listpack(lp) => lp.set(field, value),
            HashValue::ListpackEx(lp) => lp.set(field, value, flags.keep_ttl),
            HashValue::Ht(h) => h.set(field, value, flags.keep_ttl),
        }
    }

    /// Remove a field, unlinking it from the private index if linked.
    pub fn delete(&mut self, field: &[u8]) -> bool {
        match self {
            HashValue::Listpack(lp) => lp.delete(field),
            HashValue::ListpackEx(lp) => lp.delete(field),
            HashValue::Ht(h) => h.delete(field),
        }
    }

    /// The deadline this hash is registered under in the process-wide
    /// index, or the invalid sentinel when unlinked.
    pub fn registered_min_expire(&self) -> u64 {
        match self {
            HashValue::Listpack(_) => EXPIRE_TIME_INVALID,
            HashValue::ListpackEx(lp) => lp.meta.expire_time(),
            HashValue::Ht(h) => h
                .expire_meta
                .as_ref()
                .map_or(EXPIRE_TIME_INVALID, |m| m.meta.expire_time()),
        }
    }

    /// Recompute the actual minimum field deadline.
    pub fn next_time_to_expire(&self) -> u64 {
        match self {
            HashValue::Listpack(_) => EXPIRE_TIME_INVALID,
            HashValue::ListpackEx(lp) => lp.min_expire(),
            HashValue::Ht(h) => h
                .expire_meta
                .as_ref()
                .and_then(|m| m.hfe.next_expire_time())
                .unwrap_or(EXPIRE_TIME_INVALID),
        }
    }

    /// Record registration in the process-wide index. Must only be called
    /// on an expiry-capable encoding.
    pub fn mark_registered(&mut self, expire_at: u64) {
        match self {
            HashValue::Listpack(_) => unreachable!("pair encoding cannot be registered"),
            HashValue::ListpackEx(lp) => lp.meta.attach(expire_at),
            HashValue::Ht(h) => h
                .expire_meta
                .as_mut()
                .expect("registering a table hash without an expiration header")
                .meta
                .attach(expire_at),
        }
    }

    /// Record removal from the process-wide index.
    pub fn mark_unregistered(&mut self) {
        match self {
            HashValue::Listpack(_) => {}
            HashValue::ListpackEx(lp) => lp.meta.detach(),
            HashValue::Ht(h) => {
                if let Some(m) = &mut h.expire_meta {
                    m.meta.detach();
                }
            }
        }
    }

    /// Refresh the borrowed key-name reference after a rename or copy.
    pub fn update_key_ref(&mut self, new_key: Bytes) {
        match self {
            HashValue::Listpack(_) => {}
            HashValue::ListpackEx(lp) => lp.key = new_key,
            HashValue::Ht(h) => {
                if let Some(m) = &mut h.expire_meta {
                    m.key = new_key;
                }
            }
        }
    }

    /// Make the encoding capable of carrying deadlines: pairs become
    /// triples; a plain table grows its expiration header in place.
    pub fn prepare_for_expiry(&mut self, key: &Bytes) {
        match self {
            HashValue::Listpack(_) => {
                let HashValue::Listpack(lp) = std::mem::replace(self, HashValue::new()) else {
                    unreachable!()
                };
                *self = HashValue::ListpackEx(Box::new(lp.into_ex(key.clone())));
            }
            HashValue::ListpackEx(_) => {}
            HashValue::Ht(h) => {
                if h.expire_meta.is_none() {
                    h.expire_meta = Some(Box::new(HtExpireMeta {
                        key: key.clone(),
                        hfe: EBuckets::new(),
                        meta: ExpireMeta::detached(),
                    }));
                }
            }
        }
    }

    /// Rebuild as a table. The caller unregisters the hash from the
    /// process-wide index beforehand and re-registers it under the returned
    /// minimum (invalid sentinel when there is nothing to register).
    pub fn convert_to_table(&mut self, key: &Bytes) -> u64 {
        match self {
            HashValue::Ht(_) => self.next_time_to_expire(),
            HashValue::Listpack(_) => {
                let HashValue::Listpack(lp) = std::mem::replace(self, HashValue::new()) else {
                    unreachable!()
                };
                let mut fields = HashMap::with_capacity(lp.len());
                for (f, v) in lp.iter() {
                    let entry = HtEntry { field: HField::new(f.clone()), value: v.clone() };
                    if fields.insert(f.clone(), entry).is_some() {
                        corruption_abort(key, f);
                    }
                }
                *self = HashValue::Ht(Box::new(HtHash { fields, expire_meta: None }));
                EXPIRE_TIME_INVALID
            }
            HashValue::ListpackEx(_) => {
                let HashValue::ListpackEx(lp) = std::mem::replace(self, HashValue::new()) else {
                    unreachable!()
                };
                let mut fields = HashMap::with_capacity(lp.len());
                let mut hfe = EBuckets::new();
                for e in lp.entries() {
                    let mut field = if e.expire_at == LP_NO_TTL {
                        HField::new(e.field.clone())
                    } else {
                        HField::new_with_expiry(e.field.clone())
                    };
                    if e.expire_at != LP_NO_TTL {
                        field.attach_expire(e.expire_at);
                        hfe.add(e.field.clone(), e.expire_at);
                    }
                    let entry = HtEntry { field, value: e.value.clone() };
                    if fields.insert(e.field.clone(), entry).is_some() {
                        corruption_abort(key, &e.field);
                    }
                }
                let min = hfe.next_expire_time().unwrap_or(EXPIRE_TIME_INVALID);
                *self = HashValue::Ht(Box::new(HtHash {
                    fields,
                    expire_meta: Some(Box::new(HtExpireMeta {
                        key: lp.key,
                        hfe,
                        meta: ExpireMeta::detached(),
                    })),
                }));
                min
            }
        }
    }

    /// One apply step of the set-with-expiry protocol. The encoding must
    /// already be expiry-capable (`prepare_for_expiry`).
    ///
    /// `past_deletes` is false while loading a snapshot or applying the
    /// upstream replica stream; past deadlines are then stored as-is.
    pub fn set_field_expiry(
        &mut self,
        field: &Bytes,
        expire_at: u64,
        field_cond: FieldSetCond,
        expire_cond: ExpireSetCond,
        now: u64,
        past_deletes: bool,
        state: &mut SetExState,
    ) -> SetExRes {
        match self {
            HashValue::Listpack(_) => unreachable!("expiry on pair encoding"),
            HashValue::ListpackEx(lp) => {
                set_expiry_listpack(lp, field, expire_at, field_cond, expire_cond, now, past_deletes, state)
            }
            HashValue::Ht(h) => {
                h.set_field_expiry(field, expire_at, field_cond, expire_cond, now, past_deletes, state)
            }
        }
    }

    /// Drop a field's deadline. A field already past its deadline answers
    /// as missing.
    pub fn persist_field(&mut self, field: &[u8], now: u64) -> PersistRes {
        match self {
            HashValue::Listpack(lp) => {
                if lp.get(field).is_some() {
                    PersistRes::NoTtl
                } else {
                    PersistRes::NoField
                }
            }
            HashValue::ListpackEx(lp) => match lp.get(field) {
                None => PersistRes::NoField,
                Some(e) if e.expire_at == LP_NO_TTL => PersistRes::NoTtl,
                Some(e) if is_past(e.expire_at, now) => PersistRes::NoField,
                Some(_) => {
                    lp.update_expiry(field, LP_NO_TTL);
                    PersistRes::Ok
                }
            },
            HashValue::Ht(h) => h.persist_field(field, now),
        }
    }

    /// Delete up to `max_items` fields past their deadline, invoking
    /// `on_removed` per field. Returns `(removed, next_deadline)` where the
    /// next deadline is the invalid sentinel when no deadline remains.
    pub fn expire_fields<F>(&mut self, now: u64, max_items: u64, mut on_removed: F) -> (u64, u64)
    where
        F: FnMut(&Bytes),
    {
        match self {
            HashValue::Listpack(_) => (0, EXPIRE_TIME_INVALID),
            HashValue::ListpackEx(lp) => {
                let (removed, next) = lp.expire_head(now, max_items);
                for f in &removed {
                    on_removed(f);
                }
                (removed.len() as u64, next.unwrap_or(EXPIRE_TIME_INVALID))
            }
            HashValue::Ht(h) => {
                let HtHash { fields, expire_meta } = &mut **h;
                let Some(m) = expire_meta else {
                    return (0, EXPIRE_TIME_INVALID);
                };
                let out = m.hfe.expire(now, max_items, |fname| {
                    if fields.remove(fname.as_ref() as &[u8]).is_some() {
                        on_removed(fname);
                    }
                    ExpireAction::Remove
                });
                (
                    out.items_expired,
                    out.next_expire_time.unwrap_or(EXPIRE_TIME_INVALID),
                )
            }
        }
    }

    /// Every field as `(name, value, deadline)`, deadline being the invalid
    /// sentinel when absent. Listpack encodings enumerate in stored order.
    pub fn entries(&self) -> Vec<(Bytes, Bytes, u64)> {
        match self {
            HashValue::Listpack(lp) => lp
                .iter()
                .map(|(f, v)| (f.clone(), v.clone(), EXPIRE_TIME_INVALID))
                .collect(),
            HashValue::ListpackEx(lp) => lp
                .entries()
                .iter()
                .map(|e| (e.field.clone(), e.value.clone(), e.deadline()))
                .collect(),
            HashValue::Ht(h) => h
                .fields
                .values()
                .map(|e| (e.field.name().clone(), e.value.clone(), e.field.expire_time()))
                .collect(),
        }
    }

    /// Deep copy under a new key, preserving every field deadline. Returns
    /// the value and the deadline it was registered under (to re-register
    /// the copy), or the invalid sentinel.
    pub fn duplicate(&self, new_key: Bytes) -> (HashValue, u64) {
        match self {
            HashValue::Listpack(lp) => (HashValue::Listpack(lp.clone()), EXPIRE_TIME_INVALID),
            HashValue::ListpackEx(lp) => {
                let mut dup = lp.clone();
                dup.key = new_key;
                dup.meta = ExpireMeta::detached();
                let registered = lp.meta.expire_time();
                (HashValue::ListpackEx(dup), registered)
            }
            HashValue::Ht(h) => {
                let mut fields = HashMap::with_capacity(h.fields.len());
                let mut expire_meta = h.expire_meta.as_ref().map(|_| {
                    Box::new(HtExpireMeta {
                        key: new_key,
                        hfe: EBuckets::new(),
                        meta: ExpireMeta::detached(),
                    })
                });
                for (name, entry) in &h.fields {
                    let deadline = entry.field.expire_time();
                    let field = if deadline == EXPIRE_TIME_INVALID {
                        HField::new(name.clone())
                    } else {
                        let mut f = HField::new_with_expiry(name.clone());
                        f.attach_expire(deadline);
                        expire_meta
                            .as_mut()
                            .expect("deadline-carrying field in a hash without header")
                            .hfe
                            .add(name.clone(), deadline);
                        f
                    };
                    fields.insert(name.clone(), HtEntry { field, value: entry.value.clone() });
                }
                let registered = h
                    .expire_meta
                    .as_ref()
                    .map_or(EXPIRE_TIME_INVALID, |m| m.meta.expire_time());
                (
                    HashValue::Ht(Box::new(HtHash { fields, expire_meta })),
                    registered,
                )
            }
        }
    }

    /// Rebuild a table hash from snapshot records `(field, value,
    /// deadline)`. The expiration header is grown only when a record
    /// actually carries a deadline.
    pub(crate) fn table_from_records(key: &Bytes, records: Vec<(Bytes, Bytes, Option<u64>)>) -> Self {
        let with_deadlines = records.iter().any(|(_, _, d)| d.is_some());
        let mut fields = HashMap::with_capacity(records.len());
        let mut expire_meta = with_deadlines.then(|| {
            Box::new(HtExpireMeta {
                key: key.clone(),
                hfe: EBuckets::new(),
                meta: ExpireMeta::detached(),
            })
        });
        for (name, value, deadline) in records {
            let field = match deadline {
                None => HField::new(name.clone()),
                Some(t) => {
                    let mut f = HField::new_with_expiry(name.clone());
                    f.attach_expire(t);
                    expire_meta
                        .as_mut()
                        .expect("deadline implies header")
                        .hfe
                        .add(name.clone(), t);
                    f
                }
            };
            if fields.insert(name.clone(), HtEntry { field, value }).is_some() {
                corruption_abort(key, &name);
            }
        }
        HashValue::Ht(Box::new(HtHash { fields, expire_meta }))
    }

    /// Payload bytes of the compact encodings, for the safe-append bound.
    pub fn compact_payload_bytes(&self) -> usize {
        match self {
            HashValue::Listpack(lp) => lp.payload_bytes(),
            HashValue::ListpackEx(lp) => lp.payload_bytes(),
            HashValue::Ht(_) => 0,
        }
    }
}

impl Default for HashValue {
    fn default() -> Self {
        Self::new()
    }
}

impl HtHash {
    fn set(&mut self, field: Bytes, value: Bytes, keep_ttl: bool) -> bool {
        let HtHash { fields, expire_meta } = self;
        match fields.entry(field) {
            Entry::Occupied(mut o) => {
                let e = o.get_mut();
                e.value = value;
                if !keep_ttl {
                    let deadline = e.field.expire_time();
                    if deadline != EXPIRE_TIME_INVALID {
                        if let Some(m) = expire_meta {
                            m.hfe.remove(e.field.name(), deadline);
                        }
                        // Overwrite resets the field to the plain form.
                        let name = e.field.name().clone();
                        e.field = HField::new(name);
                    }
                }
                true
            }
            Entry::Vacant(v) => {
                let name = v.key().clone();
                v.insert(HtEntry { field: HField::new(name), value });
                false
            }
        }
    }

    fn delete(&mut self, field: &[u8]) -> bool {
        let Some(entry) = self.fields.remove(field) else {
            return false;
        };
        let deadline = entry.field.expire_time();
        if deadline != EXPIRE_TIME_INVALID {
            if let Some(m) = &mut self.expire_meta {
                m.hfe.remove(entry.field.name(), deadline);
            }
        }
        true
    }

    fn persist_field(&mut self, field: &[u8], now: u64) -> PersistRes {
        let HtHash { fields, expire_meta } = self;
        let Some(entry) = fields.get_mut(field) else {
            return PersistRes::NoField;
        };
        let deadline = entry.field.expire_time();
        if deadline == EXPIRE_TIME_INVALID {
            return PersistRes::NoTtl;
        }
        if is_past(deadline, now) {
            return PersistRes::NoField;
        }
        if let Some(m) = expire_meta {
            m.hfe.remove(entry.field.name(), deadline);
        }
        entry.field.detach_expire();
        PersistRes::Ok
    }

    #[allow(clippy::too_many_arguments)]
    fn set_field_expiry(
        &mut self,
        field: &Bytes,
        expire_at: u64,
        field_cond: FieldSetCond,
        expire_cond: ExpireSetCond,
        now: u64,
        past_deletes: bool,
        state: &mut SetExState,
    ) -> SetExRes {
        let HtHash { fields, expire_meta } = self;
        let m = expire_meta
            .as_deref_mut()
            .expect("set-with-expiry on a table hash without an expiration header");

        let Some(entry) = fields.get_mut(field.as_ref() as &[u8]) else {
            // The expiry-only protocol never creates fields; values arrive
            // through the plain set path or the snapshot loader.
            return match field_cond {
                FieldSetCond::DontCreate => SetExRes::NoConditionMet,
                _ => SetExRes::NoField,
            };
        };

        if field_cond == FieldSetCond::DontOverwrite {
            return SetExRes::NoConditionMet;
        }

        let prev = entry.field.expire_time();
        if prev == EXPIRE_TIME_INVALID {
            // No current deadline: infinity. Gt cannot beat it, Xx needs one.
            if matches!(expire_cond, ExpireSetCond::Xx | ExpireSetCond::Gt) {
                return SetExRes::NoConditionMet;
            }
        } else {
            let rejected = match expire_cond {
                ExpireSetCond::Gt => prev >= expire_at,
                ExpireSetCond::Lt => prev <= expire_at,
                ExpireSetCond::Nx => true,
                _ => false,
            };
            if rejected {
                return SetExRes::NoConditionMet;
            }
            m.hfe.remove(entry.field.name(), prev);
            entry.field.detach_expire();
            state.touch(prev);
        }

        if past_deletes && is_past(expire_at, now) {
            let name = entry.field.name().clone();
            // Deadline already unlinked above; drop the whole entry.
            fields.remove(name.as_ref() as &[u8]);
            state.fields_deleted += 1;
            return SetExRes::Deleted;
        }

        state.touch(expire_at);
        entry.field.reserve_expire_meta();
        entry.field.attach_expire(expire_at);
        m.hfe.add(field.clone(), expire_at);
        state.fields_updated += 1;
        SetExRes::Ok
    }
}

#[allow(clippy::too_many_arguments)]
fn set_expiry_listpack(
    lp: &mut ListpackEx,
    field: &Bytes,
    expire_at: u64,
    field_cond: FieldSetCond,
    expire_cond: ExpireSetCond,
    now: u64,
    past_deletes: bool,
    state: &mut SetExState,
) -> SetExRes {
    let Some(entry) = lp.get(field) else {
        return match field_cond {
            FieldSetCond::DontCreate => SetExRes::NoConditionMet,
            _ => SetExRes::NoField,
        };
    };

    if field_cond == FieldSetCond::DontOverwrite {
        return SetExRes::NoConditionMet;
    }

    let prev = entry.deadline();
    if prev == EXPIRE_TIME_INVALID {
        if matches!(expire_cond, ExpireSetCond::Xx | ExpireSetCond::Gt) {
            return SetExRes::NoConditionMet;
        }
    } else {
        let rejected = match expire_cond {
            ExpireSetCond::Gt => prev >= expire_at,
            ExpireSetCond::Lt => prev <= expire_at,
            ExpireSetCond::Nx => true,
            _ => false,
        };
        if rejected {
            return SetExRes::NoConditionMet;
        }
        state.touch(prev);
    }

    if past_deletes && is_past(expire_at, now) {
        lp.delete(field);
        state.fields_deleted += 1;
        return SetExRes::Deleted;
    }

    state.touch(expire_at);
    lp.update_expiry(field, expire_at);
    state.fields_updated += 1;
    SetExRes::Ok
}

/// A duplicate field surfaced while rebuilding a compact hash into a table
/// means the buffer is corrupt; continuing risks silently losing data.
fn corruption_abort(key: &Bytes, field: &Bytes) -> ! {
    let dump: String = field.iter().map(|b| format!("{b:02x}")).collect();
    error!(
        key = %String::from_utf8_lossy(key),
        field_hex = %dump,
        "duplicate field while converting compact hash; buffer is corrupt"
    );
    panic!("hash conversion: corrupt compact buffer (duplicate field)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn ex_state() -> SetExState {
        SetExState::new(EXPIRE_TIME_INVALID)
    }

    fn apply(
        h: &mut HashValue,
        field: &str,
        expire_at: u64,
        cond: ExpireSetCond,
        now: u64,
        state: &mut SetExState,
    ) -> SetExRes {
        h.set_field_expiry(
            &b(field),
            expire_at,
            FieldSetCond::DontCreateReportNoField,
            cond,
            now,
            true,
            state,
        )
    }

    fn seeded(fields: &[(&str, &str)]) -> HashValue {
        let mut h = HashValue::new();
        for (f, v) in fields {
            h.set(b(f), b(v), SetFlags::default());
        }
        h
    }

    #[test]
    fn test_new_hash_is_listpack() {
        let h = seeded(&[("f", "v")]);
        assert_eq!(h.encoding(), HashEncoding::Listpack);
        assert_eq!(h.len(), 1);
        let (v, deadline) = h.get(b"f").unwrap();
        assert_eq!(v, &b("v"));
        assert_eq!(deadline, EXPIRE_TIME_INVALID);
    }

    #[test]
    fn test_prepare_for_expiry_upgrades_listpack() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        assert_eq!(h.encoding(), HashEncoding::ListpackEx);
        // Value unchanged, still no deadline.
        assert_eq!(h.get(b"f").unwrap().1, EXPIRE_TIME_INVALID);
    }

    #[test]
    fn test_set_expiry_orders_triples() {
        let mut h = seeded(&[("a", "1"), ("b", "2"), ("c", "3")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        assert_eq!(apply(&mut h, "b", 3000, ExpireSetCond::None, 1000, &mut st), SetExRes::Ok);
        assert_eq!(apply(&mut h, "c", 2000, ExpireSetCond::None, 1000, &mut st), SetExRes::Ok);
        assert_eq!(apply(&mut h, "a", 4000, ExpireSetCond::None, 1000, &mut st), SetExRes::Ok);

        let HashValue::ListpackEx(lp) = &h else { panic!() };
        let order: Vec<(&[u8], u64)> = lp
            .entries()
            .iter()
            .map(|e| (e.field.as_ref(), e.expire_at))
            .collect();
        assert_eq!(
            order,
            vec![(b"c".as_ref(), 2000), (b"b".as_ref(), 3000), (b"a".as_ref(), 4000)]
        );
        assert_eq!(h.next_time_to_expire(), 2000);
        assert_eq!(st.fields_updated, 3);
    }

    #[test]
    fn test_expire_conditions_on_fresh_field() {
        // A field without a TTL behaves as infinity: XX and GT fail, LT
        // succeeds.
        for (cond, expect) in [
            (ExpireSetCond::Xx, SetExRes::NoConditionMet),
            (ExpireSetCond::Gt, SetExRes::NoConditionMet),
            (ExpireSetCond::Lt, SetExRes::Ok),
            (ExpireSetCond::Nx, SetExRes::Ok),
        ] {
            let mut h = seeded(&[("f", "v")]);
            h.prepare_for_expiry(&b("k"));
            let mut st = ex_state();
            assert_eq!(apply(&mut h, "f", 5000, cond, 1000, &mut st), expect, "{cond:?}");
        }
    }

    #[test]
    fn test_expire_conditions_on_existing_ttl() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "f", 2000, ExpireSetCond::None, 1000, &mut st);

        // GT with a smaller deadline: rejected.
        assert_eq!(
            apply(&mut h, "f", 1500, ExpireSetCond::Gt, 1000, &mut st),
            SetExRes::NoConditionMet
        );
        // LT with a smaller deadline: accepted.
        assert_eq!(
            apply(&mut h, "f", 1500, ExpireSetCond::Lt, 1000, &mut st),
            SetExRes::Ok
        );
        assert_eq!(h.get(b"f").unwrap().1, 1500);
        // NX on a field that has a TTL: rejected.
        assert_eq!(
            apply(&mut h, "f", 9000, ExpireSetCond::Nx, 1000, &mut st),
            SetExRes::NoConditionMet
        );
        // XX on a field that has one: accepted.
        assert_eq!(
            apply(&mut h, "f", 9000, ExpireSetCond::Xx, 1000, &mut st),
            SetExRes::Ok
        );
    }

    #[test]
    fn test_past_deadline_deletes_field() {
        let mut h = seeded(&[("f", "v"), ("g", "w")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        assert_eq!(
            apply(&mut h, "f", 500, ExpireSetCond::None, 1000, &mut st),
            SetExRes::Deleted
        );
        assert!(h.get(b"f").is_none());
        assert_eq!(st.fields_deleted, 1);

        // Suppressed while loading: stored as-is.
        let res = h.set_field_expiry(
            &b("g"),
            500,
            FieldSetCond::DontCreateReportNoField,
            ExpireSetCond::None,
            1000,
            false,
            &mut st,
        );
        assert_eq!(res, SetExRes::Ok);
        assert_eq!(h.get(b"g").unwrap().1, 500);
    }

    #[test]
    fn test_missing_field_codes() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        assert_eq!(
            apply(&mut h, "nope", 5000, ExpireSetCond::None, 1000, &mut st),
            SetExRes::NoField
        );
        assert_eq!(
            h.set_field_expiry(
                &b("nope"),
                5000,
                FieldSetCond::DontCreate,
                ExpireSetCond::None,
                1000,
                true,
                &mut st,
            ),
            SetExRes::NoConditionMet
        );
    }

    #[test]
    fn test_dont_overwrite_rejects_existing() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        assert_eq!(
            h.set_field_expiry(
                &b("f"),
                5000,
                FieldSetCond::DontOverwrite,
                ExpireSetCond::None,
                1000,
                true,
                &mut st,
            ),
            SetExRes::NoConditionMet
        );
    }

    #[test]
    fn test_table_promotion_in_place() {
        let mut h = seeded(&[("a", "1"), ("b", "2")]);
        let min = h.convert_to_table(&b("k"));
        assert_eq!(h.encoding(), HashEncoding::Ht);
        assert_eq!(min, EXPIRE_TIME_INVALID);

        // First deadline promotes the header in place and behaves as on
        // the compact encoding.
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        assert_eq!(apply(&mut h, "a", 7000, ExpireSetCond::None, 1000, &mut st), SetExRes::Ok);
        assert_eq!(h.next_time_to_expire(), 7000);
        assert_eq!(h.get(b"a").unwrap().1, 7000);
    }

    #[test]
    fn test_conversion_preserves_deadlines() {
        let mut h = seeded(&[("a", "1"), ("b", "2"), ("c", "3")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "b", 3000, ExpireSetCond::None, 1000, &mut st);
        apply(&mut h, "a", 8000, ExpireSetCond::None, 1000, &mut st);

        let min = h.convert_to_table(&b("k"));
        assert_eq!(min, 3000);
        assert_eq!(h.encoding(), HashEncoding::Ht);
        assert_eq!(h.get(b"a").unwrap().1, 8000);
        assert_eq!(h.get(b"b").unwrap().1, 3000);
        assert_eq!(h.get(b"c").unwrap().1, EXPIRE_TIME_INVALID);
        assert_eq!(h.next_time_to_expire(), 3000);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_overwrite_discards_ttl_unless_kept() {
        for to_table in [false, true] {
            let mut h = seeded(&[("f", "v")]);
            if to_table {
                h.convert_to_table(&b("k"));
            }
            h.prepare_for_expiry(&b("k"));
            let mut st = ex_state();
            apply(&mut h, "f", 5000, ExpireSetCond::None, 1000, &mut st);

            h.set(b("f"), b("v2"), SetFlags { keep_ttl: true });
            assert_eq!(h.get(b"f").unwrap().1, 5000);

            h.set(b("f"), b("v3"), SetFlags::default());
            assert_eq!(h.get(b"f").unwrap().1, EXPIRE_TIME_INVALID);
            assert_eq!(h.next_time_to_expire(), EXPIRE_TIME_INVALID);
        }
    }

    #[test]
    fn test_delete_unlinks_private_index() {
        let mut h = seeded(&[("f", "v"), ("g", "w")]);
        h.convert_to_table(&b("k"));
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "f", 5000, ExpireSetCond::None, 1000, &mut st);
        apply(&mut h, "g", 6000, ExpireSetCond::None, 1000, &mut st);

        assert!(h.delete(b"f"));
        assert_eq!(h.next_time_to_expire(), 6000);
        assert!(!h.delete(b"f"));
    }

    #[test]
    fn test_persist_field_per_encoding() {
        // Compact with TTL.
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "f", 5000, ExpireSetCond::None, 1000, &mut st);
        assert_eq!(h.persist_field(b"f", 1000), PersistRes::Ok);
        assert_eq!(h.persist_field(b"f", 1000), PersistRes::NoTtl);
        assert_eq!(h.persist_field(b"x", 1000), PersistRes::NoField);

        // Table: past deadline answers as missing.
        let mut h = seeded(&[("f", "v")]);
        h.convert_to_table(&b("k"));
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "f", 5000, ExpireSetCond::None, 1000, &mut st);
        assert_eq!(h.persist_field(b"f", 6000), PersistRes::NoField);
        assert_eq!(h.persist_field(b"f", 1000), PersistRes::Ok);
        assert_eq!(h.next_time_to_expire(), EXPIRE_TIME_INVALID);

        // Plain pairs never have a TTL.
        let h2 = seeded(&[("f", "v")]);
        let mut h2 = h2;
        assert_eq!(h2.persist_field(b"f", 0), PersistRes::NoTtl);
        assert_eq!(h2.persist_field(b"x", 0), PersistRes::NoField);
    }

    #[test]
    fn test_expire_fields_table() {
        let mut h = seeded(&[("a", "1"), ("b", "2"), ("c", "3")]);
        h.convert_to_table(&b("k"));
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "a", 1000, ExpireSetCond::None, 500, &mut st);
        apply(&mut h, "b", 1500, ExpireSetCond::None, 500, &mut st);
        apply(&mut h, "c", 9000, ExpireSetCond::None, 500, &mut st);

        let mut removed = Vec::new();
        let (n, next) = h.expire_fields(2000, u64::MAX, |f| removed.push(f.clone()));
        assert_eq!(n, 2);
        assert_eq!(next, 9000);
        assert_eq!(h.len(), 1);
        assert!(removed.contains(&b("a")) && removed.contains(&b("b")));
    }

    #[test]
    fn test_len_subtract_expired() {
        let mut h = seeded(&[("a", "1"), ("b", "2"), ("c", "3")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "a", 1000, ExpireSetCond::None, 500, &mut st);
        apply(&mut h, "b", 9000, ExpireSetCond::None, 500, &mut st);

        assert_eq!(h.len(), 3);
        assert_eq!(h.len_subtract_expired(2000), 2);

        h.convert_to_table(&b("k"));
        assert_eq!(h.len_subtract_expired(2000), 2);
        assert_eq!(h.len_subtract_expired(10_000), 1);
    }

    #[test]
    fn test_duplicate_preserves_deadline_multiset() {
        for to_table in [false, true] {
            let mut h = seeded(&[("a", "1"), ("b", "2")]);
            if to_table {
                h.convert_to_table(&b("k"));
            }
            h.prepare_for_expiry(&b("k"));
            let mut st = ex_state();
            apply(&mut h, "a", 5000, ExpireSetCond::None, 1000, &mut st);
            h.mark_registered(5000);

            let (dup, registered) = h.duplicate(b("k2"));
            assert_eq!(registered, 5000);
            // Copies start unlinked; the keyspace re-registers them.
            assert_eq!(dup.registered_min_expire(), EXPIRE_TIME_INVALID);

            let mut src: Vec<_> = h.entries();
            let mut cpy: Vec<_> = dup.entries();
            src.sort();
            cpy.sort();
            assert_eq!(src, cpy);
            assert_eq!(dup.next_time_to_expire(), 5000);
        }
    }

    #[test]
    fn test_registration_marks() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        assert_eq!(h.registered_min_expire(), EXPIRE_TIME_INVALID);
        h.mark_registered(4000);
        assert_eq!(h.registered_min_expire(), 4000);
        h.mark_unregistered();
        assert_eq!(h.registered_min_expire(), EXPIRE_TIME_INVALID);
    }

    #[test]
    fn test_min_tracking_in_state() {
        let mut h = seeded(&[("f", "v")]);
        h.prepare_for_expiry(&b("k"));
        let mut st = ex_state();
        apply(&mut h, "f", 5000, ExpireSetCond::None, 1000, &mut st);
        assert_eq!(st.min_expire_fields, 5000);

        // Re-keying tracks both the old and the new deadline.
        let mut st = ex_state();
        apply(&mut h, "f", 9000, ExpireSetCond::None, 1000, &mut st);
        assert_eq!(st.min_expire_fields, 5000);
    }
}
