//! Keyspace and expiration orchestration.
//!
//! [`Db`] is the single logical owner of the key dictionary, the
//! process-wide expiration index and every hash's private index. One command
//! at a time runs against it (the engine facade serializes callers), and all
//! time comparisons within a command use the snapshot taken at command
//! entry.
//!
//! Expiration happens in two places:
//!
//! - **Lazily**: a read that resolves a field consults its deadline first.
//!   A field past its deadline is deleted, the deletion is propagated as a
//!   synthesized `HDEL`, and the read answers "expired" rather than
//!   "missing". An emptied hash is removed from the keyspace on the spot.
//! - **Actively**: [`Db::active_expire`] drains the process-wide index
//!   under a per-cycle budget, so fields nobody reads still get reclaimed.

use crate::storage::ebuckets::{
    EBuckets, ExpireAction, EXPIRE_TIME_INVALID, NEW_EXPIRE_DIFF_THRESHOLD,
};
use crate::storage::hash::{
    is_past, ExpireSetCond, FieldSetCond, HashEncoding, HashValue, PersistRes, SetExRes,
    SetExState, SetFlags,
};
use crate::storage::listpack::LP_SAFE_APPEND_LIMIT;
use crate::storage::sink::{EngineSink, LogSink};
use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Engine tunables. All of them are reachable through `CONFIG SET`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entry count above which a compact hash becomes a table.
    pub hash_max_listpack_entries: usize,
    /// Field or value byte length above which a compact hash becomes a
    /// table.
    pub hash_max_listpack_value: usize,
    /// When set, read paths never delete expired fields.
    pub lazy_expire_disabled: bool,
    /// Field-deletion budget per active-expire cycle.
    pub active_expire_quota_per_cycle: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_max_listpack_entries: 128,
            hash_max_listpack_value: 64,
            lazy_expire_disabled: false,
            active_expire_quota_per_cycle: 1000,
        }
    }
}

/// Source of the per-command time snapshot. The manual variant pins time
/// for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Manual(u64),
}

impl Clock {
    fn now_ms(&self) -> u64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            Clock::Manual(ms) => *ms,
        }
    }
}

/// Storage-level error taxonomy. Per-field result codes are not errors and
/// never appear here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("no such key")]
    NoSuchKey,

    #[error("hash value is not an integer")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    IncrOverflow,

    #[error("hash value is not a float")]
    NotAFloat,

    #[error("increment would produce NaN or Infinity")]
    NanOrInfinity,
}

/// A keyspace value.
#[derive(Debug, Clone)]
pub enum Value {
    Hash(HashValue),
    Str(Bytes),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Hash(_) => "hash",
            Value::Str(_) => "string",
        }
    }
}

/// Outcome of a lazily-expiring field read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetFieldRes {
    Ok(Bytes),
    NotFound,
    /// The field was past its deadline and has been deleted.
    Expired,
    /// Same, and it was the last field: the whole hash is gone too.
    ExpiredHash,
}

/// Unit of a TTL query reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Millis,
}

/// The database. See the module docs for the ownership model.
pub struct Db {
    dict: HashMap<Bytes, Value>,
    /// Process-wide index: every hash with at least one field deadline,
    /// keyed by its minimum deadline.
    hexpires: EBuckets<Bytes>,
    config: EngineConfig,
    sink: Box<dyn EngineSink>,
    clock: Clock,
    /// Per-command time snapshot, milliseconds since the epoch.
    now_ms: u64,
    id: u32,
    /// Snapshot load in progress: expired fields stay readable.
    pub loading: bool,
    /// Commands originate from the upstream replica stream: trust its
    /// explicit deletions instead of expiring locally.
    pub import_mode: bool,
    replication_allowed: bool,
    dirty: u64,
    stat_expired_fields: u64,
}

impl Db {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_sink(config, Box::new(LogSink::default()))
    }

    pub fn with_sink(config: EngineConfig, sink: Box<dyn EngineSink>) -> Self {
        let clock = Clock::System;
        Self {
            dict: HashMap::new(),
            hexpires: EBuckets::new(),
            config,
            sink,
            clock,
            now_ms: clock.now_ms(),
            id: 0,
            loading: false,
            import_mode: false,
            replication_allowed: true,
            dirty: 0,
            stat_expired_fields: 0,
        }
    }

    /// Refresh the command time snapshot. Called once per command by the
    /// engine facade.
    pub fn begin_command(&mut self) {
        self.now_ms = self.clock.now_ms();
    }

    /// Pin the clock (tests and replay tooling).
    pub fn set_time(&mut self, now_ms: u64) {
        self.clock = Clock::Manual(now_ms);
        self.now_ms = now_ms;
    }

    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn key_count(&self) -> usize {
        self.dict.len()
    }

    /// Hashes currently linked in the process-wide expiration index.
    pub fn hfe_indexed_count(&self) -> usize {
        self.hexpires.len()
    }

    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    pub fn expired_fields(&self) -> u64 {
        self.stat_expired_fields
    }

    // ========================================================================
    // Keyspace primitives
    // ========================================================================

    pub(crate) fn get_value(&self, key: &[u8]) -> Option<&Value> {
        self.dict.get(key)
    }

    pub(crate) fn iter_values(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.dict.iter()
    }

    pub fn type_of(&self, key: &[u8]) -> Option<&'static str> {
        self.dict.get(key).map(Value::type_name)
    }

    pub fn exists_key(&self, key: &[u8]) -> bool {
        self.dict.contains_key(key)
    }

    pub fn object_encoding(&self, key: &[u8]) -> Option<&'static str> {
        match self.dict.get(key)? {
            Value::Hash(h) => Some(h.encoding().name()),
            Value::Str(_) => Some("raw"),
        }
    }

    /// Delete keys. Emits one `del` event per removed key.
    pub fn del_keys(&mut self, keys: &[Bytes]) -> u64 {
        let mut removed = 0;
        for key in keys {
            if drop_key(&mut self.dict, &mut self.hexpires, key) {
                self.sink.notify_keyspace_event("generic", "del", key);
                self.dirty += 1;
                removed += 1;
            }
        }
        removed
    }

    pub fn flush(&mut self) {
        self.dict.clear();
        self.hexpires = EBuckets::new();
    }

    pub fn set_str(&mut self, key: Bytes, value: Bytes) {
        drop_key_registration(&mut self.dict, &mut self.hexpires, &key);
        self.dict.insert(key, Value::Str(value));
        self.dirty += 1;
    }

    pub fn get_str(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        match self.dict.get(key) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(Value::Hash(_)) => Err(StoreError::WrongType),
        }
    }

    /// Rename a key. The hash's borrowed key reference and its global-index
    /// registration are both moved before control returns, so an
    /// active-expire cycle can never observe the old name.
    pub fn rename(&mut self, key: &Bytes, new_key: &Bytes) -> Result<(), StoreError> {
        if !self.dict.contains_key(key.as_ref() as &[u8]) {
            return Err(StoreError::NoSuchKey);
        }
        if key == new_key {
            return Ok(());
        }
        drop_key(&mut self.dict, &mut self.hexpires, new_key);
        let mut val = self.dict.remove(key.as_ref() as &[u8]).expect("checked above");
        if let Value::Hash(h) = &mut val {
            let registered = h.registered_min_expire();
            if registered != EXPIRE_TIME_INVALID {
                self.hexpires.remove(key, registered);
                h.mark_unregistered();
            }
            h.update_key_ref(new_key.clone());
            if registered != EXPIRE_TIME_INVALID {
                self.hexpires.add(new_key.clone(), registered);
                h.mark_registered(registered);
            }
        }
        self.dict.insert(new_key.clone(), val);
        self.dirty += 1;
        self.sink.notify_keyspace_event("generic", "rename_from", key);
        self.sink.notify_keyspace_event("generic", "rename_to", new_key);
        Ok(())
    }

    /// Copy a key. Per-field deadlines survive and the copy is registered
    /// in the global index under the source's minimum.
    pub fn copy(&mut self, key: &Bytes, new_key: &Bytes, replace: bool) -> Result<bool, StoreError> {
        if key == new_key {
            return Ok(false);
        }
        let Some(src) = self.dict.get(key.as_ref() as &[u8]) else {
            return Ok(false);
        };
        if self.dict.contains_key(new_key.as_ref() as &[u8]) && !replace {
            return Ok(false);
        }
        let (val, registered) = match src {
            Value::Str(s) => (Value::Str(s.clone()), EXPIRE_TIME_INVALID),
            Value::Hash(h) => {
                let (dup, registered) = h.duplicate(new_key.clone());
                (Value::Hash(dup), registered)
            }
        };
        drop_key(&mut self.dict, &mut self.hexpires, new_key);
        self.dict.insert(new_key.clone(), val);
        if registered != EXPIRE_TIME_INVALID {
            if let Some(Value::Hash(h)) = self.dict.get_mut(new_key.as_ref() as &[u8]) {
                self.hexpires.add(new_key.clone(), registered);
                h.mark_registered(registered);
            }
        }
        self.dirty += 1;
        self.sink.notify_keyspace_event("generic", "copy_to", new_key);
        Ok(true)
    }

    // ========================================================================
    // Hash reads (lazy expiration lives here)
    // ========================================================================

    fn lazy_expire_enabled(&self) -> bool {
        !(self.loading || self.import_mode || self.config.lazy_expire_disabled)
    }

    /// Resolve one field, expiring it first if its deadline has passed.
    pub fn hget(&mut self, key: &Bytes, field: &Bytes) -> Result<GetFieldRes, StoreError> {
        let now = self.now_ms;
        let lazy = self.lazy_expire_enabled();
        let Db { dict, hexpires, sink, replication_allowed, id, stat_expired_fields, .. } = self;

        let Some(val) = dict.get_mut(key.as_ref() as &[u8]) else {
            return Ok(GetFieldRes::NotFound);
        };
        let Value::Hash(h) = val else {
            return Err(StoreError::WrongType);
        };
        let (value, deadline) = match h.get(field) {
            Some((v, d)) => (v.clone(), d),
            None => return Ok(GetFieldRes::NotFound),
        };
        if !lazy || !is_past(deadline, now) {
            return Ok(GetFieldRes::Ok(value));
        }

        // Past its deadline: delete, propagate, maybe drop the whole hash.
        h.delete(field);
        *stat_expired_fields += 1;
        propagate_hdel(sink.as_mut(), replication_allowed, *id, key, field);

        if h.is_empty() {
            drop_key(dict, hexpires, key);
            sink.notify_keyspace_event("generic", "del", key);
            Ok(GetFieldRes::ExpiredHash)
        } else {
            Ok(GetFieldRes::Expired)
        }
    }

    pub fn hexists(&mut self, key: &Bytes, field: &Bytes) -> Result<bool, StoreError> {
        Ok(matches!(self.hget(key, field)?, GetFieldRes::Ok(_)))
    }

    pub fn hstrlen(&mut self, key: &Bytes, field: &Bytes) -> Result<usize, StoreError> {
        match self.hget(key, field)? {
            GetFieldRes::Ok(v) => Ok(v.len()),
            _ => Ok(0),
        }
    }

    /// Field count. With `subtract_expired`, fields already past their
    /// deadline are dry-run counted out without being deleted.
    pub fn hlen(&self, key: &[u8], subtract_expired: bool) -> Result<usize, StoreError> {
        match self.dict.get(key) {
            None => Ok(0),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            Some(Value::Hash(h)) => Ok(if subtract_expired {
                h.len_subtract_expired(self.now_ms)
            } else {
                h.len()
            }),
        }
    }

    /// Whether the hash is logically empty, counting expired-but-present
    /// fields as already gone.
    pub fn hash_is_empty(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.hlen(key, true)? == 0)
    }

    /// Full enumeration, skipping fields past their deadline (they are not
    /// deleted here; that is the expirer's job).
    pub fn hgetall(&self, key: &[u8]) -> Result<Option<Vec<(Bytes, Bytes)>>, StoreError> {
        let now = self.now_ms;
        match self.dict.get(key) {
            None => Ok(None),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            Some(Value::Hash(h)) => Ok(Some(
                h.entries()
                    .into_iter()
                    .filter(|(_, _, d)| !is_past(*d, now))
                    .map(|(f, v, _)| (f, v))
                    .collect(),
            )),
        }
    }

    /// One incremental-scan page. Never expires anything; the cursor is a
    /// position into the stored order, so pages are deterministic with
    /// respect to cursor state.
    pub fn hscan(
        &self,
        key: &[u8],
        cursor: u64,
        count: usize,
    ) -> Result<Option<(u64, Vec<(Bytes, Bytes)>)>, StoreError> {
        let now = self.now_ms;
        match self.dict.get(key) {
            None => Ok(None),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            Some(Value::Hash(h)) => {
                let entries = h.entries();
                let start = (cursor as usize).min(entries.len());
                let end = (start + count.max(1)).min(entries.len());
                let page = entries[start..end]
                    .iter()
                    .filter(|(_, _, d)| !is_past(*d, now))
                    .map(|(f, v, _)| (f.clone(), v.clone()))
                    .collect();
                let next = if end >= entries.len() { 0 } else { end as u64 };
                Ok(Some((next, page)))
            }
        }
    }

    /// Random sampling over the hash as stored; expired fields may be
    /// returned. `unique` distinguishes the positive-count semantics
    /// (distinct fields) from the negative-count ones (independent draws).
    pub fn hrandfield(
        &self,
        key: &[u8],
        count: usize,
        unique: bool,
    ) -> Result<Option<Vec<(Bytes, Bytes)>>, StoreError> {
        match self.dict.get(key) {
            None => Ok(None),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            Some(Value::Hash(h)) => {
                let entries = h.entries();
                if entries.is_empty() || count == 0 {
                    return Ok(Some(Vec::new()));
                }
                let mut rng = rand::thread_rng();
                let picked: Vec<(Bytes, Bytes)> = if unique {
                    if count >= entries.len() {
                        entries.into_iter().map(|(f, v, _)| (f, v)).collect()
                    } else {
                        let mut idx: Vec<usize> = (0..entries.len()).collect();
                        let (chosen, _) = idx.partial_shuffle(&mut rng, count);
                        chosen
                            .iter()
                            .map(|&i| (entries[i].0.clone(), entries[i].1.clone()))
                            .collect()
                    }
                } else {
                    (0..count)
                        .map(|_| {
                            let i = rng.gen_range(0..entries.len());
                            (entries[i].0.clone(), entries[i].1.clone())
                        })
                        .collect()
                };
                Ok(Some(picked))
            }
        }
    }

    // ========================================================================
    // Hash writes
    // ========================================================================

    /// Plain field write; creates the hash on first use. Returns true when
    /// the field already existed.
    fn hset_raw(
        &mut self,
        key: &Bytes,
        field: Bytes,
        value: Bytes,
        flags: SetFlags,
    ) -> Result<bool, StoreError> {
        match self.dict.get(key.as_ref() as &[u8]) {
            Some(Value::Str(_)) => return Err(StoreError::WrongType),
            Some(Value::Hash(_)) => {}
            None => {
                self.dict.insert(key.clone(), Value::Hash(HashValue::new()));
            }
        }

        // Compact encodings bail out to the table before an oversized or
        // unsafe append, and after crossing the entry-count bound.
        let needs_convert = {
            let h = self.hash_ref(key)?;
            h.encoding() != HashEncoding::Ht
                && (field.len() > self.config.hash_max_listpack_value
                    || value.len() > self.config.hash_max_listpack_value
                    || h.compact_payload_bytes() + field.len() + value.len()
                        > LP_SAFE_APPEND_LIMIT)
        };
        if needs_convert {
            self.convert_to_table_registered(key);
        }

        let max_entries = self.config.hash_max_listpack_entries;
        let h = self.hash_mut(key)?;
        let updated = h.set(field, value, flags);
        let over_entries = h.encoding() != HashEncoding::Ht && h.len() > max_entries;
        if over_entries {
            self.convert_to_table_registered(key);
        }
        Ok(updated)
    }

    /// `HSET`-style multi write. Returns the number of created fields.
    pub fn hset(&mut self, key: &Bytes, pairs: &[(Bytes, Bytes)]) -> Result<u64, StoreError> {
        let mut created = 0;
        for (f, v) in pairs {
            if !self.hset_raw(key, f.clone(), v.clone(), SetFlags::default())? {
                created += 1;
            }
        }
        self.dirty += pairs.len() as u64;
        self.sink.notify_keyspace_event("hash", "hset", key);
        Ok(created)
    }

    /// Set-if-absent. Lazy expiration applies to the existence check, so an
    /// expired field counts as absent (and may take the whole hash with it,
    /// in which case a fresh one is created).
    pub fn hsetnx(&mut self, key: &Bytes, field: &Bytes, value: Bytes) -> Result<bool, StoreError> {
        if matches!(self.hget(key, field)?, GetFieldRes::Ok(_)) {
            return Ok(false);
        }
        self.hset_raw(key, field.clone(), value, SetFlags::default())?;
        self.dirty += 1;
        self.sink.notify_keyspace_event("hash", "hset", key);
        Ok(true)
    }

    /// Delete fields. Returns `(deleted, key_removed)`.
    pub fn hdel(&mut self, key: &Bytes, fields: &[Bytes]) -> Result<(u64, bool), StoreError> {
        let mut deleted = 0;
        let mut key_removed = false;
        {
            let Db { dict, hexpires, .. } = self;
            let Some(val) = dict.get_mut(key.as_ref() as &[u8]) else {
                return Ok((0, false));
            };
            let Value::Hash(h) = val else {
                return Err(StoreError::WrongType);
            };
            for f in fields {
                if h.delete(f) {
                    deleted += 1;
                    if h.is_empty() {
                        drop_key(dict, hexpires, key);
                        key_removed = true;
                        break;
                    }
                }
            }
        }
        if deleted > 0 {
            self.dirty += deleted;
            self.sink.notify_keyspace_event("hash", "hdel", key);
            if key_removed {
                self.sink.notify_keyspace_event("generic", "del", key);
            }
        }
        Ok((deleted, key_removed))
    }

    /// Integer increment; preserves the field's deadline.
    pub fn hincrby(&mut self, key: &Bytes, field: &Bytes, delta: i64) -> Result<i64, StoreError> {
        let current = match self.hget(key, field)? {
            GetFieldRes::Ok(v) => std::str::from_utf8(&v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StoreError::NotAnInteger)?,
            _ => 0,
        };
        let new = current.checked_add(delta).ok_or(StoreError::IncrOverflow)?;
        self.hset_raw(
            key,
            field.clone(),
            Bytes::from(new.to_string()),
            SetFlags { keep_ttl: true },
        )?;
        self.dirty += 1;
        self.sink.notify_keyspace_event("hash", "hincrby", key);
        Ok(new)
    }

    /// Float increment; preserves the field's deadline. The formatted
    /// result is re-propagated as an `HSET` so replicas never re-derive
    /// float arithmetic.
    pub fn hincrbyfloat(&mut self, key: &Bytes, field: &Bytes, incr: f64) -> Result<Bytes, StoreError> {
        if incr.is_nan() || incr.is_infinite() {
            return Err(StoreError::NanOrInfinity);
        }
        let current = match self.hget(key, field)? {
            GetFieldRes::Ok(v) => std::str::from_utf8(&v)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or(StoreError::NotAFloat)?,
            _ => 0.0,
        };
        let new = current + incr;
        if new.is_nan() || new.is_infinite() {
            return Err(StoreError::NanOrInfinity);
        }
        let formatted = Bytes::from(format_float(new));
        self.hset_raw(key, field.clone(), formatted.clone(), SetFlags { keep_ttl: true })?;
        self.dirty += 1;
        self.sink.notify_keyspace_event("hash", "hincrbyfloat", key);
        if self.replication_allowed {
            let argv = [
                Bytes::from_static(b"HSET"),
                key.clone(),
                field.clone(),
                formatted.clone(),
            ];
            self.sink.propagate(self.id, &argv);
        }
        Ok(formatted)
    }

    // ========================================================================
    // Per-field expiration
    // ========================================================================

    /// The set-with-expiry batch: init (encoding promotion, minimum
    /// capture), one apply per field, then finalize (events, empty-hash
    /// removal, and the threshold-gated global-index republish).
    ///
    /// Returns `None` when the key does not exist.
    pub fn hash_set_expiry_batch(
        &mut self,
        key: &Bytes,
        expire_at: u64,
        cond: ExpireSetCond,
        field_cond: FieldSetCond,
        fields: &[Bytes],
    ) -> Result<Option<Vec<SetExRes>>, StoreError> {
        let now = self.now_ms;
        let past_deletes = !self.loading && !self.import_mode;
        let mut results = Vec::with_capacity(fields.len());
        let mut key_removed = false;

        {
            let Db { dict, hexpires, sink, replication_allowed, id, dirty, .. } = self;
            let Some(val) = dict.get_mut(key.as_ref() as &[u8]) else {
                return Ok(None);
            };
            let Value::Hash(h) = val else {
                return Err(StoreError::WrongType);
            };

            // Init: make the encoding expiry-capable and capture the
            // registered minimum.
            h.prepare_for_expiry(key);
            let mut state = SetExState::new(h.registered_min_expire());

            // Apply, once per field.
            for f in fields {
                let res = h.set_field_expiry(f, expire_at, field_cond, cond, now, past_deletes, &mut state);
                if res == SetExRes::Deleted {
                    propagate_hdel(sink.as_mut(), replication_allowed, *id, key, f);
                }
                results.push(res);
            }

            // Finalize.
            if state.changed() > 0 {
                *dirty += state.changed();
                sink.notify_keyspace_event("hash", "hexpire", key);

                if state.fields_deleted > 0 && h.is_empty() {
                    key_removed = true;
                } else if state.min_expire_before >= state.min_expire_fields {
                    // The touched fields could have moved the minimum.
                    // Re-publishing per single-field nudge is wasted work;
                    // below the threshold the registration stays put and
                    // the active expirer absorbs the drift within one
                    // scan at bounded cost.
                    let new_min = h.next_time_to_expire();
                    let diff = state.min_expire_before.abs_diff(new_min);
                    if diff >= NEW_EXPIRE_DIFF_THRESHOLD {
                        if state.min_expire_before != EXPIRE_TIME_INVALID {
                            hexpires.remove(key, state.min_expire_before);
                            h.mark_unregistered();
                        }
                        if new_min != EXPIRE_TIME_INVALID {
                            hexpires.add(key.clone(), new_min);
                            h.mark_registered(new_min);
                        }
                    }
                }
            }
        }

        if key_removed {
            drop_key(&mut self.dict, &mut self.hexpires, key);
            self.sink.notify_keyspace_event("generic", "del", key);
        }
        Ok(Some(results))
    }

    /// Re-propagate an accepted expiration command in absolute-millisecond
    /// form so replicas apply the identical deadline regardless of when
    /// they replay it.
    pub fn propagate_hpexpireat(&mut self, key: &Bytes, expire_at: u64, fields: &[Bytes]) {
        if !self.replication_allowed {
            return;
        }
        let mut argv = Vec::with_capacity(5 + fields.len());
        argv.push(Bytes::from_static(b"HPEXPIREAT"));
        argv.push(key.clone());
        argv.push(Bytes::from(expire_at.to_string()));
        argv.push(Bytes::from_static(b"FIELDS"));
        argv.push(Bytes::from(fields.len().to_string()));
        argv.extend(fields.iter().cloned());
        self.sink.propagate(self.id, &argv);
    }

    /// TTL / expire-time query. `as_timestamp` answers the absolute
    /// deadline instead of the remaining time. Returns `None` when the key
    /// does not exist.
    pub fn hash_ttl_batch(
        &self,
        key: &[u8],
        fields: &[Bytes],
        unit: TtlUnit,
        as_timestamp: bool,
    ) -> Result<Option<Vec<i64>>, StoreError> {
        let now = self.now_ms;
        let base = if as_timestamp { 0 } else { now };
        let h = match self.dict.get(key) {
            None => return Ok(None),
            Some(Value::Str(_)) => return Err(StoreError::WrongType),
            Some(Value::Hash(h)) => h,
        };
        let mut out = Vec::with_capacity(fields.len());
        for f in fields {
            let code = match h.get(f) {
                None => -2,
                Some((_, EXPIRE_TIME_INVALID)) => -1,
                // Past its deadline: pretend it is already gone.
                Some((_, d)) if is_past(d, now) => -2,
                Some((_, d)) => match unit {
                    // Seconds round up so a deadline never reads as zero
                    // while still in the future.
                    TtlUnit::Seconds => ((d + 999 - base) / 1000) as i64,
                    TtlUnit::Millis => (d - base) as i64,
                },
            };
            out.push(code);
        }
        Ok(Some(out))
    }

    /// Drop deadlines from fields. Returns `None` when the key does not
    /// exist.
    pub fn hash_persist_batch(
        &mut self,
        key: &Bytes,
        fields: &[Bytes],
    ) -> Result<Option<Vec<PersistRes>>, StoreError> {
        let now = self.now_ms;
        let changed = {
            let h = match self.dict.get_mut(key.as_ref() as &[u8]) {
                None => return Ok(None),
                Some(Value::Str(_)) => return Err(StoreError::WrongType),
                Some(Value::Hash(h)) => h,
            };
            let mut out = Vec::with_capacity(fields.len());
            let mut changed = false;
            for f in fields {
                let res = h.persist_field(f, now);
                changed |= res == PersistRes::Ok;
                out.push(res);
            }
            // The hash's global registration is left as-is even if the
            // persisted field was the minimum; the active expirer
            // re-publishes on its next visit.
            (out, changed)
        };
        if changed.1 {
            self.sink.notify_keyspace_event("hash", "hpersist", key);
        }
        Ok(Some(changed.0))
    }

    // ========================================================================
    // Active expiration
    // ========================================================================

    /// Drain the process-wide index: for each hash whose minimum deadline
    /// has passed, delete due fields (propagating each), then either
    /// re-publish the hash under its next deadline or drop it from the
    /// index — and from the keyspace if it ended up empty.
    ///
    /// At most `max_fields` field deletions happen per call; the walk is
    /// re-entrant, so the next call resumes where this one stopped.
    pub fn active_expire(&mut self, max_fields: u32) -> u64 {
        if max_fields == 0 {
            return 0;
        }
        let now = self.now_ms;
        let mut quota = max_fields as u64;
        let Db { dict, hexpires, sink, replication_allowed, id, dirty, stat_expired_fields, .. } =
            self;

        hexpires.expire(now, u64::MAX, |key| {
            if quota == 0 {
                return ExpireAction::Stop;
            }
            let Some(Value::Hash(h)) = dict.get_mut(key.as_ref() as &[u8]) else {
                // Stale registration; nothing to expire under this key.
                return ExpireAction::Remove;
            };

            let (expired, next) = h.expire_fields(now, quota, |field| {
                propagate_hdel(sink.as_mut(), replication_allowed, *id, key, field);
            });
            quota -= expired;
            *stat_expired_fields += expired;

            if next == EXPIRE_TIME_INVALID {
                h.mark_unregistered();
                if h.is_empty() {
                    dict.remove(key.as_ref() as &[u8]);
                    sink.notify_keyspace_event("generic", "del", key);
                    *dirty += 1;
                }
                ExpireAction::Remove
            } else {
                h.mark_registered(next);
                ExpireAction::UpdateKeyTo(next)
            }
        });

        let expired = max_fields as u64 - quota;
        if expired > 0 {
            debug!(expired, "active-expired hash fields");
        }
        expired
    }

    /// One sweeper cycle under the configured quota.
    pub fn active_expire_cycle(&mut self) -> u64 {
        self.active_expire(self.config.active_expire_quota_per_cycle)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn hash_ref(&self, key: &[u8]) -> Result<&HashValue, StoreError> {
        match self.dict.get(key) {
            Some(Value::Hash(h)) => Ok(h),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            None => Err(StoreError::NoSuchKey),
        }
    }

    fn hash_mut(&mut self, key: &[u8]) -> Result<&mut HashValue, StoreError> {
        match self.dict.get_mut(key) {
            Some(Value::Hash(h)) => Ok(h),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            None => Err(StoreError::NoSuchKey),
        }
    }

    /// Rebuild a compact hash as a table, keeping its global-index
    /// registration consistent across the rebuild.
    fn convert_to_table_registered(&mut self, key: &Bytes) {
        let Db { dict, hexpires, .. } = self;
        let Some(Value::Hash(h)) = dict.get_mut(key.as_ref() as &[u8]) else {
            return;
        };
        if h.encoding() == HashEncoding::Ht {
            return;
        }
        let registered = h.registered_min_expire();
        if registered != EXPIRE_TIME_INVALID {
            hexpires.remove(key, registered);
            h.mark_unregistered();
        }
        let min = h.convert_to_table(key);
        if min != EXPIRE_TIME_INVALID {
            hexpires.add(key.clone(), min);
            h.mark_registered(min);
        }
    }

    /// Install a value produced by the snapshot loader, registering a hash
    /// in the global index under its minimum deadline.
    pub(crate) fn install_loaded_value(&mut self, key: Bytes, val: Value) {
        drop_key(&mut self.dict, &mut self.hexpires, &key);
        let min = match &val {
            Value::Hash(h) => h.next_time_to_expire(),
            Value::Str(_) => EXPIRE_TIME_INVALID,
        };
        self.dict.insert(key.clone(), val);
        if min != EXPIRE_TIME_INVALID {
            if let Some(Value::Hash(h)) = self.dict.get_mut(key.as_ref() as &[u8]) {
                h.update_key_ref(key.clone());
                self.hexpires.add(key.clone(), min);
                h.mark_registered(min);
            }
        }
    }
}

/// Remove a key, unlinking a hash value from the global index first.
/// Returns true if the key existed.
fn drop_key(dict: &mut HashMap<Bytes, Value>, hexpires: &mut EBuckets<Bytes>, key: &Bytes) -> bool {
    drop_key_registration(dict, hexpires, key);
    dict.remove(key.as_ref() as &[u8]).is_some()
}

fn drop_key_registration(
    dict: &mut HashMap<Bytes, Value>,
    hexpires: &mut EBuckets<Bytes>,
    key: &Bytes,
) {
    if let Some(Value::Hash(h)) = dict.get_mut(key.as_ref() as &[u8]) {
        let registered = h.registered_min_expire();
        if registered != EXPIRE_TIME_INVALID {
            hexpires.remove(key, registered);
            h.mark_unregistered();
        }
    }
}

/// Ship a synthesized `HDEL key field` through the sink, inside an
/// execution unit and with replication force-enabled for the duration.
fn propagate_hdel(
    sink: &mut dyn EngineSink,
    replication_allowed: &mut bool,
    db_id: u32,
    key: &Bytes,
    field: &Bytes,
) {
    let argv = [Bytes::from_static(b"HDEL"), key.clone(), field.clone()];
    sink.begin_unit();
    let prev = *replication_allowed;
    *replication_allowed = true;
    sink.propagate(db_id, &argv);
    *replication_allowed = prev;
    sink.end_unit();
    sink.post_unit();
}

/// Shortest round-trip formatting; replicas receive this exact string via
/// the `HSET` rewrite, so formatting differences can never diverge them.
fn format_float(v: f64) -> String {
    format!("{v}")
}
