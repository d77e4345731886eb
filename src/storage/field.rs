//! Hash field with inline expiration metadata.
//!
//! Fields are immutable byte strings. A field that has ever carried a
//! deadline also carries a small metadata block recording the deadline and
//! whether the field is currently linked in its hash's private expiration
//! index. Fields without the block stay as small as a plain string.

use crate::storage::ebuckets::{ExpireMeta, EXPIRE_TIME_INVALID};
use bytes::Bytes;

/// A hash field: name bytes plus an optional expiration metadata block.
///
/// Inside the hash-table encoding, the name shares its buffer with the map
/// key, so carrying it here costs a reference count, not a copy.
#[derive(Debug, Clone)]
pub struct HField {
    name: Bytes,
    meta: Option<ExpireMeta>,
}

impl HField {
    /// A plain field with no metadata block reserved.
    pub fn new(name: Bytes) -> Self {
        Self { name, meta: None }
    }

    /// A field with the metadata block reserved, initially detached.
    pub fn new_with_expiry(name: Bytes) -> Self {
        Self { name, meta: Some(ExpireMeta::detached()) }
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.name.len()
    }

    /// Whether the metadata block is reserved (not whether a deadline is
    /// currently set — a persisted field keeps its block, detached).
    pub fn is_expire_attached(&self) -> bool {
        self.meta.is_some()
    }

    /// The field's deadline, or [`EXPIRE_TIME_INVALID`] if it has no block
    /// or the block is detached.
    pub fn expire_time(&self) -> u64 {
        match &self.meta {
            Some(m) => m.expire_time(),
            None => EXPIRE_TIME_INVALID,
        }
    }

    /// Reserve the metadata block if absent. First step of attaching a
    /// deadline to a field created without one.
    pub fn reserve_expire_meta(&mut self) {
        if self.meta.is_none() {
            self.meta = Some(ExpireMeta::detached());
        }
    }

    /// Record that the field was linked in its hash's private index under
    /// `expire_at`. The block must already be reserved.
    pub fn attach_expire(&mut self, expire_at: u64) {
        self.meta
            .as_mut()
            .expect("expire metadata block not reserved")
            .attach(expire_at);
    }

    /// Drop the deadline. The block stays reserved; only the link state
    /// changes. Unlinking from the private index is the caller's step.
    pub fn detach_expire(&mut self) {
        if let Some(m) = &mut self.meta {
            m.detach();
        }
    }
}
