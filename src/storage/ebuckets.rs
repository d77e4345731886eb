//! Expiration Bucket Index
//!
//! A priority index over items tagged with an absolute expiration time in
//! milliseconds. Items are grouped into coarse time buckets so that a write
//! that nudges a deadline by a few milliseconds does not reshuffle the index.
//!
//! The index is used twice by the hash engine:
//!
//! 1. Per hash: every field that carries a deadline is registered in the
//!    hash's private index.
//! 2. Process-wide: every hash that has at least one field with a deadline
//!    is registered under its minimum field deadline, so the active expirer
//!    can find "the next hash with work to do" cheaply.
//!
//! ## Bucketing
//!
//! Bucket keys quantize time to `2^BUCKET_KEY_PRECISION` milliseconds.
//! Items inside one bucket are ordered only up to that precision; callers
//! that need finer ordering re-check the item-level deadline (the expire
//! walk below does exactly that for the head bucket).

use bytes::Bytes;
use std::collections::BTreeMap;

/// Bucket granularity: deadlines are grouped into `2^6 = 64` ms buckets.
pub const BUCKET_KEY_PRECISION: u32 = 6;

/// Largest representable deadline (48-bit milliseconds, ~8900 years).
pub const EXPIRE_TIME_MAX: u64 = (1 << 48) - 1;

/// Sentinel for "no deadline". Compares greater than every valid deadline,
/// which is what makes "no TTL behaves as infinity" comparisons fall out.
pub const EXPIRE_TIME_INVALID: u64 = EXPIRE_TIME_MAX + 1;

/// Minimum change in a hash's minimum deadline that justifies re-publishing
/// it in the process-wide index. Below this, the active expirer absorbs the
/// drift within one scan at bounded cost.
pub const NEW_EXPIRE_DIFF_THRESHOLD: u64 =
    if 4000 > (1 << BUCKET_KEY_PRECISION) { 4000 } else { 1 << BUCKET_KEY_PRECISION };

#[inline]
fn bucket_key(expire_at: u64) -> u64 {
    expire_at >> BUCKET_KEY_PRECISION
}

/// Registration bookkeeping embedded in an indexed item (a field's inline
/// metadata block, or a hash's header).
///
/// Invariant: `!trash` iff the owner is currently linked in exactly one
/// ebuckets instance under `expire_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireMeta {
    expire_at: u64,
    trash: bool,
}

impl ExpireMeta {
    /// A detached ("trash") meta block; the owner is not in any index.
    pub fn detached() -> Self {
        Self { expire_at: 0, trash: true }
    }

    pub fn is_detached(&self) -> bool {
        self.trash
    }

    /// The deadline the owner is registered under, or [`EXPIRE_TIME_INVALID`]
    /// when detached.
    pub fn expire_time(&self) -> u64 {
        if self.trash {
            EXPIRE_TIME_INVALID
        } else {
            self.expire_at
        }
    }

    /// Record a registration under `expire_at`.
    pub fn attach(&mut self, expire_at: u64) {
        debug_assert!(expire_at <= EXPIRE_TIME_MAX);
        self.expire_at = expire_at;
        self.trash = false;
    }

    /// Record removal from the index.
    pub fn detach(&mut self) {
        self.trash = true;
    }
}

impl Default for ExpireMeta {
    fn default() -> Self {
        Self::detached()
    }
}

/// Verdict returned by the expire visitor for each due item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireAction {
    /// Item handled; unlink it from the index. The visitor is responsible
    /// for marking the item's own [`ExpireMeta`] detached.
    Remove,
    /// Item has more work in the future; re-insert it under the new time.
    UpdateKeyTo(u64),
    /// Budget exhausted; stop the walk. The current item stays linked.
    Stop,
}

/// Outcome of one [`EBuckets::expire`] walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireOutcome {
    /// Items removed or re-keyed during this walk.
    pub items_expired: u64,
    /// Earliest deadline still registered after the walk, if any.
    pub next_expire_time: Option<u64>,
}

#[derive(Debug, Clone)]
struct BucketItem<T> {
    expire_at: u64,
    item: T,
}

/// The bucket index. `T` is an opaque item handle — the engine uses key and
/// field names ([`Bytes`]) so that no owning pointers cross structures.
#[derive(Debug, Clone)]
pub struct EBuckets<T = Bytes> {
    buckets: BTreeMap<u64, Vec<BucketItem<T>>>,
    len: usize,
}

impl<T: PartialEq + Clone> EBuckets<T> {
    pub fn new() -> Self {
        Self { buckets: BTreeMap::new(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register `item` under deadline `expire_at`.
    ///
    /// The caller records the same deadline in the item's [`ExpireMeta`];
    /// that value is what [`EBuckets::remove`] later expects.
    pub fn add(&mut self, item: T, expire_at: u64) {
        debug_assert!(expire_at <= EXPIRE_TIME_MAX);
        self.buckets
            .entry(bucket_key(expire_at))
            .or_default()
            .push(BucketItem { expire_at, item });
        self.len += 1;
    }

    /// Unlink `item`, previously registered under `expire_at`.
    ///
    /// Returns false if no such registration exists (caller's meta was
    /// stale); the index is unchanged in that case.
    pub fn remove(&mut self, item: &T, expire_at: u64) -> bool {
        let key = bucket_key(expire_at);
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|b| b.item == *item) else {
            return false;
        };
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.len -= 1;
        true
    }

    /// Earliest registered deadline, if the index is non-empty.
    pub fn next_expire_time(&self) -> Option<u64> {
        // The head bucket strictly precedes every other bucket, so its
        // minimum item is the global minimum.
        self.buckets
            .values()
            .next()
            .and_then(|b| b.iter().map(|i| i.expire_at).min())
    }

    /// How many items would expire at `now`, without touching anything.
    pub fn expire_dry_run(&self, now: u64) -> u64 {
        let mut count = 0;
        for (&key, bucket) in &self.buckets {
            if (key << BUCKET_KEY_PRECISION) > now {
                break;
            }
            count += bucket.iter().filter(|b| b.expire_at <= now).count() as u64;
        }
        count
    }

    /// Walk due items (deadline <= `now`), oldest buckets first, invoking
    /// `on_item` for each and applying its verdict. At most `max_items`
    /// items are processed; the rest stay linked for the next walk.
    pub fn expire<F>(&mut self, now: u64, max_items: u64, mut on_item: F) -> ExpireOutcome
    where
        F: FnMut(&T) -> ExpireAction,
    {
        let mut processed = 0u64;
        // UpdateKeyTo re-insertions are deferred so a re-keyed item cannot
        // be visited twice within one walk.
        let mut pending: Vec<(T, u64)> = Vec::new();

        'walk: while processed < max_items {
            let Some((&key, _)) = self.buckets.iter().next() else {
                break;
            };
            if (key << BUCKET_KEY_PRECISION) > now {
                break;
            }
            let bucket = self.buckets.get_mut(&key).expect("head bucket exists");

            let mut i = 0;
            while i < bucket.len() && processed < max_items {
                if bucket[i].expire_at > now {
                    // Only the bucket covering `now` can mix due and not-yet-
                    // due items; skip and keep scanning it.
                    i += 1;
                    continue;
                }
                match on_item(&bucket[i].item) {
                    ExpireAction::Remove => {
                        bucket.swap_remove(i);
                        self.len -= 1;
                        processed += 1;
                    }
                    ExpireAction::UpdateKeyTo(t) => {
                        let entry = bucket.swap_remove(i);
                        self.len -= 1;
                        pending.push((entry.item, t));
                        processed += 1;
                    }
                    ExpireAction::Stop => {
                        if bucket.is_empty() {
                            self.buckets.remove(&key);
                        }
                        break 'walk;
                    }
                }
            }

            if bucket.is_empty() {
                self.buckets.remove(&key);
            } else if i >= bucket.len() {
                // Leftovers in the head bucket are all beyond `now`, and
                // every later bucket is later still.
                break;
            }
            // Otherwise the budget ran out mid-bucket; loop re-checks it.
        }

        for (item, t) in pending {
            self.add(item, t);
        }

        ExpireOutcome {
            items_expired: processed,
            next_expire_time: self.next_expire_time(),
        }
    }
}

impl<T: PartialEq + Clone> Default for EBuckets<T> {
    fn default() -> Self {
        Self::new()
    }
}
