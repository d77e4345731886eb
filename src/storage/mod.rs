//! Storage engine: keyspace, dual-encoded hashes, per-field expiration.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        StorageEngine                       │
//! │   one owner lock ── Db                                     │
//! │                     ├─ keyspace: key → HashValue | Str     │
//! │                     ├─ global HFE index (EBuckets)         │
//! │                     │    hash ──registered under──▶ min    │
//! │                     │          field deadline              │
//! │                     └─ propagation sink (HDEL, events)     │
//! │                                                            │
//! │   HashValue: Listpack ─▶ ListpackEx ─▶ Ht                  │
//! │              pairs      deadline-      map + private       │
//! │                         sorted triples EBuckets over       │
//! │                                        fields              │
//! └────────────────────────────────────────────────────────────┘
//!                 ▲
//!                 │ one cycle per tick, quota-bounded
//!       ┌─────────┴──────────┐
//!       │   ExpirySweeper    │
//!       │  (Tokio task)      │
//!       └────────────────────┘
//! ```
//!
//! Expired fields are reclaimed lazily by reads and actively by the
//! sweeper; every reclaim is propagated as a synthesized `HDEL` so
//! replicas and the append log observe identical deletions.

pub mod db;
pub mod ebuckets;
pub mod engine;
pub mod expiry;
pub mod field;
pub mod hash;
pub mod listpack;
pub mod sink;
pub mod snapshot;

pub use db::{Db, EngineConfig, GetFieldRes, StoreError, TtlUnit, Value};
pub use ebuckets::{EBuckets, ExpireAction, EXPIRE_TIME_INVALID, EXPIRE_TIME_MAX};
pub use engine::StorageEngine;
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use hash::{ExpireSetCond, FieldSetCond, HashValue, PersistRes, SetExRes};
pub use sink::{EngineSink, LogSink, RecordingSink};
pub use snapshot::{dump_db, load_db, SnapshotError};
