//! # EmberKV — In-Memory Key-Value Store with Per-Field Hash TTLs
//!
//! EmberKV is a Redis-protocol, in-memory key-value server whose
//! specialty is hash values where *individual fields* carry deadlines:
//! `HEXPIRE user:1 60 FIELDS 1 session` arms a 60-second fuse on one field
//! and leaves the rest of the hash alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  TCP listener ─▶ connection tasks ─▶ CommandHandler              │
//! │                                          │                       │
//! │                                          ▼  one owner lock       │
//! │                                   StorageEngine / Db             │
//! │     keyspace: key ─▶ hash (listpack | listpackex | hashtable)    │
//! │     global HFE index: hash keyed by its minimum field deadline   │
//! │     sink: synthesized HDELs + keyspace events                    │
//! │                                          ▲                       │
//! │                 ExpirySweeper (Tokio task, quota per cycle)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## How fields expire
//!
//! - **Lazily**: any read that touches a field past its deadline deletes
//!   it first and answers as if it were gone, emitting a synthesized
//!   `HDEL` to the replication/persistence sink.
//! - **Actively**: a background sweeper walks the global index — every
//!   hash registered under its minimum field deadline — and deletes due
//!   fields under a per-cycle budget, so unread fields get reclaimed too.
//!
//! Small hashes live in compact list encodings (deadline-sorted triples
//! once any field has a TTL) and upgrade to a real table past the
//! configured entry-count / value-length bounds. Encoding never leaks
//! outside the storage layer except through `OBJECT ENCODING`.
//!
//! ## Module map
//!
//! - [`protocol`]: RESP2 value model and incremental decoder
//! - [`storage`]: keyspace, hash encodings, expiration machinery
//! - [`commands`]: command dispatch
//! - [`connection`]: per-client connection loop

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{decode, ProtoError, RespValue};
pub use storage::{
    start_expiry_sweeper, EngineConfig, ExpiryConfig, ExpirySweeper, StorageEngine,
};

/// Default listen port (Redis-compatible).
pub const DEFAULT_PORT: u16 = 6379;

pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
