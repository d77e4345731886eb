//! Command processing layer.
//!
//! ```text
//! RESP array ──▶ CommandHandler ──▶ StorageEngine (one owner lock
//!                 validate / shape      per command) ──▶ Db
//! ```
//!
//! Hash commands, the per-field expiration family (`HEXPIRE`, `HTTL`,
//! `HPERSIST`, ...), and the small keyspace/server surface the engine
//! needs (`DEL`, `RENAME`, `COPY`, `OBJECT ENCODING`, `CONFIG`, ...).

pub mod handler;

pub use handler::CommandHandler;
