//! Thread-safe engine facade.
//!
//! Data structures here are coupled across keys: the process-wide
//! expiration index references hashes, hashes reference their keyspace
//! names, and a single write can touch both. So the engine runs with one
//! logical owner — a mutex around [`Db`] — and every command executes as
//! one closed critical section. The command-time snapshot is refreshed at
//! the lock boundary, which gives each command a single consistent notion
//! of "now".
//!
//! Socket I/O stays outside the lock; connection tasks only take it for the
//! execute step. The background sweeper takes the same lock once per cycle.

use crate::storage::db::{Db, EngineConfig};
use crate::storage::sink::EngineSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Shared handle to the database. Wrap in an `Arc` and hand to connection
/// tasks and the sweeper.
pub struct StorageEngine {
    db: Mutex<Db>,
    commands_processed: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field(
                "commands_processed",
                &self.commands_processed.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            db: Mutex::new(Db::new(config)),
            commands_processed: AtomicU64::new(0),
        }
    }

    /// Build with an injected propagation sink (replication stream, append
    /// log, or a recording sink in tests).
    pub fn with_sink(config: EngineConfig, sink: Box<dyn EngineSink>) -> Self {
        Self {
            db: Mutex::new(Db::with_sink(config, sink)),
            commands_processed: AtomicU64::new(0),
        }
    }

    /// Run one command against the database. Takes the owner lock and
    /// refreshes the command-time snapshot first.
    pub fn command<R>(&self, f: impl FnOnce(&mut Db) -> R) -> R {
        let mut db = self.db.lock().unwrap();
        db.begin_command();
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        f(&mut db)
    }

    /// One active-expire cycle under the configured quota. Returns
    /// `(fields_expired, quota)` so the caller can tell a saturated cycle
    /// from an idle one.
    pub fn active_expire_cycle(&self) -> (u64, u32) {
        let mut db = self.db.lock().unwrap();
        db.begin_command();
        let quota = db.config().active_expire_quota_per_cycle;
        (db.active_expire_cycle(), quota)
    }

    pub fn key_count(&self) -> usize {
        self.db.lock().unwrap().key_count()
    }

    pub fn expired_fields(&self) -> u64 {
        self.db.lock().unwrap().expired_fields()
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}
