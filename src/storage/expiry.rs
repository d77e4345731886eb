//! Background active-expire sweeper.
//!
//! Lazy expiration only reclaims fields somebody reads. The sweeper drains
//! the process-wide expiration index on a timer so that fields nobody
//! touches are reclaimed too, each cycle bounded by the configured
//! field-deletion quota.
//!
//! The interval adapts: a cycle that saturates its quota means a backlog,
//! so the sweeper speeds up; an idle cycle backs off to save CPU.

use crate::storage::engine::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Sweeper pacing knobs.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Starting interval between cycles.
    pub base_interval: Duration,
    /// Floor when speeding up under backlog.
    pub min_interval: Duration,
    /// Ceiling when backing off.
    pub max_interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to the running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Start the sweeper as a background task.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));
        info!("active-expire sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("active-expire sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("sweeper received shutdown signal");
                    return;
                }
            }
        }

        let (expired, quota) = engine.active_expire_cycle();

        if expired >= quota as u64 && quota > 0 {
            // Quota saturated: there is a backlog behind this cycle.
            interval = (interval / 2).max(config.min_interval);
            debug!(
                expired,
                next_interval_ms = interval.as_millis() as u64,
                "expire quota saturated, speeding up"
            );
        } else if expired == 0 {
            interval = (interval * 2).min(config.max_interval);
            trace!(
                next_interval_ms = interval.as_millis() as u64,
                "idle cycle, backing off"
            );
        } else {
            interval = config.base_interval;
            debug!(expired, "active-expired fields");
        }
    }
}

/// Start the sweeper with default pacing.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash::{ExpireSetCond, FieldSetCond};
    use bytes::Bytes;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn seed_expiring_fields(engine: &StorageEngine, key: &str, n: usize, ttl_ms: u64) {
        let key = b(key);
        engine.command(|db| {
            let pairs: Vec<(Bytes, Bytes)> = (0..n)
                .map(|i| (b(&format!("f{i}")), b("v")))
                .collect();
            db.hset(&key, &pairs).unwrap();
            let fields: Vec<Bytes> = (0..n).map(|i| b(&format!("f{i}"))).collect();
            let deadline = db.now() + ttl_ms;
            db.hash_set_expiry_batch(
                &key,
                deadline,
                ExpireSetCond::None,
                FieldSetCond::DontCreateReportNoField,
                &fields,
            )
            .unwrap();
        });
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_untouched_fields() {
        let engine = Arc::new(StorageEngine::new());
        seed_expiring_fields(&engine, "k", 10, 50);
        engine.command(|db| db.hset(&b("stay"), &[(b("f"), b("v"))]).unwrap());

        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let _sweeper = ExpirySweeper::start(Arc::clone(&engine), config);

        tokio::time::sleep(Duration::from_millis(300)).await;

        // The expiring hash emptied and vanished; the plain one survived.
        assert_eq!(engine.key_count(), 1);
        assert_eq!(engine.expired_fields(), 10);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());
        {
            let _sweeper = ExpirySweeper::start(
                Arc::clone(&engine),
                ExpiryConfig {
                    base_interval: Duration::from_millis(10),
                    ..Default::default()
                },
            );
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        seed_expiring_fields(&engine, "k", 3, 20);
        tokio::time::sleep(Duration::from_millis(150)).await;

        // No sweeper: the fields linger until a read touches them.
        assert_eq!(engine.key_count(), 1);
        assert_eq!(
            engine.command(|db| db.hlen(b"k", true).unwrap()),
            0
        );
    }
}
