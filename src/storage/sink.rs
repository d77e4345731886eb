//! Replication / persistence sink.
//!
//! Every engine-initiated mutation that must reach replicas and the append
//! log goes through one entry point. Expiration-driven field deletions are
//! synthesized as `HDEL key field` and pushed here so that replicas observe
//! the exact same field-level deletions, at the same logical point, that the
//! primary performed — wall-clock drift between machines never enters the
//! picture.
//!
//! Propagation calls are wrapped in execution-unit brackets so a sink that
//! batches (transactions, AOF buffers) can coalesce them with surrounding
//! work.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Injectable propagation target. One per database instance.
pub trait EngineSink: Send {
    /// Open an execution unit. Units may nest.
    fn begin_unit(&mut self);

    /// Close the innermost execution unit.
    fn end_unit(&mut self);

    /// Flush work queued while the unit was open. Called after `end_unit`
    /// once the unit depth returns to zero.
    fn post_unit(&mut self);

    /// Enqueue a synthetic command for the append log and replicas.
    fn propagate(&mut self, db_id: u32, argv: &[Bytes]);

    /// Publish a keyspace notification (`class` is the event family, e.g.
    /// "hash" or "generic").
    fn notify_keyspace_event(&mut self, class: &str, event: &str, key: &Bytes);
}

/// Production sink: logs what would be shipped. Wire an actual replication
/// stream or AOF writer in by implementing [`EngineSink`] instead.
#[derive(Debug, Default)]
pub struct LogSink {
    unit_depth: u32,
}

impl EngineSink for LogSink {
    fn begin_unit(&mut self) {
        self.unit_depth += 1;
    }

    fn end_unit(&mut self) {
        self.unit_depth = self.unit_depth.saturating_sub(1);
    }

    fn post_unit(&mut self) {}

    fn propagate(&mut self, db_id: u32, argv: &[Bytes]) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let rendered: Vec<String> = argv
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect();
            debug!(db = db_id, cmd = ?rendered, "propagate");
        }
    }

    fn notify_keyspace_event(&mut self, class: &str, event: &str, key: &Bytes) {
        debug!(class, event, key = %String::from_utf8_lossy(key), "keyspace event");
    }
}

/// Everything a recording sink captured, for assertions.
#[derive(Debug, Default)]
pub struct SinkRecord {
    /// Propagated commands in order, each as `(db_id, argv)`.
    pub commands: Vec<(u32, Vec<Bytes>)>,
    /// Keyspace events in order, each as `(class, event, key)`.
    pub events: Vec<(String, String, Bytes)>,
    /// Units opened / closed, to check bracket discipline.
    pub units_opened: u32,
    pub units_closed: u32,
}

impl SinkRecord {
    /// Count of propagated commands whose argv matches exactly.
    pub fn count_command(&self, argv: &[&[u8]]) -> usize {
        self.commands
            .iter()
            .filter(|(_, cmd)| {
                cmd.len() == argv.len()
                    && cmd.iter().zip(argv).all(|(a, b)| a.as_ref() == *b)
            })
            .count()
    }

    /// Count of `(event, key)` notifications, any class.
    pub fn count_event(&self, event: &str, key: &[u8]) -> usize {
        self.events
            .iter()
            .filter(|(_, e, k)| e == event && k.as_ref() == key)
            .count()
    }
}

/// Test sink capturing every call behind a shared handle.
#[derive(Debug, Default)]
pub struct RecordingSink {
    record: Arc<Mutex<SinkRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that stays valid after the sink is moved into the engine.
    pub fn handle(&self) -> Arc<Mutex<SinkRecord>> {
        Arc::clone(&self.record)
    }
}

impl EngineSink for RecordingSink {
    fn begin_unit(&mut self) {
        self.record.lock().unwrap().units_opened += 1;
    }

    fn end_unit(&mut self) {
        self.record.lock().unwrap().units_closed += 1;
    }

    fn post_unit(&mut self) {}

    fn propagate(&mut self, db_id: u32, argv: &[Bytes]) {
        self.record
            .lock()
            .unwrap()
            .commands
            .push((db_id, argv.to_vec()));
    }

    fn notify_keyspace_event(&mut self, class: &str, event: &str, key: &Bytes) {
        self.record.lock().unwrap().events.push((
            class.to_string(),
            event.to_string(),
            key.clone(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_captures_in_order() {
        let sink = RecordingSink::new();
        let handle = sink.handle();
        let mut sink: Box<dyn EngineSink> = Box::new(sink);

        sink.begin_unit();
        sink.propagate(0, &[Bytes::from("HDEL"), Bytes::from("k"), Bytes::from("f")]);
        sink.end_unit();
        sink.post_unit();
        sink.notify_keyspace_event("generic", "del", &Bytes::from("k"));

        let rec = handle.lock().unwrap();
        assert_eq!(rec.commands.len(), 1);
        assert_eq!(rec.count_command(&[b"HDEL", b"k", b"f"]), 1);
        assert_eq!(rec.count_event("del", b"k"), 1);
        assert_eq!(rec.units_opened, 1);
        assert_eq!(rec.units_closed, 1);
    }
}
