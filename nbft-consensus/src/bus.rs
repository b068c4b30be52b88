//! Bus Contract
//!
//! The only channel between actors: append-only streams with per-key
//! monotonic record ids, and key/value maps for round metadata. The core
//! depends on exactly the operations of the [`Bus`] trait and nothing
//! more; [`MemoryBus`] is the in-process implementation backing the round
//! driver and every test.
//!
//! Ordering: records on a single key are totally ordered by append;
//! across keys nothing is assumed.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Flat string-to-string record, the wire form of every message
pub type Fields = HashMap<String, String>;

/// Stream and map keys the protocol publishes under
///
/// External observers depend on these exact names.
pub mod keys {
    /// Coordinator's proposal broadcast
    pub const PREPREPARE1: &str = "nbft:preprepare1";
    /// Coordinator's decided-value broadcast
    pub const PREPREPARE2: &str = "nbft:preprepare2";
    /// Commit records of successful rounds
    pub const COMMIT: &str = "nbft:commit";
    /// Tally results, successful or not
    pub const OUTPREPARE: &str = "nbft:outprepare";

    /// Prepares from the members of one group to its representative
    pub fn inprep1(group_id: usize) -> String {
        format!("nbft:inprep1:{}", group_id)
    }

    /// Aggregates from one group's representative to the coordinator
    pub fn inprep2(group_id: usize) -> String {
        format!("nbft:inprep2:{}", group_id)
    }

    /// Alerts about one group within one round
    pub fn alerts(rid: u64, group_id: usize) -> String {
        format!("nbft:alerts:{}:{}", rid, group_id)
    }

    /// Round configuration map
    pub fn round_config(rid: u64) -> String {
        format!("nbft:round:{}:config", rid)
    }

    /// Node-to-group assignment map
    pub fn groups(rid: u64) -> String {
        format!("nbft:groups:{}", rid)
    }

    /// Group-to-representative map
    pub fn rep(rid: u64) -> String {
        format!("nbft:rep:{}", rid)
    }

    /// Committed decision map
    pub fn decisions(rid: u64) -> String {
        format!("nbft:decisions:{}", rid)
    }

    /// Tally map of value to weighted votes
    pub fn rep_votes(rid: u64) -> String {
        format!("nbft:rep_votes:{}", rid)
    }
}

/// Transport substrate the consensus core runs on
#[async_trait]
pub trait Bus: Send + Sync {
    /// Append a record to a stream, returning its assigned id
    ///
    /// Ids are monotonically increasing per key, starting at 1.
    async fn stream_append(&self, key: &str, fields: Fields) -> Result<u64>;

    /// Read up to `count` records with id strictly greater than `from_id`
    ///
    /// When the stream holds no matching records, waits up to `block_ms`
    /// milliseconds for new data before returning empty.
    async fn stream_scan(
        &self,
        key: &str,
        from_id: u64,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(u64, Fields)>>;

    /// Most recent record of a stream, if any
    async fn stream_last(&self, key: &str) -> Result<Option<(u64, Fields)>>;

    /// All records with id in `lo..=hi`
    async fn stream_range(&self, key: &str, lo: u64, hi: u64) -> Result<Vec<(u64, Fields)>>;

    /// Overwrite the map stored under `key`
    async fn map_set(&self, key: &str, fields: Fields) -> Result<()>;

    /// Read the map stored under `key`
    async fn map_get(&self, key: &str) -> Result<Option<Fields>>;

    /// Drop a stream or map key entirely
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
struct Stream {
    next_id: u64,
    records: Vec<(u64, Fields)>,
}

/// In-process bus: lock-free keyspace, one notifier for blocking scans
#[derive(Default)]
pub struct MemoryBus {
    streams: DashMap<String, Stream>,
    maps: DashMap<String, Fields>,
    appended: Notify,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bus behind a shareable handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn collect(&self, key: &str, from_id: u64, count: usize) -> Vec<(u64, Fields)> {
        match self.streams.get(key) {
            Some(stream) => stream
                .records
                .iter()
                .filter(|(id, _)| *id > from_id)
                .take(count)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn stream_append(&self, key: &str, fields: Fields) -> Result<u64> {
        let id = {
            let mut stream = self.streams.entry(key.to_string()).or_default();
            stream.next_id += 1;
            let id = stream.next_id;
            stream.records.push((id, fields));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn stream_scan(
        &self,
        key: &str,
        from_id: u64,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(u64, Fields)>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);
        loop {
            // Arm the notifier before checking so an append between the
            // check and the wait cannot be missed
            let notified = self.appended.notified();
            let batch = self.collect(key, from_id, count);
            if !batch.is_empty() || block_ms == 0 {
                return Ok(batch);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn stream_last(&self, key: &str) -> Result<Option<(u64, Fields)>> {
        Ok(self
            .streams
            .get(key)
            .and_then(|stream| stream.records.last().cloned()))
    }

    async fn stream_range(&self, key: &str, lo: u64, hi: u64) -> Result<Vec<(u64, Fields)>> {
        Ok(match self.streams.get(key) {
            Some(stream) => stream
                .records
                .iter()
                .filter(|(id, _)| *id >= lo && *id <= hi)
                .cloned()
                .collect(),
            None => Vec::new(),
        })
    }

    async fn map_set(&self, key: &str, fields: Fields) -> Result<()> {
        self.maps.insert(key.to_string(), fields);
        Ok(())
    }

    async fn map_get(&self, key: &str) -> Result<Option<Fields>> {
        Ok(self.maps.get(key).map(|entry| entry.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.streams.remove(key);
        self.maps.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn record(tag: &str) -> Fields {
        Fields::from([("tag".to_string(), tag.to_string())])
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids_per_key() {
        let bus = MemoryBus::new();
        assert_eq!(bus.stream_append("a", record("1")).await.unwrap(), 1);
        assert_eq!(bus.stream_append("a", record("2")).await.unwrap(), 2);
        // Independent counter per key
        assert_eq!(bus.stream_append("b", record("1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_returns_records_after_cursor() {
        let bus = MemoryBus::new();
        for i in 0..5 {
            bus.stream_append("s", record(&i.to_string())).await.unwrap();
        }
        let batch = bus.stream_scan("s", 2, 10, 0).await.unwrap();
        let ids: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 4, 5]);

        let capped = bus.stream_scan("s", 0, 2, 0).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_scan_wakes_on_append() {
        let bus = MemoryBus::shared();
        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.stream_scan("s", 0, 10, 500).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.stream_append("s", record("late")).await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_scan_times_out_empty() {
        let bus = MemoryBus::new();
        let start = tokio::time::Instant::now();
        let batch = bus.stream_scan("nothing", 0, 10, 50).await.unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_last_and_range() {
        let bus = MemoryBus::new();
        assert!(bus.stream_last("s").await.unwrap().is_none());
        for i in 0..4 {
            bus.stream_append("s", record(&i.to_string())).await.unwrap();
        }
        let (id, fields) = bus.stream_last("s").await.unwrap().unwrap();
        assert_eq!(id, 4);
        assert_eq!(fields["tag"], "3");

        let mid = bus.stream_range("s", 2, 3).await.unwrap();
        assert_eq!(mid.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_drops_streams_and_maps() {
        let bus = MemoryBus::new();
        assert_ok!(bus.stream_append("s", record("x")).await);
        assert_ok!(bus.map_set("m", record("y")).await);

        bus.delete("s").await.unwrap();
        bus.delete("m").await.unwrap();

        assert!(bus.stream_last("s").await.unwrap().is_none());
        assert!(bus.map_get("m").await.unwrap().is_none());
        // A recreated stream restarts its id counter
        assert_eq!(bus.stream_append("s", record("z")).await.unwrap(), 1);
    }

    #[test]
    fn test_key_names_are_exact() {
        assert_eq!(keys::PREPREPARE1, "nbft:preprepare1");
        assert_eq!(keys::inprep1(3), "nbft:inprep1:3");
        assert_eq!(keys::inprep2(0), "nbft:inprep2:0");
        assert_eq!(keys::alerts(1, 2), "nbft:alerts:1:2");
        assert_eq!(keys::round_config(1), "nbft:round:1:config");
        assert_eq!(keys::groups(1), "nbft:groups:1");
        assert_eq!(keys::rep(1), "nbft:rep:1");
        assert_eq!(keys::decisions(1), "nbft:decisions:1");
        assert_eq!(keys::rep_votes(1), "nbft:rep_votes:1");
    }
}
