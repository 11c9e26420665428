//! Ephemeral rendezvous store
//!
//! Maps a key (a peer id, or a negotiation slot key) to the most recently
//! published descriptor. Records are visible for `ttl` after their last
//! publish and are evicted lazily on access or by [`RendezvousStore::purge`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Default record time-to-live
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

// ─────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────

/// A published descriptor as seen by readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,

    /// Opaque connection-setup blob
    pub descriptor: serde_json::Value,

    /// Wall-clock publish time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, descriptor: serde_json::Value) -> Self {
        Self {
            peer_id: peer_id.into(),
            descriptor,
            timestamp: Utc::now(),
        }
    }
}

/// Stored record plus the monotonic instant its TTL clock started
#[derive(Debug, Clone)]
struct StoredRecord {
    record: PeerRecord,
    created_at: Instant,
}

impl StoredRecord {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

// ─────────────────────────────────────────────────────────────────
// Rendezvous trait
// ─────────────────────────────────────────────────────────────────

/// Operations shared by the in-process store and the HTTP client
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Upsert a record, resetting its TTL. Last writer wins.
    async fn publish(&self, peer_id: &str, descriptor: serde_json::Value) -> Result<()>;

    /// Current record for `peer_id`, or a not-found error (see [`Error::is_not_found`])
    async fn fetch(&self, peer_id: &str) -> Result<PeerRecord>;

    /// Keys of all non-expired records, in no particular order
    async fn list_active(&self) -> Result<Vec<String>>;
}

/// Shared rendezvous handle
pub type SharedRendezvous = Arc<dyn Rendezvous>;

// ─────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────

/// Thread-safe TTL store backing the signaling server
pub struct RendezvousStore {
    ttl: Duration,
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl RendezvousStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace the record for `peer_id`
    pub fn publish(&self, peer_id: &str, descriptor: serde_json::Value) -> PeerRecord {
        let record = PeerRecord::new(peer_id, descriptor);
        let replaced = self
            .records
            .write()
            .insert(
                peer_id.to_string(),
                StoredRecord {
                    record: record.clone(),
                    created_at: Instant::now(),
                },
            )
            .is_some();

        trace!(peer_id, replaced, "Record published");
        record
    }

    /// Look up a record. A lapsed record is evicted and reported as `Expired`.
    pub fn fetch(&self, peer_id: &str) -> Result<PeerRecord> {
        let mut records = self.records.write();

        match records.get(peer_id) {
            Some(stored) if stored.is_expired(self.ttl) => {
                records.remove(peer_id);
                debug!(peer_id, "Record expired on fetch");
                Err(Error::Expired {
                    peer_id: peer_id.to_string(),
                })
            }
            Some(stored) => Ok(stored.record.clone()),
            None => Err(Error::not_found(peer_id)),
        }
    }

    /// Snapshot of non-expired keys; evicts anything that has lapsed
    pub fn list_active(&self) -> Vec<String> {
        let mut records = self.records.write();
        let ttl = self.ttl;
        records.retain(|_, stored| !stored.is_expired(ttl));
        records.keys().cloned().collect()
    }

    /// Evict every expired record, returning how many were removed
    pub fn purge(&self) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        let ttl = self.ttl;
        records.retain(|_, stored| !stored.is_expired(ttl));
        before - records.len()
    }

    /// Number of stored records, including lapsed ones not yet evicted
    pub fn stored_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for RendezvousStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[async_trait]
impl Rendezvous for RendezvousStore {
    async fn publish(&self, peer_id: &str, descriptor: serde_json::Value) -> Result<()> {
        RendezvousStore::publish(self, peer_id, descriptor);
        Ok(())
    }

    async fn fetch(&self, peer_id: &str) -> Result<PeerRecord> {
        RendezvousStore::fetch(self, peer_id)
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        Ok(RendezvousStore::list_active(self))
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_alice_publish_fetch_expire() {
        let store = RendezvousStore::new(Duration::from_millis(80));
        let d1 = json!({"type": "offer", "sdp": "v=0 D1"});

        store.publish("alice", d1.clone());
        assert_eq!(store.fetch("alice").unwrap().descriptor, d1);
        assert!(store.list_active().contains(&"alice".to_string()));

        tokio::time::sleep(Duration::from_millis(120)).await;

        let err = store.fetch("alice").unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.list_active().contains(&"alice".to_string()));
    }

    #[test]
    fn test_fetch_absent_is_not_found() {
        let store = RendezvousStore::default();
        assert!(matches!(store.fetch("nobody"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_expired_fetch_evicts_record() {
        let store = RendezvousStore::new(Duration::from_millis(20));
        store.publish("bob", json!("x"));
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(store.fetch("bob"), Err(Error::Expired { .. })));
        assert_eq!(store.stored_count(), 0);
        assert!(matches!(store.fetch("bob"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_last_writer_wins() {
        let store = RendezvousStore::default();
        store.publish("carol", json!("first"));
        store.publish("carol", json!("second"));

        assert_eq!(store.fetch("carol").unwrap().descriptor, json!("second"));
        assert_eq!(store.list_active(), vec!["carol".to_string()]);
    }

    #[tokio::test]
    async fn test_republish_resets_ttl() {
        let store = RendezvousStore::new(Duration::from_millis(100));
        store.publish("dave", json!(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.publish("dave", json!(2));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.fetch("dave").unwrap().descriptor, json!(2));
    }

    #[tokio::test]
    async fn test_list_active_excludes_expired() {
        let store = RendezvousStore::new(Duration::from_millis(50));
        store.publish("old", json!(null));
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.publish("fresh", json!(null));

        let active = store.list_active();
        assert_eq!(active, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_counts_evictions() {
        let store = RendezvousStore::new(Duration::from_millis(30));
        store.publish("a", json!(null));
        store.publish("b", json!(null));
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.publish("c", json!(null));

        assert_eq!(store.stored_count(), 3);
        assert_eq!(store.purge(), 2);
        assert_eq!(store.stored_count(), 1);
        assert_eq!(store.purge(), 0);
    }

    #[test]
    fn test_record_wire_format() {
        let record = PeerRecord::new("alice", json!({"sdp": "x"}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["peerId"], "alice");
        assert!(value["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let rendezvous: SharedRendezvous = Arc::new(RendezvousStore::default());
        rendezvous.publish("erin", json!("d")).await.unwrap();
        assert_eq!(rendezvous.fetch("erin").await.unwrap().descriptor, json!("d"));
        assert_eq!(rendezvous.list_active().await.unwrap(), vec!["erin".to_string()]);
    }
}
