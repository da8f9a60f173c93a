//! Optional client-side offline queue.
//!
//! Holds already-sealed envelopes for recipients that were offline at send
//! time, so the client can retry later. Records expire after 24 hours and are
//! swept at startup and every 5 minutes. The queue only ever stores sealed
//! envelopes — never plaintext — and the relay is oblivious to it: real-time
//! only delivery on the server is not weakened by this convenience.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;

use crate::envelope::WireEnvelope;
use crate::error::KeystoreError;
use crate::storage::KeyValueStore;

/// Record retention period.
pub const QUEUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Periodic sweep interval.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const KEY_PREFIX: &str = "queue_";

/// A sealed envelope waiting for its recipient to come online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    pub recipient_id: u64,
    pub envelope: WireEnvelope,
    pub queued_at: i64,
}

/// Keyed store of pending envelopes with a 24-hour TTL.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl OfflineQueue {
    /// Open the queue and run the startup sweep.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, KeystoreError> {
        let queue = Self {
            store,
            ttl: QUEUE_TTL,
        };
        let purged = queue.purge_expired()?;
        if purged > 0 {
            tracing::debug!(purged, "offline queue startup sweep");
        }
        Ok(queue)
    }

    #[cfg(test)]
    fn with_ttl(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Queue a sealed envelope. Returns the record key.
    pub fn enqueue(
        &self,
        recipient_id: u64,
        envelope: WireEnvelope,
    ) -> Result<String, KeystoreError> {
        let record = QueuedEnvelope {
            recipient_id,
            envelope,
            queued_at: chrono::Utc::now().timestamp(),
        };
        let key = format!("{KEY_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let raw = serde_json::to_string(&record)
            .map_err(|e| KeystoreError::Storage(format!("serialize queue record: {e}")))?;
        self.store.put(&key, &raw)?;
        Ok(key)
    }

    /// Remove and return all unexpired records for `recipient_id`.
    pub fn drain_for(&self, recipient_id: u64) -> Result<Vec<QueuedEnvelope>, KeystoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut drained = Vec::new();
        for key in self.queue_keys()? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<QueuedEnvelope>(&raw) else {
                // unreadable record: drop it rather than poison every drain
                self.store.delete(&key)?;
                continue;
            };
            if self.expired(now, record.queued_at) {
                self.store.delete(&key)?;
                continue;
            }
            if record.recipient_id == recipient_id {
                self.store.delete(&key)?;
                drained.push(record);
            }
        }
        drained.sort_by_key(|r| r.queued_at);
        Ok(drained)
    }

    /// Delete every record older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, KeystoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut purged = 0;
        for key in self.queue_keys()? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let stale = match serde_json::from_str::<QueuedEnvelope>(&raw) {
                Ok(record) => self.expired(now, record.queued_at),
                Err(_) => true,
            };
            if stale {
                self.store.delete(&key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Spawn the 5-minute background sweep.
    pub fn spawn_purge_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                match queue.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "offline queue sweep"),
                    Err(e) => tracing::warn!("offline queue sweep failed: {e}"),
                }
            }
        })
    }

    fn expired(&self, now: i64, queued_at: i64) -> bool {
        now.saturating_sub(queued_at) > self.ttl.as_secs() as i64
    }

    fn queue_keys(&self) -> Result<Vec<String>, KeystoreError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn wire_fixture() -> WireEnvelope {
        WireEnvelope {
            kem_ciphertext: "a2Vt".to_string(),
            iv: "aXY=".to_string(),
            ciphertext: "Y3Q=".to_string(),
            auth_tag: "dGFn".to_string(),
            signature: "c2ln".to_string(),
        }
    }

    #[test]
    fn enqueue_and_drain_by_recipient() {
        let queue = OfflineQueue::open(Arc::new(MemoryStore::new())).unwrap();
        queue.enqueue(11, wire_fixture()).unwrap();
        queue.enqueue(11, wire_fixture()).unwrap();
        queue.enqueue(12, wire_fixture()).unwrap();

        let for_bob = queue.drain_for(11).unwrap();
        assert_eq!(for_bob.len(), 2);
        // drained records are gone
        assert!(queue.drain_for(11).unwrap().is_empty());
        // other recipients untouched
        assert_eq!(queue.drain_for(12).unwrap().len(), 1);
    }

    #[test]
    fn expired_records_are_purged() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::with_ttl(Arc::clone(&store), Duration::from_secs(0));
        queue.enqueue(11, wire_fixture()).unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(queue.purge_expired().unwrap(), 1);
        assert!(queue.drain_for(11).unwrap().is_empty());
    }

    #[test]
    fn unreadable_records_are_dropped() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.put("queue_garbage", "not json").unwrap();
        let queue = OfflineQueue::open(Arc::clone(&store)).unwrap();
        assert!(queue.drain_for(11).unwrap().is_empty());
        assert!(store.get("queue_garbage").unwrap().is_none());
    }

    #[test]
    fn startup_sweep_removes_stale_records() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let old = QueuedEnvelope {
            recipient_id: 11,
            envelope: wire_fixture(),
            queued_at: chrono::Utc::now().timestamp() - 25 * 60 * 60,
        };
        store
            .put("queue_old", &serde_json::to_string(&old).unwrap())
            .unwrap();

        let queue = OfflineQueue::open(Arc::clone(&store)).unwrap();
        assert!(queue.drain_for(11).unwrap().is_empty());
    }
}
