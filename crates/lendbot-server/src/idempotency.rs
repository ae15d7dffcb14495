//! Deduplication of at-least-once webhook deliveries.

use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::store::SharedStore;

pub struct IdempotencyGate {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
}

impl IdempotencyGate {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            ttl_ms: ttl_secs.saturating_mul(1000) as i64,
        }
    }

    /// True when `event_id` was already admitted within the TTL. The first
    /// caller records it. A store failure admits the event.
    pub async fn seen(&self, event_id: &str) -> bool {
        if event_id.is_empty() {
            return false;
        }
        let now_ms = self.clock.now_ms();
        let first = {
            let mut store = self.store.lock().await;
            store.inner_mut().mark_seen(event_id, now_ms, self.ttl_ms)
        };
        match first {
            Ok(first) => !first,
            Err(e) => {
                warn!(event_id, error = %e, "idempotency store unavailable, processing event");
                false
            }
        }
    }

    /// Forgets `event_id` so a redelivery is processed again. Used when
    /// handling failed before any effect was committed.
    pub async fn release(&self, event_id: &str) {
        let result = {
            let mut store = self.store.lock().await;
            store.inner_mut().forget_seen(event_id)
        };
        if let Err(e) = result {
            warn!(event_id, error = %e, "could not release idempotency key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, SqliteStore, StoreBackend};
    use tokio::sync::Mutex;

    fn gate(clock: Arc<ManualClock>) -> IdempotencyGate {
        let store = Arc::new(Mutex::new(StoreBackend::Memory(MemoryStore::default())));
        IdempotencyGate::new(store, clock, 3_600)
    }

    #[tokio::test]
    async fn repeat_within_ttl_is_seen() {
        let clock = Arc::new(ManualClock::new(1_000));
        let gate = gate(clock.clone());
        assert!(!gate.seen("ev1").await);
        assert!(gate.seen("ev1").await);
        clock.advance(3_600_000);
        assert!(!gate.seen("ev1").await);
    }

    #[tokio::test]
    async fn released_key_is_processed_again() {
        let gate = gate(Arc::new(ManualClock::new(0)));
        assert!(!gate.seen("ev1").await);
        gate.release("ev1").await;
        assert!(!gate.seen("ev1").await);
    }

    #[tokio::test]
    async fn concurrent_deliveries_admit_one() {
        let gate = Arc::new(gate(Arc::new(ManualClock::new(0))));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.seen("ev-burst").await }));
        }
        let mut admitted = 0;
        for h in handles {
            if !h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn broken_store_degrades_to_processing() {
        let path = std::env::temp_dir()
            .join(format!("lendbot-idem-{}.db", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string();
        let store = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE seen_events;")
            .unwrap();
        let gate = IdempotencyGate::new(
            Arc::new(Mutex::new(store)),
            Arc::new(ManualClock::new(0)),
            60,
        );
        assert!(!gate.seen("ev1").await);
        assert!(!gate.seen("ev1").await);
    }
}
