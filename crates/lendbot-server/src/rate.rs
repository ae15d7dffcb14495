//! Per (user, interaction) fixed-window limiter.

use std::sync::Arc;

use lendbot_kernel::gate::{evaluate_rate, rate_key, window_bucket};
use lendbot_kernel::{GateDecision, RateConfig};
use tracing::warn;

use crate::clock::Clock;
use crate::store::SharedStore;

pub struct RateLimiter {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    cfg: RateConfig,
}

impl RateLimiter {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, cfg: RateConfig) -> Self {
        Self { store, clock, cfg }
    }

    pub async fn check(&self, user_id: &str, interaction: &str) -> GateDecision {
        let now_ms = self.clock.now_ms();
        let key = rate_key(user_id, interaction);
        let bucket = window_bucket(now_ms, self.cfg.window_ms);
        let count = {
            let mut store = self.store.lock().await;
            store.inner_mut().hit_rate(&key, bucket)
        };
        match count {
            Ok(count) => evaluate_rate(count, now_ms, &self.cfg),
            Err(e) => {
                warn!(%key, error = %e, "rate store unavailable, allowing");
                GateDecision::Allow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreBackend};
    use tokio::sync::Mutex;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            Arc::new(Mutex::new(StoreBackend::Memory(MemoryStore::default()))),
            clock,
            RateConfig {
                max_requests: 1,
                window_ms: 3_000,
            },
        )
    }

    #[tokio::test]
    async fn second_tap_in_window_is_denied() {
        let clock = Arc::new(ManualClock::new(10_500));
        let limiter = limiter(clock.clone());
        assert_eq!(limiter.check("u1", "menu").await, GateDecision::Allow);
        assert_eq!(
            limiter.check("u1", "menu").await,
            GateDecision::Deny {
                retry_after_ms: 1_500
            }
        );
        clock.advance(1_500);
        assert_eq!(limiter.check("u1", "menu").await, GateDecision::Allow);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter(Arc::new(ManualClock::new(0)));
        assert_eq!(limiter.check("u1", "menu").await, GateDecision::Allow);
        assert_eq!(limiter.check("u1", "submit").await, GateDecision::Allow);
        assert_eq!(limiter.check("u2", "menu").await, GateDecision::Allow);
    }
}
