//! Per-member tracking of the single live card.
//!
//! A member's record holds the message id and send time of the last card
//! issued to them. Expiry is lazy: a card older than the freshness window
//! is treated as gone the next time it is looked at.

use std::sync::Arc;

use lendbot_kernel::gate::is_fresh;
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::BotError;
use crate::gateway::MessagingGateway;
use crate::store::SharedStore;

pub struct CardLifecycleManager {
    store: SharedStore,
    messaging: Arc<dyn MessagingGateway>,
    clock: Arc<dyn Clock>,
    freshness_secs: u64,
}

impl CardLifecycleManager {
    pub fn new(
        store: SharedStore,
        messaging: Arc<dyn MessagingGateway>,
        clock: Arc<dyn Clock>,
        freshness_secs: u64,
    ) -> Self {
        Self {
            store,
            messaging,
            clock,
            freshness_secs,
        }
    }

    /// Recalls the member's previous card (best effort), sends `card` and
    /// records it as the live one. The member must already be registered.
    pub async fn issue_new_card(&self, user_id: &str, card: &Value) -> Result<String, BotError> {
        let previous = {
            let store = self.store.lock().await;
            store
                .inner()
                .member(user_id)?
                .ok_or_else(|| BotError::NotFound(format!("member {user_id}")))?
                .card_message_id
        };
        if let Some(previous) = previous {
            if let Err(e) = self.messaging.recall(&previous).await {
                warn!(user_id, message_id = %previous, error = %e, "recall of previous card failed");
            }
        }

        let sent = self.messaging.send_card(user_id, card).await?;
        let now_ms = self.clock.now_ms();
        {
            let mut store = self.store.lock().await;
            store
                .inner_mut()
                .set_card(user_id, Some((&sent.message_id, now_ms)))?;
        }
        info!(user_id, message_id = %sent.message_id, "issued card");
        Ok(sent.message_id)
    }

    /// The member's live card id, if it is still within the freshness window.
    pub async fn is_alive(&self, user_id: &str) -> Result<Option<String>, BotError> {
        let member = {
            let store = self.store.lock().await;
            store.inner().member(user_id)?
        };
        let now_ms = self.clock.now_ms();
        Ok(member.and_then(|m| match (m.card_message_id, m.card_created_ms) {
            (Some(id), Some(created)) if is_fresh(created, now_ms, self.freshness_secs) => Some(id),
            _ => None,
        }))
    }

    /// Fails with `StaleCard` unless `message_id` is the member's live card.
    /// The stale card is recalled.
    pub async fn check_action(&self, user_id: &str, message_id: &str) -> Result<(), BotError> {
        match self.is_alive(user_id).await? {
            Some(alive) if alive == message_id => Ok(()),
            alive => {
                warn!(user_id, message_id, alive = ?alive, "action on stale card");
                if let Err(e) = self.messaging.recall(message_id).await {
                    warn!(user_id, message_id, error = %e, "recall of stale card failed");
                }
                Err(BotError::StaleCard)
            }
        }
    }
}
