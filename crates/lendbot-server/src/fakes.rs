//! In-memory gateways. They record every outbound call so tests can
//! assert on what would have reached the platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use lendbot_contracts::{ApprovalInstanceDetail, TimelineEntry};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::gateway::{ApprovalGateway, CreateInstance, GatewayError, MessagingGateway, SentMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Card {
        user_id: String,
        message_id: String,
        card: Value,
    },
    Text {
        user_id: String,
        message_id: String,
        text: String,
    },
}

#[derive(Default)]
pub struct RecordingMessenger {
    next_id: AtomicU64,
    fail_recall: AtomicBool,
    sent: Mutex<Vec<Outbound>>,
    recalled: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, Value)>>,
}

impl RecordingMessenger {
    pub fn fail_recalls(&self, fail: bool) {
        self.fail_recall.store(fail, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().await.clone()
    }

    pub async fn texts_to(&self, user_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|m| match m {
                Outbound::Text { user_id: to, text, .. } if to == user_id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn recalled(&self) -> Vec<String> {
        self.recalled.lock().await.clone()
    }

    pub async fn updates(&self) -> Vec<(String, Value)> {
        self.updates.lock().await.clone()
    }

    fn next_message_id(&self) -> String {
        format!("om_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl MessagingGateway for RecordingMessenger {
    async fn send_card(&self, user_id: &str, card: &Value) -> Result<SentMessage, GatewayError> {
        let message_id = self.next_message_id();
        self.sent.lock().await.push(Outbound::Card {
            user_id: user_id.to_string(),
            message_id: message_id.clone(),
            card: card.clone(),
        });
        Ok(SentMessage { message_id })
    }

    async fn send_text(&self, user_id: &str, text: &str) -> Result<SentMessage, GatewayError> {
        let message_id = self.next_message_id();
        self.sent.lock().await.push(Outbound::Text {
            user_id: user_id.to_string(),
            message_id: message_id.clone(),
            text: text.to_string(),
        });
        Ok(SentMessage { message_id })
    }

    async fn recall(&self, message_id: &str) -> Result<(), GatewayError> {
        if self.fail_recall.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("recall unavailable".into()));
        }
        self.recalled.lock().await.push(message_id.to_string());
        Ok(())
    }

    async fn update_card(&self, token: &str, card: &Value) -> Result<(), GatewayError> {
        self.updates
            .lock()
            .await
            .push((token.to_string(), card.clone()));
        Ok(())
    }
}

/// Approval system double. Instances are keyed by the request uuid the
/// way the platform dedupes creates.
#[derive(Default)]
pub struct ScriptedApprovals {
    next_id: AtomicU64,
    fail_next_create: Mutex<Option<GatewayError>>,
    created: Mutex<Vec<CreateInstance>>,
    by_uuid: Mutex<HashMap<String, String>>,
    instances: Mutex<HashMap<String, ApprovalInstanceDetail>>,
}

impl ScriptedApprovals {
    pub async fn fail_next_create(&self, err: GatewayError) {
        *self.fail_next_create.lock().await = Some(err);
    }

    pub async fn created(&self) -> Vec<CreateInstance> {
        self.created.lock().await.clone()
    }

    /// Appends a decision step by `operator` to the instance timeline.
    pub async fn decide(&self, instance_code: &str, operator: &str) {
        if let Some(detail) = self.instances.lock().await.get_mut(instance_code) {
            detail.timeline.push(TimelineEntry {
                user_id: Some(operator.to_string()),
                kind: Some("PASS".to_string()),
            });
        }
    }
}

#[async_trait]
impl ApprovalGateway for ScriptedApprovals {
    async fn create_instance(&self, request: &CreateInstance) -> Result<String, GatewayError> {
        if let Some(err) = self.fail_next_create.lock().await.take() {
            return Err(err);
        }
        let mut by_uuid = self.by_uuid.lock().await;
        if let Some(code) = by_uuid.get(&request.uuid) {
            return Ok(code.clone());
        }
        let code = format!("inst-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let form = serde_json::to_string(&request.form)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        self.instances.lock().await.insert(
            code.clone(),
            ApprovalInstanceDetail {
                user_id: Some(request.user_id.clone()),
                form,
                timeline: vec![TimelineEntry {
                    user_id: Some(request.user_id.clone()),
                    kind: Some("START".to_string()),
                }],
            },
        );
        by_uuid.insert(request.uuid.clone(), code.clone());
        self.created.lock().await.push(request.clone());
        Ok(code)
    }

    async fn fetch_instance(
        &self,
        instance_code: &str,
    ) -> Result<ApprovalInstanceDetail, GatewayError> {
        self.instances
            .lock()
            .await
            .get(instance_code)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: 1_390_001,
                msg: format!("instance {instance_code} not found"),
            })
    }

    async fn subscribe(&self, _approval_code: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}
