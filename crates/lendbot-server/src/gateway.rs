//! Outbound calls to the messaging and approval platform.
//!
//! Handlers only see the two traits; [`FeishuClient`] is the HTTP
//! implementation and tests substitute in-memory fakes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use lendbot_config::Platform;
use lendbot_contracts::{ApprovalInstanceDetail, FormField};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The request may or may not have taken effect upstream.
    #[error("transport error: {0}")]
    Transport(String),
    /// The platform answered and refused the request.
    #[error("platform rejected request (code {code}): {msg}")]
    Rejected { code: i64, msg: String },
    #[error("malformed platform response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// True when the platform definitely did not act on the request.
    pub fn is_definitive(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstance {
    pub approval_code: String,
    pub user_id: String,
    pub form: Vec<FormField>,
    /// Platform-side dedupe key for the instance.
    pub uuid: String,
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_card(&self, user_id: &str, card: &Value) -> Result<SentMessage, GatewayError>;
    async fn send_text(&self, user_id: &str, text: &str) -> Result<SentMessage, GatewayError>;
    async fn recall(&self, message_id: &str) -> Result<(), GatewayError>;
    /// Deferred update of the card the callback `token` belongs to.
    async fn update_card(&self, token: &str, card: &Value) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Returns the new instance code.
    async fn create_instance(&self, request: &CreateInstance) -> Result<String, GatewayError>;
    async fn fetch_instance(
        &self,
        instance_code: &str,
    ) -> Result<ApprovalInstanceDetail, GatewayError>;
    async fn subscribe(&self, approval_code: &str) -> Result<(), GatewayError>;
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct FeishuClient {
    host: String,
    app_id: String,
    app_secret: String,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    token: Mutex<Option<CachedToken>>,
    client: Client,
}

impl FeishuClient {
    pub fn new(cfg: &Platform) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            host: cfg.host.trim_end_matches('/').to_string(),
            app_id: cfg.app_id.clone(),
            app_secret: cfg.app_secret.clone(),
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            token: Mutex::new(None),
            client,
        })
    }

    async fn tenant_token(&self) -> Result<String, GatewayError> {
        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let body = self
            .send_with_retries(
                Method::POST,
                "/open-apis/auth/v3/tenant_access_token/internal",
                None,
                Some(json!({"app_id": self.app_id, "app_secret": self.app_secret})),
            )
            .await?;
        let value = body
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Malformed("missing tenant_access_token".into()))?
            .to_string();
        let expire_secs = body.get("expire").and_then(Value::as_u64).unwrap_or(0);
        // Refresh a minute early.
        let ttl = Duration::from_secs(expire_secs.saturating_sub(60));
        *self.token.lock().await = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(value)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, GatewayError> {
        let token = self.tenant_token().await?;
        let body = self
            .send_with_retries(method, path, Some(&token), body)
            .await?;
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Fixed-count, fixed-backoff retry. Transport and 5xx failures are
    /// retried; a platform error code ends the loop.
    async fn send_with_retries(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.host, path);
        let mut last_failure = GatewayError::Transport("no attempt made".into());
        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }
            let mut request = self.client.request(method.clone(), &url);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            let response = match request.send().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(%url, attempt, error = %e, "platform call failed");
                    last_failure = GatewayError::Transport(e.to_string());
                    continue;
                }
            };
            let status = response.status();
            if status.is_server_error() {
                warn!(%url, attempt, %status, "platform call failed");
                last_failure = GatewayError::Transport(format!("http {status}"));
                continue;
            }
            let parsed: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_failure = GatewayError::Malformed(e.to_string());
                    continue;
                }
            };
            let code = parsed.get("code").and_then(Value::as_i64).unwrap_or(-1);
            if code != 0 {
                let msg = parsed
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(GatewayError::Rejected { code, msg });
            }
            debug!(%url, attempt, "platform call succeeded");
            return Ok(parsed);
        }
        Err(last_failure)
    }

    async fn send_message(
        &self,
        user_id: &str,
        msg_type: &str,
        content: String,
    ) -> Result<SentMessage, GatewayError> {
        let data = self
            .call(
                Method::POST,
                "/open-apis/im/v1/messages?receive_id_type=user_id",
                Some(json!({
                    "receive_id": user_id,
                    "msg_type": msg_type,
                    "content": content
                })),
            )
            .await?;
        let message_id = data
            .get("message_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Malformed("missing message_id".into()))?;
        Ok(SentMessage {
            message_id: message_id.to_string(),
        })
    }
}

#[async_trait]
impl MessagingGateway for FeishuClient {
    async fn send_card(&self, user_id: &str, card: &Value) -> Result<SentMessage, GatewayError> {
        self.send_message(user_id, "interactive", card.to_string())
            .await
    }

    async fn send_text(&self, user_id: &str, text: &str) -> Result<SentMessage, GatewayError> {
        self.send_message(user_id, "text", json!({"text": text}).to_string())
            .await
    }

    async fn recall(&self, message_id: &str) -> Result<(), GatewayError> {
        self.call(
            Method::DELETE,
            &format!("/open-apis/im/v1/messages/{message_id}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn update_card(&self, token: &str, card: &Value) -> Result<(), GatewayError> {
        self.call(
            Method::POST,
            "/open-apis/interactive/v1/card/update",
            Some(json!({"token": token, "card": card})),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ApprovalGateway for FeishuClient {
    async fn create_instance(&self, request: &CreateInstance) -> Result<String, GatewayError> {
        let form = serde_json::to_string(&request.form)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let data = self
            .call(
                Method::POST,
                "/open-apis/approval/v4/instances",
                Some(json!({
                    "approval_code": request.approval_code,
                    "user_id": request.user_id,
                    "form": form,
                    "uuid": request.uuid
                })),
            )
            .await?;
        data.get("instance_code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Malformed("missing instance_code".into()))
    }

    async fn fetch_instance(
        &self,
        instance_code: &str,
    ) -> Result<ApprovalInstanceDetail, GatewayError> {
        let data = self
            .call(
                Method::GET,
                &format!("/open-apis/approval/v4/instances/{instance_code}"),
                None,
            )
            .await?;
        serde_json::from_value(data).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    async fn subscribe(&self, approval_code: &str) -> Result<(), GatewayError> {
        self.call(
            Method::POST,
            &format!("/open-apis/approval/v4/approvals/{approval_code}/subscribe"),
            None,
        )
        .await
        .map(|_| ())
    }
}
