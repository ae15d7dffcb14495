use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use lendbot_config::Config;
use lendbot_contracts::{
    contracts_manifest_v1, CardActionResponse, ContractsMetadata, ErrorResponse, WebhookEnvelope,
    CARD_STATE_VERSION,
};
use lendbot_kernel::{CardState, GateDecision, RateConfig};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod approval;
pub mod audit;
pub mod cards;
pub mod clock;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-util"))]
pub mod fakes;
pub mod gateway;
pub mod idempotency;
pub mod rate;
pub mod router;
pub mod store;
pub mod views;

pub use audit::verify_audit_chain;

use crate::approval::ApprovalWorkflow;
use crate::audit::{AuditJsonl, AuditRecord};
use crate::cards::CardLifecycleManager;
use crate::clock::{Clock, SystemClock};
use crate::dispatch::Dispatcher;
use crate::error::BotError;
use crate::events::{decode_envelope, InboundEvent, EVENT_TYPES};
use crate::gateway::{ApprovalGateway, FeishuClient, MessagingGateway};
use crate::idempotency::IdempotencyGate;
use crate::rate::RateLimiter;
use crate::router::CardActionRouter;
use crate::store::{SharedStore, StoreBackend};
use crate::views::ViewResolver;

/// Menu entry that opens the inventory card.
pub const MENU_INSPECT_ITEMS: &str = "custom_menu.inspect.items";

type HttpError = (StatusCode, Json<ErrorResponse>);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let deps = Deps::platform(&cfg)?;
    let state = AppState::new(cfg, deps).await?;
    state.workflow.subscribe().await;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Outbound collaborators, swapped for fakes in tests.
pub struct Deps {
    pub messaging: Arc<dyn MessagingGateway>,
    pub approvals: Arc<dyn ApprovalGateway>,
    pub clock: Arc<dyn Clock>,
}

impl Deps {
    pub fn platform(cfg: &Config) -> Result<Self, String> {
        let client = Arc::new(FeishuClient::new(&cfg.platform)?);
        Ok(Self {
            messaging: client.clone(),
            approvals: client,
            clock: Arc::new(SystemClock),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let webhook_path = state.cfg.server.webhook_path.clone();
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route(&webhook_path, post(webhook))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: SharedStore,
    pub messaging: Arc<dyn MessagingGateway>,
    pub clock: Arc<dyn Clock>,
    pub gate: Arc<IdempotencyGate>,
    pub limiter: Arc<RateLimiter>,
    pub cards: Arc<CardLifecycleManager>,
    pub views: Arc<ViewResolver>,
    pub workflow: Arc<ApprovalWorkflow>,
    pub dispatcher: Arc<Dispatcher>,
    pub audit: Arc<AuditJsonl>,
}

impl AppState {
    pub async fn new(cfg: Config, deps: Deps) -> Result<Self, String> {
        let mut backend = StoreBackend::open(&cfg.store.kind, cfg.store.sqlite_path.as_deref())
            .map_err(|e| format!("store open failed: {e}"))?;
        for user_id in &cfg.inventory.root_users {
            let ids = lendbot_contracts::UserIds {
                user_id: user_id.clone(),
                ..Default::default()
            };
            backend
                .ensure_member(&ids)
                .and_then(|_| backend.inner_mut().set_root(user_id, true))
                .map_err(|e| format!("seeding administrator {user_id} failed: {e}"))?;
        }
        let store: SharedStore = Arc::new(Mutex::new(backend));
        let Deps {
            messaging,
            approvals,
            clock,
        } = deps;

        Ok(Self {
            gate: Arc::new(IdempotencyGate::new(
                store.clone(),
                clock.clone(),
                cfg.idempotency.ttl_secs,
            )),
            limiter: Arc::new(RateLimiter::new(
                store.clone(),
                clock.clone(),
                RateConfig {
                    max_requests: cfg.rate_limit.max_requests,
                    window_ms: cfg.rate_limit.window_ms,
                },
            )),
            cards: Arc::new(CardLifecycleManager::new(
                store.clone(),
                messaging.clone(),
                clock.clone(),
                cfg.cards.freshness_secs,
            )),
            views: Arc::new(ViewResolver::new(store.clone())),
            workflow: Arc::new(ApprovalWorkflow::new(
                store.clone(),
                approvals,
                messaging.clone(),
                clock.clone(),
                cfg.platform.approval_code.clone(),
                cfg.inventory.warehouse_label.clone(),
            )),
            dispatcher: Arc::new(Dispatcher::from_config(&cfg.dispatch)),
            audit: Arc::new(AuditJsonl::open(&cfg.audit.jsonl_path).await?),
            cfg: Arc::new(cfg),
            store,
            messaging,
            clock,
        })
    }

    async fn handle_webhook(&self, envelope: WebhookEnvelope) -> Result<Json<Value>, HttpError> {
        let inbound = match decode_envelope(envelope, self.cfg.platform.verification_token.as_deref()) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "webhook rejected");
                self.record("", "decode", "rejected", e.code()).await;
                return Err(http_error(&e));
            }
        };
        if let InboundEvent::UrlVerification { challenge } = &inbound {
            return Ok(Json(json!({ "challenge": challenge })));
        }

        let event_id = inbound.event_id().unwrap_or_default().to_string();
        let kind = inbound.kind();
        if self.gate.seen(&event_id).await {
            info!(%event_id, kind, "duplicate delivery acknowledged");
            self.record(&event_id, kind, "duplicate", "duplicate_event").await;
            return Ok(Json(json!({})));
        }
        info!(%event_id, kind, "webhook accepted");

        match self.process(inbound).await {
            Ok(body) => {
                self.record(&event_id, kind, "ok", "ok").await;
                Ok(Json(body))
            }
            Err(e) => {
                warn!(%event_id, kind, error = %e, "webhook failed");
                // Let the platform's redelivery try again.
                self.gate.release(&event_id).await;
                self.record(&event_id, kind, "error", e.code()).await;
                Err(http_error(&e))
            }
        }
    }

    async fn process(&self, inbound: InboundEvent) -> Result<Value, BotError> {
        match inbound {
            InboundEvent::UrlVerification { challenge } => Ok(json!({ "challenge": challenge })),
            InboundEvent::CardAction { event_id, event } => {
                let response = match CardActionRouter::new(self.clone()).handle(&event_id, event).await {
                    Ok(response) => response,
                    Err(e) => match e.toast() {
                        Some(toast) => {
                            warn!(%event_id, error = %e, "card action refused");
                            CardActionResponse { toast: Some(toast) }
                        }
                        None => return Err(e),
                    },
                };
                serde_json::to_value(response).map_err(|e| BotError::Store(e.to_string()))
            }
            InboundEvent::MenuClick { event, .. } => {
                let operator = event.operator.operator_id;
                if let GateDecision::Deny { retry_after_ms } =
                    self.limiter.check(&operator.user_id, events::MENU_CLICK).await
                {
                    warn!(user_id = %operator.user_id, retry_after_ms, "menu click rate limited");
                    return Ok(json!({}));
                }
                if event.event_key != MENU_INSPECT_ITEMS {
                    debug!(event_key = %event.event_key, "menu key ignored");
                    return Ok(json!({}));
                }
                let member = self.store.lock().await.ensure_member(&operator)?;
                let card = self.views.card(&CardState::at(0), &member.name).await?;
                let cards = self.cards.clone();
                self.dispatcher
                    .dispatch(async move {
                        if let Err(e) = cards.issue_new_card(&member.user_id, &card).await {
                            warn!(user_id = %member.user_id, error = %e, "menu card not issued");
                        }
                    })
                    .await;
                Ok(json!({}))
            }
            InboundEvent::MessageReceive { event, .. } => {
                let member = self.store.lock().await.ensure_member(&event.sender.sender_id)?;
                let app = self.clone();
                self.dispatcher
                    .dispatch(async move {
                        let Some(reply) = commands::run_message(&app, &member, &event.message).await
                        else {
                            return;
                        };
                        if let Err(e) = app.messaging.send_text(&member.user_id, &reply).await {
                            warn!(user_id = %member.user_id, error = %e, "command reply not delivered");
                        }
                    })
                    .await;
                Ok(json!({}))
            }
            InboundEvent::ApprovalInstance { event, .. } => {
                let resolution = self.workflow.resolve(&event).await?;
                debug!(instance_code = %event.instance_code, ?resolution, "approval callback handled");
                Ok(json!({}))
            }
        }
    }

    async fn record(&self, event_id: &str, stage: &str, result: &str, reason_code: &str) {
        self.audit
            .append(AuditRecord::new(
                event_id,
                stage,
                result,
                reason_code,
                self.clock.now().to_rfc3339(),
            ))
            .await;
    }
}

fn http_error(e: &BotError) -> HttpError {
    let status = match e.status() {
        StatusCode::OK => StatusCode::BAD_REQUEST,
        status => status,
    };
    (status, Json(e.body()))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    Json(ContractsMetadata {
        card_state_version: CARD_STATE_VERSION,
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.path.to_string(), s.sha256.to_string()))
            .collect::<BTreeMap<_, _>>(),
        event_types: EVENT_TYPES.iter().map(|t| t.to_string()).collect(),
    })
}

async fn webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> Result<Json<Value>, HttpError> {
    state.handle_webhook(envelope).await
}
