//! Webhook envelope decoding.
//!
//! Two envelope shapes arrive on the same path: events carry a `header`
//! with the event type and id, callbacks carry a `uuid` and name their type
//! inside `event`. Anything not listed here is rejected.

use lendbot_contracts::{
    ApprovalInstanceEvent, BotMenuEvent, CardActionEvent, MessageReceiveEvent, WebhookEnvelope,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BotError;

pub const CARD_ACTION: &str = "card.action.trigger";
pub const MENU_CLICK: &str = "application.bot.menu_v6";
pub const MESSAGE_RECEIVE: &str = "im.message.receive_v1";
pub const APPROVAL_INSTANCE: &str = "approval_instance";
pub const URL_VERIFICATION: &str = "url_verification";

pub const EVENT_TYPES: [&str; 5] = [
    URL_VERIFICATION,
    CARD_ACTION,
    MENU_CLICK,
    MESSAGE_RECEIVE,
    APPROVAL_INSTANCE,
];

#[derive(Debug, Clone)]
pub enum InboundEvent {
    UrlVerification {
        challenge: String,
    },
    CardAction {
        event_id: String,
        event: CardActionEvent,
    },
    MenuClick {
        event_id: String,
        event: BotMenuEvent,
    },
    MessageReceive {
        event_id: String,
        event: MessageReceiveEvent,
    },
    ApprovalInstance {
        event_id: String,
        event: ApprovalInstanceEvent,
    },
}

impl InboundEvent {
    /// Idempotency key. The handshake has none.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            InboundEvent::UrlVerification { .. } => None,
            InboundEvent::CardAction { event_id, .. }
            | InboundEvent::MenuClick { event_id, .. }
            | InboundEvent::MessageReceive { event_id, .. }
            | InboundEvent::ApprovalInstance { event_id, .. } => Some(event_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::UrlVerification { .. } => URL_VERIFICATION,
            InboundEvent::CardAction { .. } => CARD_ACTION,
            InboundEvent::MenuClick { .. } => MENU_CLICK,
            InboundEvent::MessageReceive { .. } => MESSAGE_RECEIVE,
            InboundEvent::ApprovalInstance { .. } => APPROVAL_INSTANCE,
        }
    }
}

/// Decodes an envelope, checking its verification token when one is
/// configured.
pub fn decode_envelope(
    envelope: WebhookEnvelope,
    verification_token: Option<&str>,
) -> Result<InboundEvent, BotError> {
    let presented = envelope
        .header
        .as_ref()
        .and_then(|h| h.token.as_deref())
        .or(envelope.token.as_deref());
    if let Some(expected) = verification_token {
        if presented != Some(expected) {
            return Err(BotError::BadRequest("verification token mismatch".into()));
        }
    }

    if envelope.kind.as_deref() == Some(URL_VERIFICATION) {
        let challenge = envelope
            .challenge
            .ok_or_else(|| BotError::BadRequest("url_verification without challenge".into()))?;
        return Ok(InboundEvent::UrlVerification { challenge });
    }

    let event = envelope
        .event
        .ok_or_else(|| BotError::BadRequest("envelope has no event".into()))?;

    if let Some(header) = envelope.header {
        let event_id = header.event_id;
        return match header.event_type.as_str() {
            CARD_ACTION => Ok(InboundEvent::CardAction {
                event: parse(event)?,
                event_id,
            }),
            MENU_CLICK => Ok(InboundEvent::MenuClick {
                event: parse(event)?,
                event_id,
            }),
            MESSAGE_RECEIVE => Ok(InboundEvent::MessageReceive {
                event: parse(event)?,
                event_id,
            }),
            other => Err(BotError::UnknownEvent(other.to_string())),
        };
    }

    let uuid = envelope
        .uuid
        .ok_or_else(|| BotError::BadRequest("envelope has neither header nor uuid".into()))?;
    match event.get("type").and_then(Value::as_str) {
        Some(APPROVAL_INSTANCE) => Ok(InboundEvent::ApprovalInstance {
            event: parse(event)?,
            event_id: uuid,
        }),
        other => Err(BotError::UnknownEvent(other.unwrap_or_default().to_string())),
    }
}

fn parse<T: DeserializeOwned>(event: Value) -> Result<T, BotError> {
    serde_json::from_value(event).map_err(|e| BotError::BadRequest(format!("malformed event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(v: Value) -> WebhookEnvelope {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn handshake_requires_matching_token() {
        let ok = decode_envelope(
            envelope(json!({"type": "url_verification", "challenge": "c1", "token": "vt"})),
            Some("vt"),
        )
        .unwrap();
        assert!(matches!(ok, InboundEvent::UrlVerification { ref challenge } if challenge == "c1"));
        let err = decode_envelope(
            envelope(json!({"type": "url_verification", "challenge": "c1", "token": "nope"})),
            Some("vt"),
        )
        .unwrap_err();
        assert!(matches!(err, BotError::BadRequest(_)));
    }

    #[test]
    fn header_events_dispatch_by_type() {
        let ev = decode_envelope(
            envelope(json!({
                "schema": "2.0",
                "header": {"event_id": "e1", "event_type": "application.bot.menu_v6"},
                "event": {
                    "operator": {"operator_id": {"user_id": "u1"}},
                    "event_key": "custom_menu.inspect.items"
                }
            })),
            None,
        )
        .unwrap();
        assert_eq!(ev.event_id(), Some("e1"));
        assert_eq!(ev.kind(), MENU_CLICK);
    }

    #[test]
    fn callbacks_use_uuid_as_event_id() {
        let ev = decode_envelope(
            envelope(json!({
                "uuid": "cb-1",
                "type": "event_callback",
                "event": {
                    "type": "approval_instance",
                    "approval_code": "A",
                    "instance_code": "I",
                    "status": "APPROVED"
                }
            })),
            None,
        )
        .unwrap();
        assert_eq!(ev.event_id(), Some("cb-1"));
        assert!(matches!(ev, InboundEvent::ApprovalInstance { .. }));
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = decode_envelope(
            envelope(json!({
                "header": {"event_id": "e1", "event_type": "contact.user.created_v3"},
                "event": {}
            })),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BotError::UnknownEvent(ref t) if t == "contact.user.created_v3"));
        let err = decode_envelope(
            envelope(json!({"uuid": "u", "event": {"type": "leave_approval"}})),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BotError::UnknownEvent(_)));
    }
}
