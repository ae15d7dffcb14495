use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Version stamped into every card-state payload this server emits.
pub const CARD_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(path, sha256, body)| ContractSchemaManifest { path, sha256, body })
            .collect(),
    }
}

/// Items checked across card re-renders, as parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionList {
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub oid: Vec<String>,
}

/// Payload embedded in the value of every interactive element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardStatePayload {
    pub v: u32,
    pub view: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(rename = "selectedObjectList")]
    pub selected_object_list: SelectionList,
}

/// Raw webhook body. Event-style deliveries carry `header`; callback-style
/// deliveries carry `uuid`/`type` at the top level.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub header: Option<EventHeader>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub event: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventHeader {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserIds {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub open_id: Option<String>,
    #[serde(default)]
    pub union_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardActionEvent {
    pub operator: UserIds,
    #[serde(default)]
    pub token: String,
    pub action: CardAction,
    pub context: CardContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardContext {
    pub open_message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardAction {
    pub tag: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input_value: Option<String>,
    #[serde(default)]
    pub checked: Option<bool>,
    #[serde(default)]
    pub form_value: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotMenuEvent {
    pub operator: MenuOperator,
    pub event_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MenuOperator {
    pub operator_id: UserIds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageReceiveEvent {
    pub sender: MessageSender,
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageSender {
    pub sender_id: UserIds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mention {
    pub key: String,
    pub id: UserIds,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
    Deleted,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Canceled => "CANCELED",
            ApprovalStatus::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalInstanceEvent {
    pub approval_code: String,
    pub instance_code: String,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Subset of the approval instance detail needed to settle a decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalInstanceDetail {
    #[serde(default)]
    pub user_id: Option<String>,
    pub form: String,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineEntry {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Error,
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toast {
    #[serde(rename = "type")]
    pub kind: ToastKind,
    pub content: String,
}

impl Toast {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardActionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toast: Option<Toast>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub card_state_version: u32,
    pub contracts_set_sha256: String,
    pub schemas: BTreeMap<String, String>,
    pub event_types: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn schema_files_are_valid_json_schema() {
        let dir = repo_path("contracts/v1");
        let entries = std::fs::read_dir(dir).unwrap();
        for entry in entries {
            let path = entry.unwrap().path();
            if !path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
            {
                continue;
            }
            let text = std::fs::read_to_string(&path).unwrap();
            let schema: Value = serde_json::from_str(&text).unwrap();
            let _validator = jsonschema::validator_for(&schema)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", path.display()));
        }
    }

    #[test]
    fn manifest_embeds_every_schema() {
        let manifest = contracts_manifest_v1();
        assert_eq!(manifest.contracts_set_sha256.len(), 64);
        assert!(manifest
            .schemas
            .iter()
            .any(|s| s.path == "contracts/v1/card_state.schema.json"));
    }

    #[test]
    fn empty_toast_serializes_as_empty_object() {
        let body = serde_json::to_value(CardActionResponse::default()).unwrap();
        assert_eq!(body, json!({}));
    }

    #[test]
    fn approval_status_parses_platform_casing() {
        let ev: ApprovalInstanceEvent = serde_json::from_value(json!({
            "approval_code": "A",
            "instance_code": "I",
            "status": "CANCELED"
        }))
        .unwrap();
        assert_eq!(ev.status, ApprovalStatus::Canceled);
        assert!(ev.status.is_terminal());
    }

    fn repo_path(relative: &str) -> PathBuf {
        let mut base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        base.push("../..");
        base.push(relative);
        base
    }
}
