//! Approval form shape and decision mapping.
//!
//! The form sent with each instance is the only copy of the request the
//! approval system keeps, so it must be readable back without our records.

use chrono::{DateTime, SecondsFormat, Utc};
use lendbot_contracts::{ApprovalInstanceDetail, ApprovalStatus, FormField, SelectionList};
use serde_json::{json, Value};

use crate::codec::{CodecError, Selection};
use crate::ids::ItemId;
use crate::useable::Useable;
use crate::hash_id;

pub const FIELD_PURPOSE: &str = "do";
pub const FIELD_DATE: &str = "date";
pub const FIELD_OBJECTS: &str = "objectList";

const EMPTY_PURPOSE: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalForm {
    pub purpose: String,
    pub date: String,
    pub selection: Selection,
}

pub fn approval_form(purpose: &str, selection: &Selection, now: DateTime<Utc>) -> Vec<FormField> {
    let wire = selection.to_wire();
    let objects = json!({"name": wire.name, "oid": wire.oid});
    vec![
        FormField {
            id: FIELD_PURPOSE.to_string(),
            kind: "textarea".to_string(),
            value: if purpose.trim().is_empty() {
                EMPTY_PURPOSE.to_string()
            } else {
                purpose.trim().to_string()
            },
        },
        FormField {
            id: FIELD_DATE.to_string(),
            kind: "date".to_string(),
            value: now.to_rfc3339_opts(SecondsFormat::Secs, false),
        },
        FormField {
            id: FIELD_OBJECTS.to_string(),
            kind: "textarea".to_string(),
            value: objects.to_string(),
        },
    ]
}

/// Reads back a form produced by [`approval_form`]. Fields are looked up by
/// id, falling back to position for instances whose fields carry no ids.
pub fn parse_form(raw: &str) -> Result<ApprovalForm, CodecError> {
    let fields: Vec<Value> = serde_json::from_str(raw)
        .map_err(|e| CodecError::Malformed(format!("approval form: {e}")))?;
    let field = |id: &str, pos: usize| -> Option<String> {
        fields
            .iter()
            .find(|f| f.get("id").and_then(Value::as_str) == Some(id))
            .or_else(|| fields.get(pos))
            .and_then(|f| f.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let purpose = field(FIELD_PURPOSE, 0).unwrap_or_default();
    let purpose = if purpose == EMPTY_PURPOSE {
        String::new()
    } else {
        purpose
    };
    let date = field(FIELD_DATE, 1).unwrap_or_default();
    let objects = field(FIELD_OBJECTS, 2)
        .ok_or_else(|| CodecError::Malformed("approval form has no object list".into()))?;
    let list: Value = serde_json::from_str(&objects)
        .map_err(|e| CodecError::Malformed(format!("approval object list: {e}")))?;
    let wire = SelectionList {
        name: string_array(&list, "name"),
        oid: string_array(&list, "oid"),
    };
    Ok(ApprovalForm {
        purpose,
        date,
        selection: Selection::from_wire(&wire)?,
    })
}

fn string_array(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| match i {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Applicant is whoever opened the first timeline entry; the operator is the
/// most recent entry that names a user.
pub fn timeline_parties(detail: &ApprovalInstanceDetail) -> (Option<String>, Option<String>) {
    let applicant = detail
        .timeline
        .first()
        .and_then(|t| t.user_id.clone())
        .or_else(|| detail.user_id.clone());
    let operator = detail
        .timeline
        .iter()
        .rev()
        .find_map(|t| t.user_id.clone().filter(|u| !u.is_empty()));
    (applicant, operator)
}

/// Item state after a terminal decision. `None` for a non-terminal status.
pub fn resolution(status: ApprovalStatus, applicant_name: &str, warehouse: &str) -> Option<(Useable, String)> {
    match status {
        ApprovalStatus::Pending => None,
        ApprovalStatus::Approved => Some((Useable::Loaned, applicant_name.to_string())),
        ApprovalStatus::Rejected | ApprovalStatus::Canceled | ApprovalStatus::Deleted => {
            Some((Useable::Available, warehouse.to_string()))
        }
    }
}

/// Stable key for one submission, sent as the instance uuid so a retried
/// create does not open a second instance.
pub fn submission_key(user_id: &str, event_id: &str, oids: &[ItemId]) -> String {
    let oids = oids
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(",");
    hash_id("apply", &[user_id, event_id, &oids])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lendbot_contracts::TimelineEntry;

    fn selection() -> Selection {
        let mut s = Selection::new();
        s.set_checked(1_001_001, "X", true);
        s.set_checked(2_003_004, "Y", true);
        s
    }

    #[test]
    fn form_fields_are_ordered_and_typed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let form = approval_form("", &selection(), now);
        let ids: Vec<&str> = form.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["do", "date", "objectList"]);
        assert_eq!(form[0].value, "None");
        assert_eq!(form[1].kind, "date");
        assert_eq!(form[1].value, "2026-03-01T08:30:00+00:00");
        let list: Value = serde_json::from_str(&form[2].value).unwrap();
        assert_eq!(list["oid"], json!(["1001001", "2003004"]));
    }

    #[test]
    fn form_conforms_to_published_schema() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/v1/approval_form.schema.json");
        let schema: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let form = serde_json::to_value(approval_form("lab work", &selection(), now)).unwrap();
        assert!(validator.is_valid(&form));
    }

    #[test]
    fn submitted_form_reads_back() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let raw = serde_json::to_string(&approval_form("lab work", &selection(), now)).unwrap();
        let parsed = parse_form(&raw).unwrap();
        assert_eq!(parsed.purpose, "lab work");
        assert_eq!(parsed.selection, selection());
    }

    #[test]
    fn positional_form_without_ids_is_accepted() {
        let raw = r#"[{"value":"None"},{"value":"2026-01-01"},{"value":"{\"name\":[\"X\"],\"oid\":[1001001]}"}]"#;
        let parsed = parse_form(raw).unwrap();
        assert_eq!(parsed.purpose, "");
        assert_eq!(parsed.selection.oids(), vec![1_001_001]);
        assert!(parse_form("[]").is_err());
    }

    #[test]
    fn operator_is_last_named_timeline_entry() {
        let detail = ApprovalInstanceDetail {
            user_id: None,
            form: String::new(),
            timeline: vec![
                TimelineEntry {
                    user_id: Some("u1".into()),
                    kind: Some("START".into()),
                },
                TimelineEntry {
                    user_id: Some("admin".into()),
                    kind: Some("PASS".into()),
                },
                TimelineEntry {
                    user_id: None,
                    kind: Some("CC".into()),
                },
            ],
        };
        assert_eq!(
            timeline_parties(&detail),
            (Some("u1".into()), Some("admin".into()))
        );
    }

    #[test]
    fn decisions_map_to_item_states() {
        assert_eq!(
            resolution(ApprovalStatus::Approved, "Ann", "warehouse"),
            Some((Useable::Loaned, "Ann".into()))
        );
        for status in [ApprovalStatus::Rejected, ApprovalStatus::Canceled, ApprovalStatus::Deleted] {
            assert_eq!(
                resolution(status, "Ann", "warehouse"),
                Some((Useable::Available, "warehouse".into()))
            );
        }
        assert_eq!(resolution(ApprovalStatus::Pending, "Ann", "warehouse"), None);
    }

    #[test]
    fn submission_key_is_stable() {
        let a = submission_key("u1", "ev1", &[1_001_001]);
        assert_eq!(a, submission_key("u1", "ev1", &[1_001_001]));
        assert_ne!(a, submission_key("u1", "ev2", &[1_001_001]));
        assert!(a.starts_with("apply_"));
    }
}
