//! Card state codec.
//!
//! The platform keeps no session for us, so the current view and the
//! selection list ride inside every element value and come back with every
//! action. Payloads without a `v` field are treated as version 0: the
//! pre-versioned shape, which only carried `selectedObjectList` and might
//! hold numeric oids.

use lendbot_contracts::{CardStatePayload, SelectionList, CARD_STATE_VERSION};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::{tier_of, IdTier, ItemId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("card payload is malformed: {0}")]
    Malformed(String),
    #[error("card payload version {0} is not supported")]
    UnsupportedVersion(u64),
    #[error("selection has {names} names but {oids} ids")]
    LengthMismatch { names: usize, oids: usize },
    #[error("selection contains invalid item id {0:?}")]
    BadItemId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedItem {
    pub oid: ItemId,
    pub name: String,
}

/// Ordered set of checked items. Order is the order of checking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    items: Vec<SelectedItem>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[SelectedItem] {
        &self.items
    }

    pub fn oids(&self) -> Vec<ItemId> {
        self.items.iter().map(|i| i.oid).collect()
    }

    pub fn contains(&self, oid: ItemId) -> bool {
        self.items.iter().any(|i| i.oid == oid)
    }

    pub fn set_checked(&mut self, oid: ItemId, name: &str, checked: bool) {
        if checked {
            if !self.contains(oid) {
                self.items.push(SelectedItem {
                    oid,
                    name: name.to_string(),
                });
            }
        } else {
            self.remove(oid);
        }
    }

    /// Flips membership of `oid`; returns whether it is selected afterwards.
    pub fn toggle(&mut self, oid: ItemId, name: &str) -> bool {
        let checked = !self.contains(oid);
        self.set_checked(oid, name, checked);
        checked
    }

    pub fn remove(&mut self, oid: ItemId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.oid != oid);
        before != self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_wire(&self) -> SelectionList {
        SelectionList {
            name: self.items.iter().map(|i| i.name.clone()).collect(),
            oid: self.items.iter().map(|i| i.oid.to_string()).collect(),
        }
    }

    pub fn from_wire(list: &SelectionList) -> Result<Self, CodecError> {
        if list.name.len() != list.oid.len() {
            return Err(CodecError::LengthMismatch {
                names: list.name.len(),
                oids: list.oid.len(),
            });
        }
        let mut selection = Selection::new();
        for (name, raw) in list.name.iter().zip(&list.oid) {
            let oid = parse_item_id(raw)?;
            selection.set_checked(oid, name, true);
        }
        Ok(selection)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardState {
    pub view: i64,
    pub query: Option<String>,
    pub selection: Selection,
}

impl CardState {
    pub fn at(view: i64) -> Self {
        Self {
            view,
            ..Self::default()
        }
    }

    pub fn with_selection(view: i64, selection: Selection) -> Self {
        Self {
            view,
            query: None,
            selection,
        }
    }

    pub fn to_payload(&self) -> CardStatePayload {
        CardStatePayload {
            v: CARD_STATE_VERSION,
            view: self.view,
            query: self.query.clone(),
            selected_object_list: self.selection.to_wire(),
        }
    }
}

pub fn encode(state: &CardState) -> Value {
    element_value(state, Vec::new())
}

/// Card state plus element-specific fields (`name`, `id`, `oid`, ...).
pub fn element_value(state: &CardState, fields: Vec<(&str, Value)>) -> Value {
    let mut m = Map::new();
    m.insert("v".to_string(), Value::from(CARD_STATE_VERSION));
    m.insert("view".to_string(), Value::from(state.view));
    if let Some(query) = &state.query {
        m.insert("query".to_string(), Value::String(query.clone()));
    }
    let wire = state.selection.to_wire();
    let mut selected = Map::new();
    selected.insert(
        "name".to_string(),
        Value::Array(wire.name.into_iter().map(Value::String).collect()),
    );
    selected.insert(
        "oid".to_string(),
        Value::Array(wire.oid.into_iter().map(Value::String).collect()),
    );
    m.insert("selectedObjectList".to_string(), Value::Object(selected));
    for (k, v) in fields {
        m.insert(k.to_string(), v);
    }
    Value::Object(m)
}

pub fn decode(value: &Value) -> Result<CardState, CodecError> {
    let obj = match value {
        Value::Null => return Ok(CardState::default()),
        Value::Object(obj) => obj,
        other => {
            return Err(CodecError::Malformed(format!(
                "expected object, got {}",
                json_kind(other)
            )))
        }
    };

    match obj.get("v") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => {}
            Some(v) if v == u64::from(CARD_STATE_VERSION) => {}
            Some(v) => return Err(CodecError::UnsupportedVersion(v)),
            None => return Err(CodecError::Malformed("v must be an unsigned integer".into())),
        },
        Some(_) => return Err(CodecError::Malformed("v must be an unsigned integer".into())),
    }

    let view = match obj.get("view") {
        None | Some(Value::Null) => 0,
        Some(v) => as_i64(v).ok_or_else(|| CodecError::Malformed("view must be an integer".into()))?,
    };

    let query = match obj.get("query") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(CodecError::Malformed("query must be a string".into())),
    };

    let selection = match obj.get("selectedObjectList") {
        None | Some(Value::Null) => Selection::new(),
        Some(Value::Object(list)) => decode_selection(list)?,
        Some(_) => {
            return Err(CodecError::Malformed(
                "selectedObjectList must be an object".into(),
            ))
        }
    };

    Ok(CardState {
        view,
        query,
        selection,
    })
}

fn decode_selection(list: &Map<String, Value>) -> Result<Selection, CodecError> {
    let names = match list.get("name") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                _ => Err(CodecError::Malformed("selection names must be strings".into())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(CodecError::Malformed("selection names must be an array".into())),
    };
    let oids = match list.get("oid") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(CodecError::BadItemId(v.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(CodecError::Malformed("selection ids must be an array".into())),
    };
    Selection::from_wire(&SelectionList {
        name: names,
        oid: oids,
    })
}

pub fn parse_item_id(raw: &str) -> Result<ItemId, CodecError> {
    let oid: ItemId = raw
        .trim()
        .parse()
        .map_err(|_| CodecError::BadItemId(raw.to_string()))?;
    if tier_of(oid) != Some(IdTier::Item) {
        return Err(CodecError::BadItemId(raw.to_string()));
    }
    Ok(oid)
}

pub(crate) fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CardState {
        let mut selection = Selection::new();
        selection.set_checked(1_001_001, "screwdriver", true);
        selection.set_checked(1_002_003, "multimeter", true);
        CardState::with_selection(1_001, selection)
    }

    #[test]
    fn encoded_state_decodes_to_the_same_state() {
        let state = sample();
        assert_eq!(decode(&encode(&state)).unwrap(), state);
    }

    #[test]
    fn encoded_payload_conforms_to_published_schema() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/v1/card_state.schema.json");
        let schema: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let mut state = sample();
        state.query = Some("screw".to_string());
        let value = element_value(&state, vec![("name", json!("object.inspect")), ("id", json!(1))]);
        assert!(validator.is_valid(&value));
    }

    #[test]
    fn typed_payload_matches_encoded_value() {
        let mut state = sample();
        state.query = Some("drill".to_string());
        let typed = serde_json::to_value(state.to_payload()).unwrap();
        assert_eq!(typed, encode(&state));
    }

    #[test]
    fn absent_selection_is_empty() {
        let state = decode(&json!({"name": "home"})).unwrap();
        assert!(state.selection.is_empty());
        assert_eq!(state.view, 0);

        let state = decode(&json!({"selectedObjectList": {}})).unwrap();
        assert!(state.selection.is_empty());

        assert_eq!(decode(&Value::Null).unwrap(), CardState::default());
    }

    #[test]
    fn legacy_payload_with_numeric_oids_is_accepted() {
        let state = decode(&json!({
            "selectedObjectList": {"name": ["X"], "oid": [1001001]}
        }))
        .unwrap();
        assert_eq!(state.selection.oids(), vec![1_001_001]);
    }

    #[test]
    fn malformed_payloads_are_typed_errors() {
        assert!(matches!(decode(&json!("oops")), Err(CodecError::Malformed(_))));
        assert_eq!(
            decode(&json!({"v": 7})),
            Err(CodecError::UnsupportedVersion(7))
        );
        assert_eq!(
            decode(&json!({"selectedObjectList": {"name": ["a", "b"], "oid": ["1001001"]}})),
            Err(CodecError::LengthMismatch { names: 2, oids: 1 })
        );
        assert!(matches!(
            decode(&json!({"selectedObjectList": {"name": ["a"], "oid": ["12"]}})),
            Err(CodecError::BadItemId(_))
        ));
        assert!(matches!(
            decode(&json!({"selectedObjectList": {"name": ["a"], "oid": ["abc"]}})),
            Err(CodecError::BadItemId(_))
        ));
    }

    #[test]
    fn ids_beyond_signed_range_are_rejected() {
        assert!(matches!(
            parse_item_id("18446744073709551615"),
            Err(CodecError::BadItemId(_))
        ));
        assert!(matches!(
            parse_item_id("9223372036854775808"),
            Err(CodecError::BadItemId(_))
        ));
        assert_eq!(parse_item_id("9223372036854775807"), Ok(9_223_372_036_854_775_807));
        assert!(matches!(
            decode(&json!({"selectedObjectList": {"name": ["a"], "oid": [18446744073709551615u64]}})),
            Err(CodecError::BadItemId(_))
        ));
    }

    #[test]
    fn toggling_twice_restores_membership() {
        let mut selection = Selection::new();
        selection.set_checked(1_001_002, "b", true);
        let before = selection.clone();

        assert!(selection.toggle(1_001_001, "a"));
        assert!(!selection.toggle(1_001_001, "a"));
        assert_eq!(selection, before);

        assert!(!selection.toggle(1_001_002, "b"));
        assert!(selection.toggle(1_001_002, "b"));
        assert_eq!(selection, before);
    }

    #[test]
    fn checking_an_item_twice_keeps_one_entry() {
        let mut selection = Selection::new();
        selection.set_checked(1_001_001, "a", true);
        selection.set_checked(1_001_001, "a", true);
        assert_eq!(selection.len(), 1);
        selection.set_checked(1_001_001, "a", false);
        selection.set_checked(1_001_001, "a", false);
        assert!(selection.is_empty());
    }
}
