use lendbot_contracts::CardAction;
use serde_json::Value;
use thiserror::Error;

use crate::codec::{self, as_i64, parse_item_id, CardState, CodecError};
use crate::ids::{parent_of, ItemId};
use crate::view::{back_target, HOME_VIEW, SEARCH_VIEW, SELF_VIEW};

pub const FORM_BUTTON: &str = "form_button";
pub const SEARCH_INPUT: &str = "input.search";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unsupported action tag {0:?}")]
    UnknownTag(String),
    #[error("unsupported button {0:?}")]
    UnknownButton(String),
    #[error("action is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardCommand {
    Home,
    SelfView,
    Inspect(i64),
    Back(i64),
    Return(ItemId),
    Submit { purpose: String },
    Toggle { oid: ItemId, name: String, checked: bool },
    Search(String),
    /// Buttons that only open a confirm dialog on the client.
    Noop,
}

impl CardCommand {
    /// View rendered after the command succeeds. `None` means the card is
    /// left as it is.
    pub fn next_view(&self) -> Option<i64> {
        match self {
            CardCommand::Home | CardCommand::Submit { .. } => Some(HOME_VIEW),
            CardCommand::SelfView | CardCommand::Return(_) => Some(SELF_VIEW),
            CardCommand::Inspect(id) => Some(*id),
            CardCommand::Back(anchor) => back_target(*anchor),
            CardCommand::Toggle { oid, .. } => Some(parent_of(*oid) as i64),
            CardCommand::Search(_) => Some(SEARCH_VIEW),
            CardCommand::Noop => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CardCommand::Home => "home",
            CardCommand::SelfView => "self",
            CardCommand::Inspect(_) => "object.inspect",
            CardCommand::Back(_) => "back",
            CardCommand::Return(_) => "object.return",
            CardCommand::Submit { .. } => FORM_BUTTON,
            CardCommand::Toggle { .. } => "checker",
            CardCommand::Search(_) => SEARCH_INPUT,
            CardCommand::Noop => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAction {
    pub command: CardCommand,
    pub state: CardState,
}

pub fn decode_action(action: &CardAction) -> Result<DecodedAction, ActionError> {
    let state = codec::decode(&action.value)?;
    let command = match action.tag.as_str() {
        "button" if action.name.as_deref() == Some(FORM_BUTTON) => CardCommand::Submit {
            purpose: form_purpose(action),
        },
        "button" => decode_button(&action.value)?,
        "input" => CardCommand::Search(action.input_value.clone().unwrap_or_default()),
        "checker" => {
            let raw = value_str(&action.value, "oid").ok_or(ActionError::MissingField("oid"))?;
            let oid = parse_item_id(&raw)?;
            let name = value_str(&action.value, "name").unwrap_or_default();
            let checked = action
                .checked
                .unwrap_or_else(|| !state.selection.contains(oid));
            CardCommand::Toggle { oid, name, checked }
        }
        other => return Err(ActionError::UnknownTag(other.to_string())),
    };
    Ok(DecodedAction { command, state })
}

fn decode_button(value: &Value) -> Result<CardCommand, ActionError> {
    let name = value_str(value, "name").ok_or(ActionError::MissingField("name"))?;
    match name.as_str() {
        "home" => Ok(CardCommand::Home),
        "self" => Ok(CardCommand::SelfView),
        "object.inspect" => Ok(CardCommand::Inspect(value_id(value)?)),
        "back" => Ok(CardCommand::Back(value_id(value)?)),
        "object.return" => {
            let raw = value_str(value, "oid").ok_or(ActionError::MissingField("oid"))?;
            Ok(CardCommand::Return(parse_item_id(&raw)?))
        }
        "none" => Ok(CardCommand::Noop),
        other => Err(ActionError::UnknownButton(other.to_string())),
    }
}

fn form_purpose(action: &CardAction) -> String {
    let Some(form) = &action.form_value else {
        return String::new();
    };
    ["purpose", "Input_value"]
        .iter()
        .find_map(|k| form.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn value_id(value: &Value) -> Result<i64, ActionError> {
    value
        .get("id")
        .and_then(as_i64)
        .ok_or(ActionError::MissingField("id"))
}

fn value_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
