//! Interactive card body.
//!
//! Every callback-capable element embeds the full card state, so whichever
//! element the user taps brings the selection back with it.

use serde_json::{json, Value};

use crate::action::{FORM_BUTTON, SEARCH_INPUT};
use crate::codec::{element_value, CardState};
use crate::view::{FlatRow, ObjectRow, RenderedView, Row, RowAction};

pub fn render_card(view: &RenderedView, state: &CardState) -> Value {
    let mut elements = vec![action_bar(view, state)];
    elements.extend(view.rows.iter().map(|row| match row {
        Row::Flat(flat) => flat_row(flat, state),
        Row::Object(object) => object_row(object, state),
    }));
    if let Some(notice) = &view.notice {
        elements.push(json!({
            "tag": "div",
            "text": {"tag": "plain_text", "content": notice}
        }));
    }
    elements.push(json!({"tag": "hr"}));
    elements.push(apply_form(state));

    json!({
        "config": {"wide_screen_mode": true, "update_multi": true},
        "header": {
            "template": "blue",
            "title": {"tag": "plain_text", "content": view.kind.title()}
        },
        "elements": elements
    })
}

fn button(label: &str, value: Value) -> Value {
    json!({
        "tag": "button",
        "type": "default",
        "text": {"tag": "plain_text", "content": label},
        "value": value
    })
}

fn action_bar(view: &RenderedView, state: &CardState) -> Value {
    let home = button("Home", element_value(state, vec![("name", json!("home"))]));
    let mine = button("Mine", element_value(state, vec![("name", json!("self"))]));
    let back = button(
        "Back",
        element_value(
            state,
            vec![("name", json!("back")), ("id", json!(view.kind.back_anchor()))],
        ),
    );
    let search = json!({
        "tag": "input",
        "name": SEARCH_INPUT,
        "placeholder": {"tag": "plain_text", "content": "Search by id or name"},
        "value": element_value(state, Vec::new())
    });
    json!({"tag": "action", "actions": [home, mine, back, search]})
}

fn flat_row(row: &FlatRow, state: &CardState) -> Value {
    json!({
        "tag": "div",
        "text": {
            "tag": "lark_md",
            "content": format!("`{}`  **{}**  x{}", row.id, row.name, row.count)
        },
        "extra": button(
            "Open",
            element_value(state, vec![("name", json!("object.inspect")), ("id", json!(row.id))]),
        )
    })
}

fn object_row(row: &ObjectRow, state: &CardState) -> Value {
    let oid = row.oid.to_string();
    let (label, command, prompt) = match row.action {
        RowAction::Return => (
            "Return",
            "object.return",
            format!("Return {} (oid {})?", row.name, oid),
        ),
        RowAction::Inspect => (
            "Detail",
            "object.inspect",
            format!(
                "{} oid:{}\nlocation: {}\tstatus: {}\nnote: {}",
                row.name, oid, row.wis, row.useable, row.note
            ),
        ),
    };
    let mut action_button = button(
        label,
        element_value(
            state,
            vec![
                ("name", json!(command)),
                ("id", json!(row.oid)),
                ("oid", json!(oid)),
            ],
        ),
    );
    action_button["confirm"] = json!({
        "title": {"tag": "plain_text", "content": row.name},
        "text": {"tag": "plain_text", "content": prompt}
    });

    json!({
        "tag": "checker",
        "name": format!("checker_{oid}"),
        "checked": state.selection.contains(row.oid),
        "disabled": !row.selectable(),
        "text": {
            "tag": "lark_md",
            "content": format!("`{}`  {}  **{}**", oid, row.useable, row.name)
        },
        "behaviors": [{
            "type": "callback",
            "value": element_value(state, vec![("oid", json!(oid)), ("name", json!(row.name))])
        }],
        "button_area": {"pc_display_rule": "always", "buttons": [action_button]}
    })
}

fn apply_form(state: &CardState) -> Value {
    let selected = if state.selection.is_empty() {
        "Nothing selected".to_string()
    } else {
        state
            .selection
            .items()
            .iter()
            .map(|item| format!("{}  `{}`", item.name, item.oid))
            .collect::<Vec<_>>()
            .join("\n")
    };
    json!({
        "tag": "form",
        "name": "apply_form",
        "elements": [
            {"tag": "markdown", "content": "**Selected items**"},
            {"tag": "markdown", "content": selected},
            {
                "tag": "input",
                "name": "Input_value",
                "placeholder": {"tag": "plain_text", "content": "Purpose"}
            },
            {
                "tag": "button",
                "name": FORM_BUTTON,
                "action_type": "form_submit",
                "type": "primary",
                "text": {"tag": "plain_text", "content": "Apply"},
                "value": element_value(state, Vec::new())
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Selection};
    use crate::useable::Useable;
    use crate::view::ViewKind;

    fn object(oid: u64, useable: Useable) -> Row {
        Row::Object(ObjectRow {
            oid,
            name: "screwdriver".into(),
            useable,
            wis: "warehouse".into(),
            note: String::new(),
            action: RowAction::Inspect,
        })
    }

    fn collect_values<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
        match v {
            Value::Object(m) => {
                for (k, child) in m {
                    if k == "value" && child.is_object() {
                        out.push(child);
                    }
                    collect_values(child, out);
                }
            }
            Value::Array(items) => items.iter().for_each(|i| collect_values(i, out)),
            _ => {}
        }
    }

    #[test]
    fn every_callback_value_carries_the_selection() {
        let mut selection = Selection::new();
        selection.set_checked(1_001_001, "screwdriver", true);
        let state = CardState::with_selection(1_001, selection.clone());
        let view = RenderedView::new(
            ViewKind::Items { list: 1_001 },
            vec![object(1_001_001, Useable::Available), object(1_001_002, Useable::Loaned)],
        );
        let card = render_card(&view, &state);

        let mut values = Vec::new();
        collect_values(&card, &mut values);
        assert!(values.len() >= 8);
        for value in values {
            assert_eq!(decode(value).unwrap().selection, selection);
        }
    }

    #[test]
    fn only_available_rows_are_selectable_and_checked_state_is_shown() {
        let mut selection = Selection::new();
        selection.set_checked(1_001_001, "screwdriver", true);
        let state = CardState::with_selection(1_001, selection);
        let view = RenderedView::new(
            ViewKind::Items { list: 1_001 },
            vec![object(1_001_001, Useable::Available), object(1_001_002, Useable::Pending)],
        );
        let card = render_card(&view, &state);
        let rows: Vec<&Value> = card["elements"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["tag"] == "checker")
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["checked"], true);
        assert_eq!(rows[0]["disabled"], false);
        assert_eq!(rows[1]["checked"], false);
        assert_eq!(rows[1]["disabled"], true);
    }

    #[test]
    fn empty_view_shows_notice() {
        let view = RenderedView::new(ViewKind::Search, Vec::new());
        let card = render_card(&view, &CardState::at(-2));
        let text = card.to_string();
        assert!(text.contains("No matching items"));
        assert!(text.contains(FORM_BUTTON));
    }
}
