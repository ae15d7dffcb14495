//! Store-backed view rendering.

use lendbot_kernel::card::render_card;
use lendbot_kernel::ids::IdTier;
use lendbot_kernel::view::{merge_rows, plan_search, FlatRow, ObjectRow, RowAction};
use lendbot_kernel::{CardState, RenderedView, Row, Useable, ViewKind};
use serde_json::Value;

use crate::error::BotError;
use crate::store::{Category, InventoryStore, ItemInfo, ItemList, SharedStore};

pub struct ViewResolver {
    store: SharedStore,
}

impl ViewResolver {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Rows for `state.view` as seen by the member displayed as `viewer`.
    pub async fn resolve(&self, state: &CardState, viewer: &str) -> Result<RenderedView, BotError> {
        let store = self.store.lock().await;
        render_view(store.inner(), state, viewer)
    }

    /// Full card body for `state`.
    pub async fn card(&self, state: &CardState, viewer: &str) -> Result<Value, BotError> {
        let view = self.resolve(state, viewer).await?;
        Ok(render_card(&view, state))
    }
}

pub fn render_view(
    store: &dyn InventoryStore,
    state: &CardState,
    viewer: &str,
) -> Result<RenderedView, BotError> {
    let kind = ViewKind::resolve(state.view);
    let rows = match kind {
        ViewKind::SelfItems => store
            .items_held_by(viewer)?
            .into_iter()
            .map(|item| object_row(item, RowAction::Return))
            .collect(),
        ViewKind::Search => return search(store, state.query.as_deref().unwrap_or_default(), viewer),
        ViewKind::Categories => store.categories()?.into_iter().map(category_row).collect(),
        ViewKind::Lists { category } => {
            store
                .category(category)?
                .ok_or_else(|| BotError::NotFound(format!("category {category}")))?;
            store.lists_in(category)?.into_iter().map(list_row).collect()
        }
        ViewKind::Items { list } => {
            store
                .list(list)?
                .ok_or_else(|| BotError::NotFound(format!("item type {list}")))?;
            store
                .items_in(list)?
                .into_iter()
                .map(|item| object_row(item, RowAction::Inspect))
                .collect()
        }
        ViewKind::Detail { item } => {
            let item = store
                .item(item)?
                .ok_or_else(|| BotError::NotFound(format!("item {item}")))?;
            vec![detail_row(item, viewer)]
        }
    };
    Ok(RenderedView::new(kind, rows))
}

/// An item id resolves straight to that item's detail view. Other numeric
/// targets are looked up at their tier and merged with a name match.
fn search(store: &dyn InventoryStore, query: &str, viewer: &str) -> Result<RenderedView, BotError> {
    let plan = plan_search(query);
    let mut rows = Vec::new();
    match plan.by_id {
        Some((IdTier::Item, oid)) => {
            if let Some(item) = store.item(oid)? {
                return Ok(RenderedView::new(
                    ViewKind::Detail { item: oid },
                    vec![detail_row(item, viewer)],
                ));
            }
        }
        Some((IdTier::List, id)) => rows.extend(store.list(id)?.map(list_row)),
        Some((IdTier::Category, id)) => rows.extend(store.category(id)?.map(category_row)),
        None => {}
    }
    if let Some(fragment) = plan.by_name {
        let by_name = store
            .lists_matching(&fragment)?
            .into_iter()
            .map(list_row)
            .collect();
        rows = merge_rows(rows, by_name);
    }
    Ok(RenderedView::new(ViewKind::Search, rows))
}

fn category_row(category: Category) -> Row {
    Row::Flat(FlatRow {
        id: category.id,
        name: category.name,
        count: category.total,
    })
}

fn list_row(list: ItemList) -> Row {
    Row::Flat(FlatRow {
        id: list.id,
        name: list.name,
        count: list.free,
    })
}

fn object_row(item: ItemInfo, action: RowAction) -> Row {
    Row::Object(ObjectRow {
        oid: item.id,
        name: item.name,
        useable: item.useable,
        wis: item.wis,
        note: item.note,
        action,
    })
}

fn detail_row(item: ItemInfo, viewer: &str) -> Row {
    let action = if item.useable == Useable::Loaned && item.wis == viewer {
        RowAction::Return
    } else {
        RowAction::Inspect
    };
    object_row(item, action)
}
