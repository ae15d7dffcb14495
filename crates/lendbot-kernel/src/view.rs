//! View selection by object id.
//!
//! Negative ids are pseudo-views, `0` is the category listing and positive
//! ids pick the tier by magnitude. The store-backed half of resolution lives
//! in the server; this module only decides *which* view and how its rows are
//! shaped.

use crate::ids::{parent_of, tier_of, CategoryId, IdTier, ItemId, ListId};
use crate::useable::Useable;

pub const HOME_VIEW: i64 = 0;
pub const SELF_VIEW: i64 = -1;
pub const SEARCH_VIEW: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    SelfItems,
    Search,
    Categories,
    Lists { category: CategoryId },
    Items { list: ListId },
    Detail { item: ItemId },
}

impl ViewKind {
    pub fn resolve(view: i64) -> Self {
        match view {
            SELF_VIEW => ViewKind::SelfItems,
            SEARCH_VIEW => ViewKind::Search,
            v if v <= 0 => ViewKind::Categories,
            v => {
                let id = v as u64;
                match tier_of(id) {
                    Some(IdTier::Category) => ViewKind::Lists { category: id },
                    Some(IdTier::List) => ViewKind::Items { list: id },
                    Some(IdTier::Item) => ViewKind::Detail { item: id },
                    None => ViewKind::Categories,
                }
            }
        }
    }

    pub fn view_id(self) -> i64 {
        match self {
            ViewKind::SelfItems => SELF_VIEW,
            ViewKind::Search => SEARCH_VIEW,
            ViewKind::Categories => HOME_VIEW,
            ViewKind::Lists { category } => category as i64,
            ViewKind::Items { list } => list as i64,
            ViewKind::Detail { item } => item as i64,
        }
    }

    /// Id carried by the back button. Pseudo-views and the root carry `0`,
    /// which has no back target.
    pub fn back_anchor(self) -> i64 {
        self.view_id().max(HOME_VIEW)
    }

    pub fn title(self) -> &'static str {
        match self {
            ViewKind::SelfItems => "My items",
            ViewKind::Search => "Search results",
            ViewKind::Categories => "Categories",
            ViewKind::Lists { .. } => "Item types",
            ViewKind::Items { .. } => "Warehouse",
            ViewKind::Detail { .. } => "Item detail",
        }
    }
}

/// Target of the back button pressed on the view identified by `anchor`.
pub fn back_target(anchor: i64) -> Option<i64> {
    if anchor <= HOME_VIEW {
        return None;
    }
    Some(parent_of(anchor as u64) as i64)
}

/// How a free-text search is carried out against the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchPlan {
    pub by_id: Option<(IdTier, u64)>,
    pub by_name: Option<String>,
}

/// A positive integer query is tried as an id at its tier. An item id is
/// an exact lookup; anything else is also matched as a name substring and
/// the results merged.
pub fn plan_search(query: &str) -> SearchPlan {
    let query = query.trim();
    if query.is_empty() {
        return SearchPlan::default();
    }
    let by_id = query
        .parse::<u64>()
        .ok()
        .and_then(|id| tier_of(id).map(|tier| (tier, id)));
    let by_name = match by_id {
        Some((IdTier::Item, _)) => None,
        _ => Some(query.to_string()),
    };
    SearchPlan { by_id, by_name }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Inspect,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatRow {
    pub id: u64,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    pub oid: ItemId,
    pub name: String,
    pub useable: Useable,
    pub wis: String,
    pub note: String,
    pub action: RowAction,
}

impl ObjectRow {
    pub fn selectable(&self) -> bool {
        self.useable == Useable::Available
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Flat(FlatRow),
    Object(ObjectRow),
}

impl Row {
    pub fn id(&self) -> u64 {
        match self {
            Row::Flat(r) => r.id,
            Row::Object(r) => r.oid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedView {
    pub kind: ViewKind,
    pub rows: Vec<Row>,
    pub notice: Option<String>,
}

impl RenderedView {
    pub fn new(kind: ViewKind, rows: Vec<Row>) -> Self {
        let notice = rows.is_empty().then(|| "No matching items".to_string());
        Self { kind, rows, notice }
    }
}

/// Appends `extra` rows whose ids are not already present.
pub fn merge_rows(mut rows: Vec<Row>, extra: Vec<Row>) -> Vec<Row> {
    for row in extra {
        if !rows.iter().any(|r| r.id() == row.id()) {
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitude_selects_view_kind() {
        assert_eq!(ViewKind::resolve(-1), ViewKind::SelfItems);
        assert_eq!(ViewKind::resolve(-2), ViewKind::Search);
        assert_eq!(ViewKind::resolve(-9), ViewKind::Categories);
        assert_eq!(ViewKind::resolve(0), ViewKind::Categories);
        assert_eq!(ViewKind::resolve(3), ViewKind::Lists { category: 3 });
        assert_eq!(ViewKind::resolve(3_002), ViewKind::Items { list: 3_002 });
        assert_eq!(
            ViewKind::resolve(3_002_001),
            ViewKind::Detail { item: 3_002_001 }
        );
    }

    #[test]
    fn back_climbs_one_tier_and_stops_at_root() {
        assert_eq!(back_target(1_001_001), Some(1_001));
        assert_eq!(back_target(1_001), Some(1));
        assert_eq!(back_target(1), Some(0));
        assert_eq!(back_target(0), None);
        assert_eq!(ViewKind::SelfItems.back_anchor(), 0);
    }

    #[test]
    fn numeric_item_query_is_an_exact_lookup() {
        let plan = plan_search(" 1001001 ");
        assert_eq!(plan.by_id, Some((IdTier::Item, 1_001_001)));
        assert_eq!(plan.by_name, None);
    }

    #[test]
    fn list_id_query_also_searches_names() {
        let plan = plan_search("1001");
        assert_eq!(plan.by_id, Some((IdTier::List, 1_001)));
        assert_eq!(plan.by_name.as_deref(), Some("1001"));
    }

    #[test]
    fn text_query_searches_names_only() {
        let plan = plan_search("螺丝刀");
        assert_eq!(plan.by_id, None);
        assert_eq!(plan.by_name.as_deref(), Some("螺丝刀"));
        assert_eq!(plan_search("   "), SearchPlan::default());
    }

    #[test]
    fn oversized_number_is_a_name_query() {
        let plan = plan_search("18446744073709551615");
        assert_eq!(plan.by_id, None);
        assert_eq!(plan.by_name.as_deref(), Some("18446744073709551615"));
    }

    #[test]
    fn merge_skips_duplicate_ids() {
        let a = Row::Flat(FlatRow {
            id: 1_001,
            name: "a".into(),
            count: 1,
        });
        let b = Row::Flat(FlatRow {
            id: 1_002,
            name: "b".into(),
            count: 2,
        });
        let merged = merge_rows(vec![a.clone()], vec![a, b]);
        assert_eq!(merged.iter().map(Row::id).collect::<Vec<_>>(), vec![1_001, 1_002]);
    }
}
