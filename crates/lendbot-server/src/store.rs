//! Inventory store.
//!
//! Two backends behind one trait: an in-memory map set for tests and
//! single-process runs, and sqlite for persistence. Every item mutation
//! recomputes the owning list's counters and the category total before it
//! returns, inside the same transaction on sqlite.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lendbot_contracts::{ApprovalStatus, UserIds};
use lendbot_kernel::ids::{self, next_child_id, parent_of, CategoryId, ItemId, ListId, MAX_SEQ};
use lendbot_kernel::Useable;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemList {
    pub id: ListId,
    pub father: CategoryId,
    pub name: String,
    pub total: u64,
    pub free: u64,
    pub broken: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: ItemId,
    pub father: ListId,
    /// Name of the owning list.
    pub name: String,
    pub useable: Useable,
    pub wis: String,
    pub note: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    pub open_id: Option<String>,
    pub union_id: Option<String>,
    pub name: String,
    pub root: bool,
    pub card_message_id: Option<String>,
    pub card_created_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time_ms: i64,
    pub user_id: String,
    pub operation: String,
    pub object: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub instance_code: String,
    pub applicant_user_id: String,
    pub oids: Vec<ItemId>,
    pub names: Vec<String>,
    pub purpose: String,
    pub status: ApprovalStatus,
    pub created_ms: i64,
    pub resolved_ms: Option<i64>,
}

/// Conditional update of one item. Applied only when the item's current
/// state is one of `allowed_from`.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub oid: ItemId,
    pub allowed_from: Vec<Useable>,
    pub to: Useable,
    /// `None` keeps the current holder.
    pub wis: Option<String>,
    pub purpose: Option<String>,
    pub log: LogEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Item is already in the target state; nothing written.
    Unchanged,
    Rejected { current: Useable },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// Nothing was written; these items were missing or not in an allowed
    /// state.
    Rejected(Vec<ItemId>),
}

pub trait InventoryStore: Send {
    fn categories(&self) -> Result<Vec<Category>, StoreError>;
    fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError>;
    fn category_by_name(&self, name: &str) -> Result<Option<Category>, StoreError>;
    fn add_category(&mut self, name: &str) -> Result<Category, StoreError>;
    fn delete_category(&mut self, id: CategoryId) -> Result<(), StoreError>;

    fn lists_in(&self, category: CategoryId) -> Result<Vec<ItemList>, StoreError>;
    fn list(&self, id: ListId) -> Result<Option<ItemList>, StoreError>;
    fn list_by_name(&self, name: &str) -> Result<Option<ItemList>, StoreError>;
    fn lists_matching(&self, fragment: &str) -> Result<Vec<ItemList>, StoreError>;
    fn add_list(&mut self, category: CategoryId, name: &str) -> Result<ItemList, StoreError>;
    fn delete_list(&mut self, id: ListId) -> Result<(), StoreError>;

    fn items_in(&self, list: ListId) -> Result<Vec<ItemInfo>, StoreError>;
    fn item(&self, oid: ItemId) -> Result<Option<ItemInfo>, StoreError>;
    fn items_held_by(&self, wis: &str) -> Result<Vec<ItemInfo>, StoreError>;
    /// Appends `num` units to `list`; the first `num_broken` are scrapped.
    fn add_items(
        &mut self,
        list: ListId,
        num: u64,
        num_broken: u64,
        wis: &str,
        log: &LogEntry,
    ) -> Result<Vec<ItemId>, StoreError>;
    fn delete_item(&mut self, oid: ItemId, log: &LogEntry) -> Result<(), StoreError>;
    fn set_item_state(&mut self, update: &ItemUpdate) -> Result<Transition, StoreError>;
    /// All-or-nothing variant: either every update applies or none does.
    fn set_items_state(&mut self, updates: &[ItemUpdate]) -> Result<BatchOutcome, StoreError>;
    fn logs_for(&self, object: u64) -> Result<Vec<LogEntry>, StoreError>;

    fn member(&self, user_id: &str) -> Result<Option<Member>, StoreError>;
    fn upsert_member(&mut self, member: &Member) -> Result<(), StoreError>;
    fn set_root(&mut self, user_id: &str, root: bool) -> Result<bool, StoreError>;
    fn roots(&self) -> Result<Vec<Member>, StoreError>;
    fn set_card(&mut self, user_id: &str, card: Option<(&str, i64)>) -> Result<(), StoreError>;

    fn save_approval(&mut self, record: &ApprovalRecord) -> Result<(), StoreError>;
    fn approval(&self, instance_code: &str) -> Result<Option<ApprovalRecord>, StoreError>;
    /// Moves a pending record to `status`. Returns false if the record was
    /// already resolved.
    fn resolve_approval(
        &mut self,
        instance_code: &str,
        status: ApprovalStatus,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Records `event_id` until `now_ms + ttl_ms`. True on first sight or
    /// when the previous record has expired.
    fn mark_seen(&mut self, event_id: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError>;
    fn forget_seen(&mut self, event_id: &str) -> Result<(), StoreError>;
    /// Counts one hit for `key` in `bucket` and returns the bucket's count.
    fn hit_rate(&mut self, key: &str, bucket: i64) -> Result<u64, StoreError>;
}

/// Handle shared by every request. Never held across a gateway call.
pub type SharedStore = Arc<Mutex<StoreBackend>>;

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(kind: &str, sqlite_path: Option<&str>) -> Result<Self, StoreError> {
        match (kind, sqlite_path) {
            ("sqlite", Some(path)) => Ok(StoreBackend::Sqlite(SqliteStore::new(path)?)),
            ("sqlite", None) => Err(StoreError::Conflict(
                "store.sqlite_path is required for sqlite store".to_string(),
            )),
            _ => Ok(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    pub fn inner(&self) -> &dyn InventoryStore {
        match self {
            StoreBackend::Memory(s) => s as &dyn InventoryStore,
            StoreBackend::Sqlite(s) => s as &dyn InventoryStore,
        }
    }

    pub fn inner_mut(&mut self) -> &mut dyn InventoryStore {
        match self {
            StoreBackend::Memory(s) => s as &mut dyn InventoryStore,
            StoreBackend::Sqlite(s) => s as &mut dyn InventoryStore,
        }
    }

    /// Looks up the acting user, registering unknown users under their user
    /// id as display name.
    pub fn ensure_member(&mut self, ids: &UserIds) -> Result<Member, StoreError> {
        let store = self.inner_mut();
        if let Some(mut member) = store.member(&ids.user_id)? {
            if member.open_id.is_none() && ids.open_id.is_some() {
                member.open_id = ids.open_id.clone();
                member.union_id = ids.union_id.clone();
                store.upsert_member(&member)?;
            }
            return Ok(member);
        }
        let member = Member {
            user_id: ids.user_id.clone(),
            open_id: ids.open_id.clone(),
            union_id: ids.union_id.clone(),
            name: ids.user_id.clone(),
            ..Member::default()
        };
        store.upsert_member(&member)?;
        Ok(member)
    }
}

fn next_id(parent: u64, last: Option<u64>, what: &str) -> Result<u64, StoreError> {
    next_child_id(parent, last)
        .ok_or_else(|| StoreError::Conflict(format!("{what} id space under {parent} is exhausted")))
}

fn next_category_id(last: Option<u64>) -> Result<u64, StoreError> {
    let id = last.map(|l| l + 1).unwrap_or(1);
    if id > MAX_SEQ {
        return Err(StoreError::Conflict("category id space is exhausted".into()));
    }
    Ok(id)
}

fn useable_from(code: i64) -> Result<Useable, StoreError> {
    Useable::from_code(code).ok_or_else(|| StoreError::Corrupt(format!("useable code {code}")))
}

fn holder_matches(current: &str, wanted: Option<&String>) -> bool {
    wanted.map(|w| w == current).unwrap_or(true)
}

#[derive(Default)]
pub struct MemoryStore {
    categories: BTreeMap<CategoryId, Category>,
    lists: BTreeMap<ListId, ItemList>,
    items: BTreeMap<ItemId, ItemInfo>,
    members: BTreeMap<String, Member>,
    logs: Vec<LogEntry>,
    approvals: HashMap<String, ApprovalRecord>,
    seen: HashMap<String, i64>,
    rate: HashMap<String, HashMap<i64, u64>>,
}

impl MemoryStore {
    fn hydrate(&self, item: &ItemInfo) -> ItemInfo {
        let mut item = item.clone();
        if let Some(list) = self.lists.get(&item.father) {
            item.name = list.name.clone();
        }
        item
    }

    fn recompute(&mut self, list_id: ListId) {
        let (mut total, mut free, mut broken) = (0, 0, 0);
        for item in self.items.values().filter(|i| i.father == list_id) {
            total += 1;
            match item.useable {
                Useable::Available => free += 1,
                Useable::Scrapped => broken += 1,
                _ => {}
            }
        }
        if let Some(list) = self.lists.get_mut(&list_id) {
            list.total = total;
            list.free = free;
            list.broken = broken;
        }
        self.recompute_category(parent_of(list_id));
    }

    fn recompute_category(&mut self, category_id: CategoryId) {
        let total = self
            .lists
            .values()
            .filter(|l| l.father == category_id)
            .map(|l| l.total)
            .sum();
        if let Some(category) = self.categories.get_mut(&category_id) {
            category.total = total;
        }
    }

    fn check(&self, update: &ItemUpdate) -> Result<Transition, StoreError> {
        let item = self
            .items
            .get(&update.oid)
            .ok_or_else(|| StoreError::NotFound(format!("item {}", update.oid)))?;
        Ok(classify(item.useable, &item.wis, update))
    }

    fn apply(&mut self, update: &ItemUpdate) {
        if let Some(item) = self.items.get_mut(&update.oid) {
            item.useable = update.to;
            if let Some(wis) = &update.wis {
                item.wis = wis.clone();
            }
            if let Some(purpose) = &update.purpose {
                item.purpose = purpose.clone();
            }
        }
        self.logs.push(update.log.clone());
        self.recompute(parent_of(update.oid));
    }
}

fn classify(current: Useable, wis: &str, update: &ItemUpdate) -> Transition {
    if update.allowed_from.contains(&current) {
        Transition::Applied
    } else if current == update.to && holder_matches(wis, update.wis.as_ref()) {
        Transition::Unchanged
    } else {
        Transition::Rejected { current }
    }
}

impl InventoryStore for MemoryStore {
    fn categories(&self) -> Result<Vec<Category>, StoreError> {
        Ok(self.categories.values().cloned().collect())
    }

    fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError> {
        Ok(self.categories.get(&id).cloned())
    }

    fn category_by_name(&self, name: &str) -> Result<Option<Category>, StoreError> {
        Ok(self.categories.values().find(|c| c.name == name).cloned())
    }

    fn add_category(&mut self, name: &str) -> Result<Category, StoreError> {
        if self.category_by_name(name)?.is_some() {
            return Err(StoreError::Conflict(format!("category {name:?} exists")));
        }
        let id = next_category_id(self.categories.keys().next_back().copied())?;
        let category = Category {
            id,
            name: name.to_string(),
            total: 0,
        };
        self.categories.insert(id, category.clone());
        Ok(category)
    }

    fn delete_category(&mut self, id: CategoryId) -> Result<(), StoreError> {
        if !self.categories.contains_key(&id) {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        if self.lists.values().any(|l| l.father == id) {
            return Err(StoreError::Conflict(format!("category {id} still has item types")));
        }
        self.categories.remove(&id);
        Ok(())
    }

    fn lists_in(&self, category: CategoryId) -> Result<Vec<ItemList>, StoreError> {
        Ok(self
            .lists
            .values()
            .filter(|l| l.father == category)
            .cloned()
            .collect())
    }

    fn list(&self, id: ListId) -> Result<Option<ItemList>, StoreError> {
        Ok(self.lists.get(&id).cloned())
    }

    fn list_by_name(&self, name: &str) -> Result<Option<ItemList>, StoreError> {
        Ok(self.lists.values().find(|l| l.name == name).cloned())
    }

    fn lists_matching(&self, fragment: &str) -> Result<Vec<ItemList>, StoreError> {
        Ok(self
            .lists
            .values()
            .filter(|l| l.name.contains(fragment))
            .cloned()
            .collect())
    }

    fn add_list(&mut self, category: CategoryId, name: &str) -> Result<ItemList, StoreError> {
        if !self.categories.contains_key(&category) {
            return Err(StoreError::NotFound(format!("category {category}")));
        }
        if self.list_by_name(name)?.is_some() {
            return Err(StoreError::Conflict(format!("item type {name:?} exists")));
        }
        let last = self
            .lists
            .range(ids::child_id(category, 0)..ids::child_id(category + 1, 0))
            .next_back()
            .map(|(id, _)| *id);
        let id = next_id(category, last, "item type")?;
        let list = ItemList {
            id,
            father: category,
            name: name.to_string(),
            total: 0,
            free: 0,
            broken: 0,
        };
        self.lists.insert(id, list.clone());
        Ok(list)
    }

    fn delete_list(&mut self, id: ListId) -> Result<(), StoreError> {
        if !self.lists.contains_key(&id) {
            return Err(StoreError::NotFound(format!("item type {id}")));
        }
        if self.items.values().any(|i| i.father == id) {
            return Err(StoreError::Conflict(format!("item type {id} still has items")));
        }
        self.lists.remove(&id);
        self.recompute_category(parent_of(id));
        Ok(())
    }

    fn items_in(&self, list: ListId) -> Result<Vec<ItemInfo>, StoreError> {
        Ok(self
            .items
            .values()
            .filter(|i| i.father == list)
            .map(|i| self.hydrate(i))
            .collect())
    }

    fn item(&self, oid: ItemId) -> Result<Option<ItemInfo>, StoreError> {
        Ok(self.items.get(&oid).map(|i| self.hydrate(i)))
    }

    fn items_held_by(&self, wis: &str) -> Result<Vec<ItemInfo>, StoreError> {
        Ok(self
            .items
            .values()
            .filter(|i| i.wis == wis)
            .map(|i| self.hydrate(i))
            .collect())
    }

    fn add_items(
        &mut self,
        list: ListId,
        num: u64,
        num_broken: u64,
        wis: &str,
        log: &LogEntry,
    ) -> Result<Vec<ItemId>, StoreError> {
        if !self.lists.contains_key(&list) {
            return Err(StoreError::NotFound(format!("item type {list}")));
        }
        let mut last = self
            .items
            .range(ids::child_id(list, 0)..ids::child_id(list + 1, 0))
            .next_back()
            .map(|(id, _)| *id);
        let mut created = Vec::new();
        for n in 0..num {
            let id = next_id(list, last, "item")?;
            created.push((
                id,
                if n < num_broken {
                    Useable::Scrapped
                } else {
                    Useable::Available
                },
            ));
            last = Some(id);
        }
        for (id, useable) in &created {
            self.items.insert(
                *id,
                ItemInfo {
                    id: *id,
                    father: list,
                    name: String::new(),
                    useable: *useable,
                    wis: wis.to_string(),
                    note: String::new(),
                    purpose: String::new(),
                },
            );
            self.logs.push(LogEntry {
                object: *id,
                ..log.clone()
            });
        }
        self.recompute(list);
        Ok(created.into_iter().map(|(id, _)| id).collect())
    }

    fn delete_item(&mut self, oid: ItemId, log: &LogEntry) -> Result<(), StoreError> {
        if self.items.remove(&oid).is_none() {
            return Err(StoreError::NotFound(format!("item {oid}")));
        }
        self.logs.push(log.clone());
        self.recompute(parent_of(oid));
        Ok(())
    }

    fn set_item_state(&mut self, update: &ItemUpdate) -> Result<Transition, StoreError> {
        let transition = self.check(update)?;
        if transition == Transition::Applied {
            self.apply(update);
        }
        Ok(transition)
    }

    fn set_items_state(&mut self, updates: &[ItemUpdate]) -> Result<BatchOutcome, StoreError> {
        let rejected: Vec<ItemId> = updates
            .iter()
            .filter(|u| {
                self.items
                    .get(&u.oid)
                    .map(|i| !u.allowed_from.contains(&i.useable))
                    .unwrap_or(true)
            })
            .map(|u| u.oid)
            .collect();
        if !rejected.is_empty() {
            return Ok(BatchOutcome::Rejected(rejected));
        }
        for update in updates {
            self.apply(update);
        }
        Ok(BatchOutcome::Applied)
    }

    fn logs_for(&self, object: u64) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .logs
            .iter()
            .filter(|l| l.object == object)
            .cloned()
            .collect())
    }

    fn member(&self, user_id: &str) -> Result<Option<Member>, StoreError> {
        Ok(self.members.get(user_id).cloned())
    }

    fn upsert_member(&mut self, member: &Member) -> Result<(), StoreError> {
        self.members.insert(member.user_id.clone(), member.clone());
        Ok(())
    }

    fn set_root(&mut self, user_id: &str, root: bool) -> Result<bool, StoreError> {
        Ok(match self.members.get_mut(user_id) {
            Some(m) => {
                m.root = root;
                true
            }
            None => false,
        })
    }

    fn roots(&self) -> Result<Vec<Member>, StoreError> {
        Ok(self.members.values().filter(|m| m.root).cloned().collect())
    }

    fn set_card(&mut self, user_id: &str, card: Option<(&str, i64)>) -> Result<(), StoreError> {
        let member = self
            .members
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("member {user_id}")))?;
        member.card_message_id = card.map(|(id, _)| id.to_string());
        member.card_created_ms = card.map(|(_, at)| at);
        Ok(())
    }

    fn save_approval(&mut self, record: &ApprovalRecord) -> Result<(), StoreError> {
        self.approvals
            .insert(record.instance_code.clone(), record.clone());
        Ok(())
    }

    fn approval(&self, instance_code: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        Ok(self.approvals.get(instance_code).cloned())
    }

    fn resolve_approval(
        &mut self,
        instance_code: &str,
        status: ApprovalStatus,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        match self.approvals.get_mut(instance_code) {
            Some(record) if record.status == ApprovalStatus::Pending => {
                record.status = status;
                record.resolved_ms = Some(now_ms);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("approval {instance_code}"))),
        }
    }

    fn mark_seen(&mut self, event_id: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError> {
        match self.seen.get(event_id) {
            Some(expires) if *expires > now_ms => Ok(false),
            _ => {
                self.seen.retain(|_, expires| *expires > now_ms);
                self.seen.insert(event_id.to_string(), now_ms + ttl_ms);
                Ok(true)
            }
        }
    }

    fn forget_seen(&mut self, event_id: &str) -> Result<(), StoreError> {
        self.seen.remove(event_id);
        Ok(())
    }

    fn hit_rate(&mut self, key: &str, bucket: i64) -> Result<u64, StoreError> {
        let buckets = self.rate.entry(key.to_string()).or_default();
        buckets.retain(|b, _| *b >= bucket);
        let count = buckets.entry(bucket).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

pub struct SqliteStore {
    conn: Connection,
}

const ITEM_COLUMNS: &str =
    "i.id, i.father, COALESCE(l.name, ''), i.useable, i.wis, i.note, i.purpose";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS item_category (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                total INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS item_list (
                id INTEGER PRIMARY KEY,
                father INTEGER NOT NULL,
                name TEXT NOT NULL UNIQUE,
                total INTEGER NOT NULL DEFAULT 0,
                free INTEGER NOT NULL DEFAULT 0,
                broken INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS item_info (
                id INTEGER PRIMARY KEY,
                father INTEGER NOT NULL,
                useable INTEGER NOT NULL,
                wis TEXT NOT NULL,
                note TEXT NOT NULL DEFAULT '',
                purpose TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS item_info_father ON item_info(father);
            CREATE INDEX IF NOT EXISTS item_info_wis ON item_info(wis);
            CREATE TABLE IF NOT EXISTS members (
                user_id TEXT PRIMARY KEY,
                open_id TEXT,
                union_id TEXT,
                name TEXT NOT NULL,
                root INTEGER NOT NULL DEFAULT 0,
                card_message_id TEXT,
                card_created_ms INTEGER
            );
            CREATE TABLE IF NOT EXISTS logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                time_ms INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                object INTEGER NOT NULL,
                note TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS approvals (
                instance_code TEXT PRIMARY KEY,
                applicant_user_id TEXT NOT NULL,
                oids_json TEXT NOT NULL,
                names_json TEXT NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS seen_events (
                event_id TEXT PRIMARY KEY,
                expires_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rate_windows (
                rate_key TEXT NOT NULL,
                bucket INTEGER NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (rate_key, bucket)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn query_items(
        &self,
        filter: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<ItemInfo>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM item_info i LEFT JOIN item_list l ON l.id = i.father
             WHERE {filter} ORDER BY i.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(&[param], item_row)?;
        collect_items(rows)
    }

    fn query_lists(
        &self,
        filter: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<ItemList>, StoreError> {
        let sql = format!(
            "SELECT id, father, name, total, free, broken FROM item_list WHERE {filter} ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(&[param], list_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

type RawItem = (u64, u64, String, i64, String, String, String);

fn item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn to_item(raw: RawItem) -> Result<ItemInfo, StoreError> {
    let (id, father, name, useable, wis, note, purpose) = raw;
    Ok(ItemInfo {
        id,
        father,
        name,
        useable: useable_from(useable)?,
        wis,
        note,
        purpose,
    })
}

fn collect_items(
    rows: impl Iterator<Item = rusqlite::Result<RawItem>>,
) -> Result<Vec<ItemInfo>, StoreError> {
    rows.map(|r| r.map_err(StoreError::from).and_then(to_item))
        .collect()
}

fn list_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemList> {
    Ok(ItemList {
        id: row.get(0)?,
        father: row.get(1)?,
        name: row.get(2)?,
        total: row.get(3)?,
        free: row.get(4)?,
        broken: row.get(5)?,
    })
}

fn category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        total: row.get(2)?,
    })
}

fn member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        user_id: row.get(0)?,
        open_id: row.get(1)?,
        union_id: row.get(2)?,
        name: row.get(3)?,
        root: row.get::<_, i64>(4)? != 0,
        card_message_id: row.get(5)?,
        card_created_ms: row.get(6)?,
    })
}

const MEMBER_COLUMNS: &str =
    "user_id, open_id, union_id, name, root, card_message_id, card_created_ms";

fn recompute_tx(tx: &Transaction<'_>, list_id: ListId) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE item_list SET
            total = (SELECT COUNT(*) FROM item_info WHERE father = ?1),
            free = (SELECT COUNT(*) FROM item_info WHERE father = ?1 AND useable = ?2),
            broken = (SELECT COUNT(*) FROM item_info WHERE father = ?1 AND useable = ?3)
         WHERE id = ?1",
        params![
            list_id,
            Useable::Available.code(),
            Useable::Scrapped.code()
        ],
    )?;
    recompute_category_tx(tx, parent_of(list_id))
}

fn recompute_category_tx(tx: &Transaction<'_>, category_id: CategoryId) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE item_category SET
            total = (SELECT COALESCE(SUM(total), 0) FROM item_list WHERE father = ?1)
         WHERE id = ?1",
        params![category_id],
    )?;
    Ok(())
}

fn insert_log(tx: &Transaction<'_>, log: &LogEntry) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO logs (time_ms, user_id, operation, object, note) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![log.time_ms, log.user_id, log.operation, log.object, log.note],
    )?;
    Ok(())
}

fn current_state(tx: &Transaction<'_>, oid: ItemId) -> Result<Option<(Useable, String)>, StoreError> {
    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT useable, wis FROM item_info WHERE id = ?1",
            params![oid],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((code, wis)) => Ok(Some((useable_from(code)?, wis))),
        None => Ok(None),
    }
}

fn apply_tx(tx: &Transaction<'_>, update: &ItemUpdate, from: Useable) -> Result<(), StoreError> {
    let changed = tx.execute(
        "UPDATE item_info SET
            useable = ?1,
            wis = COALESCE(?2, wis),
            purpose = COALESCE(?3, purpose)
         WHERE id = ?4 AND useable = ?5",
        params![
            update.to.code(),
            update.wis,
            update.purpose,
            update.oid,
            from.code()
        ],
    )?;
    if changed != 1 {
        return Err(StoreError::Conflict(format!(
            "item {} changed concurrently",
            update.oid
        )));
    }
    insert_log(tx, &update.log)?;
    recompute_tx(tx, parent_of(update.oid))
}

impl InventoryStore for SqliteStore {
    fn categories(&self) -> Result<Vec<Category>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, total FROM item_category ORDER BY id")?;
        let rows = stmt.query_map([], category_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn category(&self, id: CategoryId) -> Result<Option<Category>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, total FROM item_category WHERE id = ?1",
                params![id],
                category_row,
            )
            .optional()?)
    }

    fn category_by_name(&self, name: &str) -> Result<Option<Category>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, total FROM item_category WHERE name = ?1",
                params![name],
                category_row,
            )
            .optional()?)
    }

    fn add_category(&mut self, name: &str) -> Result<Category, StoreError> {
        let tx = self.conn.transaction()?;
        let exists: Option<u64> = tx
            .query_row(
                "SELECT id FROM item_category WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!("category {name:?} exists")));
        }
        let last: Option<u64> =
            tx.query_row("SELECT MAX(id) FROM item_category", [], |r| r.get(0))?;
        let id = next_category_id(last)?;
        tx.execute(
            "INSERT INTO item_category (id, name, total) VALUES (?1, ?2, 0)",
            params![id, name],
        )?;
        tx.commit()?;
        Ok(Category {
            id,
            name: name.to_string(),
            total: 0,
        })
    }

    fn delete_category(&mut self, id: CategoryId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let children: u64 = tx.query_row(
            "SELECT COUNT(*) FROM item_list WHERE father = ?1",
            params![id],
            |r| r.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::Conflict(format!("category {id} still has item types")));
        }
        if tx.execute("DELETE FROM item_category WHERE id = ?1", params![id])? == 0 {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        tx.commit()?;
        Ok(())
    }

    fn lists_in(&self, category: CategoryId) -> Result<Vec<ItemList>, StoreError> {
        self.query_lists("father = ?1", &category)
    }

    fn list(&self, id: ListId) -> Result<Option<ItemList>, StoreError> {
        Ok(self.query_lists("id = ?1", &id)?.into_iter().next())
    }

    fn list_by_name(&self, name: &str) -> Result<Option<ItemList>, StoreError> {
        Ok(self.query_lists("name = ?1", &name)?.into_iter().next())
    }

    fn lists_matching(&self, fragment: &str) -> Result<Vec<ItemList>, StoreError> {
        self.query_lists("instr(name, ?1) > 0", &fragment)
    }

    fn add_list(&mut self, category: CategoryId, name: &str) -> Result<ItemList, StoreError> {
        let tx = self.conn.transaction()?;
        let parent: Option<u64> = tx
            .query_row(
                "SELECT id FROM item_category WHERE id = ?1",
                params![category],
                |r| r.get(0),
            )
            .optional()?;
        if parent.is_none() {
            return Err(StoreError::NotFound(format!("category {category}")));
        }
        let exists: Option<u64> = tx
            .query_row(
                "SELECT id FROM item_list WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!("item type {name:?} exists")));
        }
        let last: Option<u64> = tx.query_row(
            "SELECT MAX(id) FROM item_list WHERE father = ?1",
            params![category],
            |r| r.get(0),
        )?;
        let id = next_id(category, last, "item type")?;
        tx.execute(
            "INSERT INTO item_list (id, father, name) VALUES (?1, ?2, ?3)",
            params![id, category, name],
        )?;
        tx.commit()?;
        Ok(ItemList {
            id,
            father: category,
            name: name.to_string(),
            total: 0,
            free: 0,
            broken: 0,
        })
    }

    fn delete_list(&mut self, id: ListId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let children: u64 = tx.query_row(
            "SELECT COUNT(*) FROM item_info WHERE father = ?1",
            params![id],
            |r| r.get(0),
        )?;
        if children > 0 {
            return Err(StoreError::Conflict(format!("item type {id} still has items")));
        }
        if tx.execute("DELETE FROM item_list WHERE id = ?1", params![id])? == 0 {
            return Err(StoreError::NotFound(format!("item type {id}")));
        }
        recompute_category_tx(&tx, parent_of(id))?;
        tx.commit()?;
        Ok(())
    }

    fn items_in(&self, list: ListId) -> Result<Vec<ItemInfo>, StoreError> {
        self.query_items("i.father = ?1", &list)
    }

    fn item(&self, oid: ItemId) -> Result<Option<ItemInfo>, StoreError> {
        Ok(self.query_items("i.id = ?1", &oid)?.into_iter().next())
    }

    fn items_held_by(&self, wis: &str) -> Result<Vec<ItemInfo>, StoreError> {
        self.query_items("i.wis = ?1", &wis)
    }

    fn add_items(
        &mut self,
        list: ListId,
        num: u64,
        num_broken: u64,
        wis: &str,
        log: &LogEntry,
    ) -> Result<Vec<ItemId>, StoreError> {
        let tx = self.conn.transaction()?;
        let parent: Option<u64> = tx
            .query_row("SELECT id FROM item_list WHERE id = ?1", params![list], |r| {
                r.get(0)
            })
            .optional()?;
        if parent.is_none() {
            return Err(StoreError::NotFound(format!("item type {list}")));
        }
        let mut last: Option<u64> = tx.query_row(
            "SELECT MAX(id) FROM item_info WHERE father = ?1",
            params![list],
            |r| r.get(0),
        )?;
        let mut created = Vec::new();
        for n in 0..num {
            let id = next_id(list, last, "item")?;
            let useable = if n < num_broken {
                Useable::Scrapped
            } else {
                Useable::Available
            };
            tx.execute(
                "INSERT INTO item_info (id, father, useable, wis) VALUES (?1, ?2, ?3, ?4)",
                params![id, list, useable.code(), wis],
            )?;
            insert_log(
                &tx,
                &LogEntry {
                    object: id,
                    ..log.clone()
                },
            )?;
            created.push(id);
            last = Some(id);
        }
        recompute_tx(&tx, list)?;
        tx.commit()?;
        Ok(created)
    }

    fn delete_item(&mut self, oid: ItemId, log: &LogEntry) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        if tx.execute("DELETE FROM item_info WHERE id = ?1", params![oid])? == 0 {
            return Err(StoreError::NotFound(format!("item {oid}")));
        }
        insert_log(&tx, log)?;
        recompute_tx(&tx, parent_of(oid))?;
        tx.commit()?;
        Ok(())
    }

    fn set_item_state(&mut self, update: &ItemUpdate) -> Result<Transition, StoreError> {
        let tx = self.conn.transaction()?;
        let (current, wis) = current_state(&tx, update.oid)?
            .ok_or_else(|| StoreError::NotFound(format!("item {}", update.oid)))?;
        let transition = classify(current, &wis, update);
        if transition == Transition::Applied {
            apply_tx(&tx, update, current)?;
            tx.commit()?;
        }
        Ok(transition)
    }

    fn set_items_state(&mut self, updates: &[ItemUpdate]) -> Result<BatchOutcome, StoreError> {
        let tx = self.conn.transaction()?;
        let mut rejected = Vec::new();
        let mut current = Vec::with_capacity(updates.len());
        for update in updates {
            match current_state(&tx, update.oid)? {
                Some((state, _)) if update.allowed_from.contains(&state) => current.push(state),
                _ => rejected.push(update.oid),
            }
        }
        if !rejected.is_empty() {
            return Ok(BatchOutcome::Rejected(rejected));
        }
        for (update, from) in updates.iter().zip(current) {
            apply_tx(&tx, update, from)?;
        }
        tx.commit()?;
        Ok(BatchOutcome::Applied)
    }

    fn logs_for(&self, object: u64) -> Result<Vec<LogEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT time_ms, user_id, operation, object, note FROM logs WHERE object = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![object], |r| {
            Ok(LogEntry {
                time_ms: r.get(0)?,
                user_id: r.get(1)?,
                operation: r.get(2)?,
                object: r.get(3)?,
                note: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn member(&self, user_id: &str) -> Result<Option<Member>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE user_id = ?1"),
                params![user_id],
                member_row,
            )
            .optional()?)
    }

    fn upsert_member(&mut self, member: &Member) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO members (user_id, open_id, union_id, name, root, card_message_id, card_created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                open_id = excluded.open_id,
                union_id = excluded.union_id,
                name = excluded.name,
                root = excluded.root,
                card_message_id = excluded.card_message_id,
                card_created_ms = excluded.card_created_ms",
            params![
                member.user_id,
                member.open_id,
                member.union_id,
                member.name,
                member.root as i64,
                member.card_message_id,
                member.card_created_ms
            ],
        )?;
        Ok(())
    }

    fn set_root(&mut self, user_id: &str, root: bool) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE members SET root = ?1 WHERE user_id = ?2",
            params![root as i64, user_id],
        )?;
        Ok(changed == 1)
    }

    fn roots(&self) -> Result<Vec<Member>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE root = 1 ORDER BY user_id"
        ))?;
        let rows = stmt.query_map([], member_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_card(&mut self, user_id: &str, card: Option<(&str, i64)>) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE members SET card_message_id = ?1, card_created_ms = ?2 WHERE user_id = ?3",
            params![card.map(|(id, _)| id), card.map(|(_, at)| at), user_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("member {user_id}")));
        }
        Ok(())
    }

    fn save_approval(&mut self, record: &ApprovalRecord) -> Result<(), StoreError> {
        let oids = serde_json::to_string(&record.oids)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let names = serde_json::to_string(&record.names)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO approvals
             (instance_code, applicant_user_id, oids_json, names_json, purpose, status, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.instance_code,
                record.applicant_user_id,
                oids,
                names,
                record.purpose,
                record.status.as_str(),
                record.created_ms,
                record.resolved_ms
            ],
        )?;
        Ok(())
    }

    fn approval(&self, instance_code: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        let row: Option<(String, String, String, String, String, i64, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT applicant_user_id, oids_json, names_json, purpose, status, created_at, resolved_at
                 FROM approvals WHERE instance_code = ?1",
                params![instance_code],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((applicant, oids, names, purpose, status, created_ms, resolved_ms)) = row else {
            return Ok(None);
        };
        let corrupt = |e: serde_json::Error| StoreError::Corrupt(e.to_string());
        Ok(Some(ApprovalRecord {
            instance_code: instance_code.to_string(),
            applicant_user_id: applicant,
            oids: serde_json::from_str(&oids).map_err(corrupt)?,
            names: serde_json::from_str(&names).map_err(corrupt)?,
            purpose,
            status: serde_json::from_value(serde_json::Value::String(status)).map_err(corrupt)?,
            created_ms,
            resolved_ms,
        }))
    }

    fn resolve_approval(
        &mut self,
        instance_code: &str,
        status: ApprovalStatus,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE approvals SET status = ?1, resolved_at = ?2
             WHERE instance_code = ?3 AND status = ?4",
            params![
                status.as_str(),
                now_ms,
                instance_code,
                ApprovalStatus::Pending.as_str()
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        match self.approval(instance_code)? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("approval {instance_code}"))),
        }
    }

    fn mark_seen(&mut self, event_id: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "INSERT INTO seen_events (event_id, expires_at_ms) VALUES (?1, ?2)
             ON CONFLICT(event_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
             WHERE seen_events.expires_at_ms <= ?3",
            params![event_id, now_ms + ttl_ms, now_ms],
        )?;
        self.conn.execute(
            "DELETE FROM seen_events WHERE expires_at_ms <= ?1",
            params![now_ms],
        )?;
        Ok(changed == 1)
    }

    fn forget_seen(&mut self, event_id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM seen_events WHERE event_id = ?1", params![event_id])?;
        Ok(())
    }

    fn hit_rate(&mut self, key: &str, bucket: i64) -> Result<u64, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM rate_windows WHERE rate_key = ?1 AND bucket < ?2",
            params![key, bucket],
        )?;
        tx.execute(
            "INSERT INTO rate_windows (rate_key, bucket, count) VALUES (?1, ?2, 1)
             ON CONFLICT(rate_key, bucket) DO UPDATE SET count = count + 1",
            params![key, bucket],
        )?;
        let count: u64 = tx.query_row(
            "SELECT count FROM rate_windows WHERE rate_key = ?1 AND bucket = ?2",
            params![key, bucket],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }
}
