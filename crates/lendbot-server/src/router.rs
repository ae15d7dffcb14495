//! Card action handling.
//!
//! Every action is checked against the member's live card before anything
//! else. The re-rendered card is pushed through the deferred update API, so
//! the webhook answer carries only a toast.

use lendbot_contracts::{CardActionEvent, CardActionResponse, Toast};
use lendbot_kernel::action::FORM_BUTTON;
use lendbot_kernel::view::SEARCH_VIEW;
use lendbot_kernel::{decode_action, CardCommand, DecodedAction, GateDecision, ItemId, Selection, Useable};
use serde_json::Value;
use tracing::{info, warn};

use crate::approval::{join_ids, Reservation};
use crate::clock::Clock;
use crate::error::BotError;
use crate::store::{ItemUpdate, LogEntry, Member, SharedStore, Transition};
use crate::AppState;

pub struct CardActionRouter {
    app: AppState,
}

impl CardActionRouter {
    pub fn new(app: AppState) -> Self {
        Self { app }
    }

    pub async fn handle(
        &self,
        event_id: &str,
        event: CardActionEvent,
    ) -> Result<CardActionResponse, BotError> {
        let app = &self.app;
        let member = {
            let mut store = app.store.lock().await;
            store.ensure_member(&event.operator)?
        };
        app.cards
            .check_action(&member.user_id, &event.context.open_message_id)
            .await?;

        let DecodedAction { command, mut state } = decode_action(&event.action)
            .map_err(|e| BotError::InvalidSelection(format!("unreadable card action: {e}")))?;
        info!(user_id = %member.user_id, action = command.name(), view = state.view, "card action");

        let mut toast = None;
        let next = command.next_view();
        match &command {
            CardCommand::Noop => return Ok(CardActionResponse::default()),
            CardCommand::Back(_) if next.is_none() => {
                return Err(BotError::InvalidSelection("already at the top level".into()));
            }
            CardCommand::Search(text) => state.query = Some(text.trim().to_string()),
            CardCommand::Toggle { oid, name, checked } => {
                state.selection.set_checked(*oid, name, *checked)
            }
            CardCommand::Return(oid) => {
                return_item(
                    &app.store,
                    app.clock.as_ref(),
                    &app.cfg.inventory.warehouse_label,
                    &member,
                    *oid,
                )
                .await?;
                toast = Some(Toast::success(format!("Item {oid} returned")));
            }
            CardCommand::Submit { purpose } => {
                if let GateDecision::Deny { retry_after_ms } =
                    app.limiter.check(&member.user_id, FORM_BUTTON).await
                {
                    warn!(user_id = %member.user_id, retry_after_ms, "submit rate limited");
                    return Ok(CardActionResponse::default());
                }
                if state.selection.is_empty() {
                    return Err(BotError::InvalidSelection("no items selected".into()));
                }
                let unavailable = self.unavailable(&state.selection).await?;
                if unavailable.is_empty() {
                    let reservation = app.workflow.reserve(&member, &state.selection, purpose).await?;
                    state.selection.clear();
                    self.open_instance(reservation, event_id).await;
                    toast = Some(Toast::success("Request submitted for approval"));
                } else {
                    for oid in &unavailable {
                        state.selection.remove(*oid);
                    }
                    toast = Some(Toast::error(format!(
                        "No longer available, removed from selection: {}",
                        join_ids(&unavailable)
                    )));
                }
            }
            CardCommand::Home | CardCommand::SelfView | CardCommand::Inspect(_) | CardCommand::Back(_) => {}
        }

        if let Some(view) = next {
            if view != SEARCH_VIEW {
                state.query = None;
            }
            state.view = view;
        }
        let card = app.views.card(&state, &member.name).await?;
        self.push_update(event.token, card).await;
        Ok(CardActionResponse { toast })
    }

    async fn unavailable(&self, selection: &Selection) -> Result<Vec<ItemId>, BotError> {
        let store = self.app.store.lock().await;
        let mut out = Vec::new();
        for oid in selection.oids() {
            let available = store
                .inner()
                .item(oid)?
                .map(|item| item.useable == Useable::Available)
                .unwrap_or(false);
            if !available {
                out.push(oid);
            }
        }
        Ok(out)
    }

    /// Opens the approval instance off the response path. The applicant is
    /// told by text if it fails or is not recorded.
    async fn open_instance(&self, reservation: Reservation, event_id: &str) {
        let app = self.app.clone();
        let event_id = event_id.to_string();
        self.app
            .dispatcher
            .dispatch(async move {
                let text = match app.workflow.open_instance(&reservation, &event_id).await {
                    Ok(opened) if opened.recorded => return,
                    Ok(opened) => format!(
                        "Your request was submitted as {} but could not be recorded here. \
                         Its decision will still be applied, do not submit it again.",
                        opened.instance_code
                    ),
                    Err(e) => format!("Error: {e}. Your request was not submitted, please try again."),
                };
                if let Err(e) = app.messaging.send_text(&reservation.applicant, &text).await {
                    warn!(user_id = %reservation.applicant, error = %e, "submission notice not delivered");
                }
            })
            .await;
    }

    async fn push_update(&self, token: String, card: Value) {
        if token.is_empty() {
            warn!("card action without update token, card not refreshed");
            return;
        }
        let messaging = self.app.messaging.clone();
        self.app
            .dispatcher
            .dispatch(async move {
                if let Err(e) = messaging.update_card(&token, &card).await {
                    warn!(error = %e, "card update failed");
                }
            })
            .await;
    }
}

/// Puts an item back in the warehouse. Holders may return their own loans;
/// root members may return anything and may release a pending item.
pub(crate) async fn return_item(
    store: &SharedStore,
    clock: &dyn Clock,
    warehouse: &str,
    member: &Member,
    oid: ItemId,
) -> Result<(), BotError> {
    let mut guard = store.lock().await;
    let store = guard.inner_mut();
    let item = store
        .item(oid)?
        .ok_or_else(|| BotError::NotFound(format!("item {oid}")))?;
    if !member.root && item.wis != member.name {
        return Err(BotError::PermissionDenied(format!(
            "item {oid} is held by {}",
            item.wis
        )));
    }
    match item.useable {
        Useable::Scrapped => {
            return Err(BotError::Conflict(format!(
                "item {oid} is scrapped and cannot be returned"
            )))
        }
        Useable::Pending if !member.root => {
            return Err(BotError::Conflict(format!("item {oid} is awaiting approval")))
        }
        _ => {}
    }
    let mut allowed_from = vec![Useable::Loaned, Useable::Repair];
    if member.root {
        allowed_from.push(Useable::Pending);
    }
    let update = ItemUpdate {
        oid,
        allowed_from,
        to: Useable::Available,
        wis: Some(warehouse.to_string()),
        purpose: Some(String::new()),
        log: LogEntry {
            time_ms: clock.now_ms(),
            user_id: member.user_id.clone(),
            operation: "RETURN".to_string(),
            object: oid,
            note: item.wis.clone(),
        },
    };
    match store.set_item_state(&update)? {
        Transition::Applied => {
            info!(user_id = %member.user_id, oid, from = %item.wis, "item returned");
            Ok(())
        }
        Transition::Unchanged => Ok(()),
        Transition::Rejected { current } => {
            Err(BotError::Conflict(format!("item {oid} is {current}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{InventoryStore, MemoryStore, StoreBackend};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn log() -> LogEntry {
        LogEntry {
            time_ms: 0,
            user_id: "admin".into(),
            operation: "ADD".into(),
            object: 0,
            note: String::new(),
        }
    }

    fn member(name: &str, root: bool) -> Member {
        Member {
            user_id: name.to_lowercase(),
            name: name.into(),
            root,
            ..Member::default()
        }
    }

    /// 1001001 loaned to Ann, 1001002 pending, 1001003 scrapped.
    fn store() -> SharedStore {
        let mut s = MemoryStore::default();
        let c = s.add_category("tools").unwrap();
        let l = s.add_list(c.id, "drill").unwrap();
        s.add_items(l.id, 2, 0, "warehouse", &log()).unwrap();
        s.add_items(l.id, 1, 1, "warehouse", &log()).unwrap();
        for (oid, to, wis) in [
            (1_001_001, Useable::Loaned, "Ann"),
            (1_001_002, Useable::Pending, "warehouse"),
        ] {
            s.set_item_state(&ItemUpdate {
                oid,
                allowed_from: vec![Useable::Available],
                to,
                wis: Some(wis.into()),
                purpose: None,
                log: log(),
            })
            .unwrap();
        }
        Arc::new(Mutex::new(StoreBackend::Memory(s)))
    }

    async fn state_of(store: &SharedStore, oid: ItemId) -> Useable {
        store.lock().await.inner().item(oid).unwrap().unwrap().useable
    }

    #[tokio::test]
    async fn holder_returns_own_loan() {
        let store = store();
        let clock = ManualClock::new(5);
        return_item(&store, &clock, "warehouse", &member("Ann", false), 1_001_001)
            .await
            .unwrap();
        assert_eq!(state_of(&store, 1_001_001).await, Useable::Available);
    }

    #[tokio::test]
    async fn stranger_cannot_return() {
        let store = store();
        let clock = ManualClock::new(5);
        let err = return_item(&store, &clock, "warehouse", &member("Bob", false), 1_001_001)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::PermissionDenied(_)));
        assert_eq!(state_of(&store, 1_001_001).await, Useable::Loaned);
    }

    #[tokio::test]
    async fn scrapped_and_pending_items_are_refused() {
        let store = store();
        let clock = ManualClock::new(5);
        let root = member("Root", true);
        assert!(matches!(
            return_item(&store, &clock, "warehouse", &root, 1_001_003).await,
            Err(BotError::Conflict(_))
        ));
        let pending_holder = member("warehouse", false);
        assert!(matches!(
            return_item(&store, &clock, "warehouse", &pending_holder, 1_001_002).await,
            Err(BotError::Conflict(_))
        ));
        return_item(&store, &clock, "warehouse", &root, 1_001_002)
            .await
            .unwrap();
        assert_eq!(state_of(&store, 1_001_002).await, Useable::Available);
    }
}
