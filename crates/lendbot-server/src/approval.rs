//! Two-phase lending requests.
//!
//! `reserve` marks the selected items PENDING in one all-or-nothing write.
//! `open_instance` then asks the approval system for an instance. The
//! decision arrives later as a callback and is applied by `resolve`.

use std::sync::Arc;

use lendbot_contracts::{ApprovalInstanceEvent, ApprovalStatus};
use lendbot_kernel::approval::{approval_form, parse_form, resolution, submission_key, timeline_parties};
use lendbot_kernel::{ItemId, Selection, Useable};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::BotError;
use crate::gateway::{ApprovalGateway, CreateInstance, MessagingGateway};
use crate::store::{ApprovalRecord, BatchOutcome, ItemUpdate, LogEntry, Member, SharedStore, Transition};

/// Items held PENDING for one applicant, not yet backed by an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub applicant: String,
    pub selection: Selection,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Foreign approval definition or non-terminal status.
    Ignored,
    AlreadyResolved,
    Applied {
        status: ApprovalStatus,
        changed: Vec<ItemId>,
        refused: Vec<ItemId>,
    },
}

/// An approval instance that exists upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedInstance {
    pub instance_code: String,
    /// False when the local record could not be written. The decision
    /// callback still settles the items from the instance form.
    pub recorded: bool,
}

pub struct ApprovalWorkflow {
    store: SharedStore,
    approvals: Arc<dyn ApprovalGateway>,
    messaging: Arc<dyn MessagingGateway>,
    clock: Arc<dyn Clock>,
    approval_code: String,
    warehouse: String,
}

impl ApprovalWorkflow {
    pub fn new(
        store: SharedStore,
        approvals: Arc<dyn ApprovalGateway>,
        messaging: Arc<dyn MessagingGateway>,
        clock: Arc<dyn Clock>,
        approval_code: String,
        warehouse: String,
    ) -> Self {
        Self {
            store,
            approvals,
            messaging,
            clock,
            approval_code,
            warehouse,
        }
    }

    /// Subscribes to decision callbacks for the configured approval.
    pub async fn subscribe(&self) {
        if let Err(e) = self.approvals.subscribe(&self.approval_code).await {
            warn!(approval_code = %self.approval_code, error = %e, "approval subscription failed");
        }
    }

    /// Marks every selected item PENDING or none of them. Returns the ids
    /// that were not AVAILABLE as `InvalidSelection`.
    pub async fn reserve(
        &self,
        applicant: &Member,
        selection: &Selection,
        purpose: &str,
    ) -> Result<Reservation, BotError> {
        if selection.is_empty() {
            return Err(BotError::InvalidSelection("no items selected".into()));
        }
        let now_ms = self.clock.now_ms();
        let updates: Vec<ItemUpdate> = selection
            .items()
            .iter()
            .map(|item| ItemUpdate {
                oid: item.oid,
                allowed_from: vec![Useable::Available],
                to: Useable::Pending,
                wis: None,
                purpose: Some(purpose.to_string()),
                log: LogEntry {
                    time_ms: now_ms,
                    user_id: applicant.user_id.clone(),
                    operation: "APPLY".to_string(),
                    object: item.oid,
                    note: purpose.to_string(),
                },
            })
            .collect();
        let outcome = {
            let mut store = self.store.lock().await;
            store.inner_mut().set_items_state(&updates)?
        };
        match outcome {
            BatchOutcome::Applied => {
                info!(user_id = %applicant.user_id, items = ?selection.oids(), "items reserved");
                Ok(Reservation {
                    applicant: applicant.user_id.clone(),
                    selection: selection.clone(),
                    purpose: purpose.to_string(),
                })
            }
            BatchOutcome::Rejected(ids) => Err(BotError::InvalidSelection(format!(
                "items no longer available: {}",
                join_ids(&ids)
            ))),
        }
    }

    /// Opens the approval instance for a reservation. A definitive refusal
    /// releases the items; a transport failure leaves them PENDING, since
    /// the instance may exist and its decision callback will settle them.
    pub async fn open_instance(
        &self,
        reservation: &Reservation,
        event_id: &str,
    ) -> Result<OpenedInstance, BotError> {
        let oids = reservation.selection.oids();
        let request = CreateInstance {
            approval_code: self.approval_code.clone(),
            user_id: reservation.applicant.clone(),
            form: approval_form(&reservation.purpose, &reservation.selection, self.clock.now()),
            uuid: submission_key(&reservation.applicant, event_id, &oids),
        };
        match self.approvals.create_instance(&request).await {
            Ok(instance_code) => {
                let record = ApprovalRecord {
                    instance_code: instance_code.clone(),
                    applicant_user_id: reservation.applicant.clone(),
                    oids: oids.clone(),
                    names: reservation
                        .selection
                        .items()
                        .iter()
                        .map(|i| i.name.clone())
                        .collect(),
                    purpose: reservation.purpose.clone(),
                    status: ApprovalStatus::Pending,
                    created_ms: self.clock.now_ms(),
                    resolved_ms: None,
                };
                let saved = {
                    let mut store = self.store.lock().await;
                    store.inner_mut().save_approval(&record)
                };
                let recorded = match saved {
                    Ok(()) => {
                        info!(user_id = %reservation.applicant, %instance_code, items = ?oids, "approval instance opened");
                        true
                    }
                    Err(e) => {
                        error!(
                            user_id = %reservation.applicant,
                            %instance_code,
                            items = ?oids,
                            error = %e,
                            "approval instance opened but not recorded"
                        );
                        false
                    }
                };
                Ok(OpenedInstance {
                    instance_code,
                    recorded,
                })
            }
            Err(e) if e.is_definitive() => {
                warn!(user_id = %reservation.applicant, error = %e, "approval refused, releasing items");
                self.release(reservation).await?;
                Err(e.into())
            }
            Err(e) => {
                error!(
                    user_id = %reservation.applicant,
                    items = ?oids,
                    error = %e,
                    "approval instance creation failed, items left PENDING"
                );
                Err(e.into())
            }
        }
    }

    async fn release(&self, reservation: &Reservation) -> Result<(), BotError> {
        let now_ms = self.clock.now_ms();
        let updates: Vec<ItemUpdate> = reservation
            .selection
            .oids()
            .into_iter()
            .map(|oid| ItemUpdate {
                oid,
                allowed_from: vec![Useable::Pending],
                to: Useable::Available,
                wis: None,
                purpose: Some(String::new()),
                log: LogEntry {
                    time_ms: now_ms,
                    user_id: reservation.applicant.clone(),
                    operation: "APPLY_ROLLBACK".to_string(),
                    object: oid,
                    note: String::new(),
                },
            })
            .collect();
        let mut store = self.store.lock().await;
        if let BatchOutcome::Rejected(ids) = store.inner_mut().set_items_state(&updates)? {
            warn!(items = ?ids, "reserved items changed before release");
        }
        Ok(())
    }

    /// Applies a decision callback. Safe to call repeatedly for the same
    /// instance: the record moves out of PENDING once, and an instance with
    /// no record gets a resolved one on its first decision.
    pub async fn resolve(&self, event: &ApprovalInstanceEvent) -> Result<Resolution, BotError> {
        if event.approval_code != self.approval_code || !event.status.is_terminal() {
            debug!(approval_code = %event.approval_code, status = event.status.as_str(), "approval callback ignored");
            return Ok(Resolution::Ignored);
        }
        let detail = self.approvals.fetch_instance(&event.instance_code).await?;
        let (applicant, operator) = timeline_parties(&detail);
        let applicant = applicant
            .ok_or_else(|| BotError::BadRequest("approval instance has no applicant".into()))?;
        let operator = operator.unwrap_or_default();
        let form = parse_form(&detail.form)?;
        let now_ms = self.clock.now_ms();

        let (applied, applicant_name) = {
            let mut store = self.store.lock().await;
            let store = store.inner_mut();
            let first = match store.approval(&event.instance_code)? {
                Some(_) => store.resolve_approval(&event.instance_code, event.status, now_ms)?,
                None => {
                    // No record survived instance creation. Settle it from the
                    // form so a redelivered decision finds it resolved.
                    warn!(instance_code = %event.instance_code, "decision for unrecorded instance");
                    store.save_approval(&ApprovalRecord {
                        instance_code: event.instance_code.clone(),
                        applicant_user_id: applicant.clone(),
                        oids: form.selection.oids(),
                        names: form.selection.items().iter().map(|i| i.name.clone()).collect(),
                        purpose: form.purpose.clone(),
                        status: event.status,
                        created_ms: now_ms,
                        resolved_ms: Some(now_ms),
                    })?;
                    true
                }
            };
            let applicant_name = store
                .member(&applicant)?
                .map(|m| m.name)
                .unwrap_or_else(|| applicant.clone());
            if !first {
                (None, applicant_name)
            } else {
                let (to, wis) = resolution(event.status, &applicant_name, &self.warehouse)
                    .ok_or_else(|| BotError::BadRequest("non-terminal approval status".into()))?;
                let mut changed = Vec::new();
                let mut refused = Vec::new();
                for oid in form.selection.oids() {
                    let update = ItemUpdate {
                        oid,
                        allowed_from: vec![Useable::Pending],
                        to,
                        wis: Some(wis.clone()),
                        purpose: None,
                        log: LogEntry {
                            time_ms: now_ms,
                            user_id: operator.clone(),
                            operation: event.status.as_str().to_string(),
                            object: oid,
                            note: applicant.clone(),
                        },
                    };
                    match store.set_item_state(&update) {
                        Ok(Transition::Applied) => changed.push(oid),
                        Ok(Transition::Unchanged) => {}
                        Ok(Transition::Rejected { current }) => {
                            warn!(oid, current = %current, "item not pending at decision time");
                            refused.push(oid);
                        }
                        Err(e) => {
                            warn!(oid, error = %e, "could not apply decision to item");
                            refused.push(oid);
                        }
                    }
                }
                (Some((changed, refused)), applicant_name)
            }
        };

        let Some((changed, refused)) = applied else {
            info!(instance_code = %event.instance_code, "approval already resolved");
            return Ok(Resolution::AlreadyResolved);
        };
        info!(
            instance_code = %event.instance_code,
            status = event.status.as_str(),
            applicant = %applicant_name,
            operator = %operator,
            changed = ?changed,
            "approval resolved"
        );
        if !changed.is_empty() {
            let names: Vec<&str> = form.selection.items().iter().map(|i| i.name.as_str()).collect();
            let text = format!(
                "Your request for {} ({}) was {}.",
                names.join(", "),
                join_ids(&changed),
                event.status.as_str().to_lowercase()
            );
            if let Err(e) = self.messaging.send_text(&applicant, &text).await {
                warn!(user_id = %applicant, error = %e, "decision notice not delivered");
            }
        }
        Ok(Resolution::Applied {
            status: event.status,
            changed,
            refused,
        })
    }
}

pub(crate) fn join_ids(ids: &[ItemId]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fakes::{RecordingMessenger, ScriptedApprovals};
    use crate::gateway::GatewayError;
    use crate::store::{InventoryStore, MemoryStore, SqliteStore, StoreBackend};
    use tokio::sync::Mutex;

    struct Rig {
        workflow: ApprovalWorkflow,
        store: SharedStore,
        approvals: Arc<ScriptedApprovals>,
        messenger: Arc<RecordingMessenger>,
    }

    fn rig() -> Rig {
        let mut backend = MemoryStore::default();
        let tools = backend.add_category("tools").unwrap();
        let list = backend.add_list(tools.id, "screwdriver").unwrap();
        let log = LogEntry {
            time_ms: 0,
            user_id: "admin".into(),
            operation: "ADD".into(),
            object: 0,
            note: String::new(),
        };
        backend.add_items(list.id, 2, 0, "warehouse", &log).unwrap();
        backend
            .upsert_member(&Member {
                user_id: "u1".into(),
                name: "Ann".into(),
                ..Member::default()
            })
            .unwrap();
        let store: SharedStore = Arc::new(Mutex::new(StoreBackend::Memory(backend)));
        let approvals = Arc::new(ScriptedApprovals::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            approvals.clone(),
            messenger.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            "APPROVAL-1".into(),
            "warehouse".into(),
        );
        Rig {
            workflow,
            store,
            approvals,
            messenger,
        }
    }

    fn member() -> Member {
        Member {
            user_id: "u1".into(),
            name: "Ann".into(),
            ..Member::default()
        }
    }

    fn selection(oids: &[ItemId]) -> Selection {
        let mut s = Selection::new();
        for oid in oids {
            s.set_checked(*oid, "screwdriver", true);
        }
        s
    }

    async fn useable(store: &SharedStore, oid: ItemId) -> (Useable, String) {
        let store = store.lock().await;
        let item = store.inner().item(oid).unwrap().unwrap();
        (item.useable, item.wis)
    }

    fn decision(status: ApprovalStatus, instance_code: &str) -> ApprovalInstanceEvent {
        ApprovalInstanceEvent {
            approval_code: "APPROVAL-1".into(),
            instance_code: instance_code.into(),
            status,
        }
    }

    #[tokio::test]
    async fn approved_request_loans_items_once() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001]), "lab")
            .await
            .unwrap();
        assert_eq!(useable(&rig.store, 1_001_001).await.0, Useable::Pending);
        let code = rig
            .workflow
            .open_instance(&reservation, "ev1")
            .await
            .unwrap()
            .instance_code;
        rig.approvals.decide(&code, "admin").await;

        let first = rig
            .workflow
            .resolve(&decision(ApprovalStatus::Approved, &code))
            .await
            .unwrap();
        assert!(matches!(first, Resolution::Applied { ref changed, .. } if changed == &vec![1_001_001]));
        assert_eq!(
            useable(&rig.store, 1_001_001).await,
            (Useable::Loaned, "Ann".to_string())
        );

        let again = rig
            .workflow
            .resolve(&decision(ApprovalStatus::Approved, &code))
            .await
            .unwrap();
        assert_eq!(again, Resolution::AlreadyResolved);
        assert_eq!(rig.messenger.texts_to("u1").await.len(), 1);
        let logs = rig.store.lock().await.inner().logs_for(1_001_001).unwrap();
        assert_eq!(
            logs.iter().map(|l| l.operation.as_str()).collect::<Vec<_>>(),
            vec!["ADD", "APPLY", "APPROVED"]
        );
        assert_eq!(logs[2].user_id, "admin");
    }

    #[tokio::test]
    async fn rejected_request_returns_items_to_warehouse() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001, 1_001_002]), "")
            .await
            .unwrap();
        let code = rig
            .workflow
            .open_instance(&reservation, "ev1")
            .await
            .unwrap()
            .instance_code;
        rig.workflow
            .resolve(&decision(ApprovalStatus::Rejected, &code))
            .await
            .unwrap();
        for oid in [1_001_001, 1_001_002] {
            assert_eq!(
                useable(&rig.store, oid).await,
                (Useable::Available, "warehouse".to_string())
            );
        }
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing() {
        let rig = rig();
        rig.workflow
            .reserve(&member(), &selection(&[1_001_001]), "")
            .await
            .unwrap();
        let err = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001, 1_001_002]), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::InvalidSelection(ref m) if m.contains("1001001")));
        assert_eq!(useable(&rig.store, 1_001_002).await.0, Useable::Available);
        assert!(matches!(
            rig.workflow.reserve(&member(), &Selection::new(), "").await,
            Err(BotError::InvalidSelection(_))
        ));
    }

    #[tokio::test]
    async fn definitive_refusal_releases_reservation() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001]), "")
            .await
            .unwrap();
        rig.approvals
            .fail_next_create(GatewayError::Rejected {
                code: 1_390_002,
                msg: "bad form".into(),
            })
            .await;
        let err = rig.workflow.open_instance(&reservation, "ev1").await.unwrap_err();
        assert!(matches!(err, BotError::UpstreamFailure(_)));
        assert_eq!(useable(&rig.store, 1_001_001).await.0, Useable::Available);
    }

    #[tokio::test]
    async fn transport_failure_keeps_items_pending() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001]), "")
            .await
            .unwrap();
        rig.approvals
            .fail_next_create(GatewayError::Transport("timeout".into()))
            .await;
        let err = rig.workflow.open_instance(&reservation, "ev1").await.unwrap_err();
        assert!(matches!(err, BotError::UpstreamFailure(_)));
        assert_eq!(useable(&rig.store, 1_001_001).await.0, Useable::Pending);
    }

    #[tokio::test]
    async fn decision_without_local_record_uses_the_form() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_002]), "")
            .await
            .unwrap();
        // Instance created upstream but the local record was lost.
        let code = rig
            .approvals
            .create_instance(&CreateInstance {
                approval_code: "APPROVAL-1".into(),
                user_id: "u1".into(),
                form: approval_form("", &reservation.selection, chrono::Utc::now()),
                uuid: "lost".into(),
            })
            .await
            .unwrap();
        rig.workflow
            .resolve(&decision(ApprovalStatus::Canceled, &code))
            .await
            .unwrap();
        assert_eq!(useable(&rig.store, 1_001_002).await.0, Useable::Available);
        let record = rig.store.lock().await.inner().approval(&code).unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Canceled);
        assert_eq!(record.oids, vec![1_001_002]);

        // Someone else reserves the released item before the decision is
        // delivered again.
        let other = Member {
            user_id: "u2".into(),
            name: "Bob".into(),
            ..Member::default()
        };
        rig.workflow
            .reserve(&other, &selection(&[1_001_002]), "")
            .await
            .unwrap();
        let again = rig
            .workflow
            .resolve(&decision(ApprovalStatus::Canceled, &code))
            .await
            .unwrap();
        assert_eq!(again, Resolution::AlreadyResolved);
        assert_eq!(
            useable(&rig.store, 1_001_002).await,
            (Useable::Pending, "warehouse".to_string())
        );
    }

    #[tokio::test]
    async fn repeated_approval_of_unrecorded_instance_lends_once() {
        let rig = rig();
        let reservation = rig
            .workflow
            .reserve(&member(), &selection(&[1_001_001]), "")
            .await
            .unwrap();
        let code = rig
            .approvals
            .create_instance(&CreateInstance {
                approval_code: "APPROVAL-1".into(),
                user_id: "u1".into(),
                form: approval_form("", &reservation.selection, chrono::Utc::now()),
                uuid: "lost".into(),
            })
            .await
            .unwrap();
        let first = rig
            .workflow
            .resolve(&decision(ApprovalStatus::Approved, &code))
            .await
            .unwrap();
        assert!(matches!(first, Resolution::Applied { ref changed, .. } if changed == &vec![1_001_001]));
        let again = rig
            .workflow
            .resolve(&decision(ApprovalStatus::Approved, &code))
            .await
            .unwrap();
        assert_eq!(again, Resolution::AlreadyResolved);
        assert_eq!(rig.messenger.texts_to("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn unrecorded_instance_is_still_settled_by_its_decision() {
        let path = std::env::temp_dir()
            .join(format!("lendbot-approval-{}.db", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string();
        let mut backend = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        {
            let store = backend.inner_mut();
            let tools = store.add_category("tools").unwrap();
            let list = store.add_list(tools.id, "screwdriver").unwrap();
            let log = LogEntry {
                time_ms: 0,
                user_id: "admin".into(),
                operation: "ADD".into(),
                object: 0,
                note: String::new(),
            };
            store.add_items(list.id, 1, 0, "warehouse", &log).unwrap();
            store.upsert_member(&member()).unwrap();
        }
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE approvals;")
            .unwrap();
        let store: SharedStore = Arc::new(Mutex::new(backend));
        let approvals = Arc::new(ScriptedApprovals::default());
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            approvals.clone(),
            Arc::new(RecordingMessenger::default()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            "APPROVAL-1".into(),
            "warehouse".into(),
        );

        let reservation = workflow
            .reserve(&member(), &selection(&[1_001_001]), "")
            .await
            .unwrap();
        let opened = workflow.open_instance(&reservation, "ev1").await.unwrap();
        assert!(!opened.recorded);
        assert_eq!(approvals.created().await.len(), 1);
        assert_eq!(useable(&store, 1_001_001).await.0, Useable::Pending);
    }

    #[tokio::test]
    async fn foreign_approval_code_is_ignored() {
        let rig = rig();
        let event = ApprovalInstanceEvent {
            approval_code: "OTHER".into(),
            instance_code: "x".into(),
            status: ApprovalStatus::Approved,
        };
        assert_eq!(rig.workflow.resolve(&event).await.unwrap(), Resolution::Ignored);
    }
}
