//! Slash commands sent to the bot as text messages.

use std::collections::BTreeMap;

use lendbot_contracts::{Mention, Message};
use lendbot_kernel::codec::parse_item_id;
use lendbot_kernel::ids::MAX_ID;
use lendbot_kernel::view::SEARCH_VIEW;
use lendbot_kernel::{CardState, ItemId};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::error::BotError;
use crate::router::return_item;
use crate::store::{LogEntry, Member};
use crate::AppState;

const HELP: &str = "\
/help - show this help
/search <id or name> - open a card with matching items
/return <item id> - return an item you hold
/add category name=<category>
/add list name=<type> category_name=<category>
/add item name=<type> num=<n> [num_broken=<k>] [category_name=<category>]
/del item oid=<item id>
/del list name=<type> | id=<type id>
/del category name=<category> | id=<category id>
/op @user, /deop @user, /lsop
add, del, op, deop and lsop need administrator rights.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("bad argument {0}")]
    BadArg(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Category,
    List,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Search(String),
    Return(ItemId),
    Add {
        tier: Tier,
        args: BTreeMap<String, String>,
    },
    Del {
        tier: Tier,
        args: BTreeMap<String, String>,
    },
    Op,
    Deop,
    Lsop,
}

impl Command {
    pub fn admin_only(&self) -> bool {
        matches!(
            self,
            Command::Add { .. } | Command::Del { .. } | Command::Op | Command::Deop | Command::Lsop
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::Search(_) => "search",
            Command::Return(_) => "return",
            Command::Add { .. } => "add",
            Command::Del { .. } => "del",
            Command::Op => "op",
            Command::Deop => "deop",
            Command::Lsop => "lsop",
        }
    }
}

/// `Ok(None)` for text that is not a command.
pub fn parse_command(text: &str) -> Result<Option<Command>, CommandError> {
    let text = text.trim();
    let Some(body) = text.strip_prefix('/') else {
        return Ok(None);
    };
    let mut words = body.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    let command = match verb {
        "help" => Command::Help,
        "search" if !rest.is_empty() => Command::Search(rest.join(" ")),
        "search" => return Err(CommandError::Usage("/search <id or name>")),
        "return" => match rest.as_slice() {
            [oid] => Command::Return(
                parse_item_id(oid).map_err(|_| CommandError::BadArg(format!("item id {oid:?}")))?,
            ),
            _ => return Err(CommandError::Usage("/return <item id>")),
        },
        "add" | "del" => {
            let (tier, args) = match rest.split_first() {
                Some((tier, args)) => (parse_tier(tier)?, parse_args(args)?),
                None => return Err(CommandError::Usage("/add|/del item|list|category key=value...")),
            };
            if verb == "add" {
                Command::Add { tier, args }
            } else {
                Command::Del { tier, args }
            }
        }
        "op" => Command::Op,
        "deop" => Command::Deop,
        "lsop" => Command::Lsop,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_tier(raw: &str) -> Result<Tier, CommandError> {
    match raw {
        "item" => Ok(Tier::Item),
        "list" => Ok(Tier::List),
        "category" => Ok(Tier::Category),
        other => Err(CommandError::BadArg(format!("type {other:?}, expected item, list or category"))),
    }
}

fn parse_args(words: &[&str]) -> Result<BTreeMap<String, String>, CommandError> {
    words
        .iter()
        .map(|w| match w.split_once('=') {
            Some((k, v)) if !k.is_empty() && !v.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(CommandError::BadArg(format!("{w:?}, expected key=value"))),
        })
        .collect()
}

fn arg<'a>(args: &'a BTreeMap<String, String>, key: &'static str) -> Result<&'a str, CommandError> {
    args.get(key)
        .map(String::as_str)
        .ok_or_else(|| CommandError::BadArg(format!("missing {key}=")))
}

fn num_arg(args: &BTreeMap<String, String>, key: &str, default: u64) -> Result<u64, CommandError> {
    match args.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .ok()
            .filter(|v| *v <= MAX_ID)
            .ok_or_else(|| CommandError::BadArg(format!("{key}={raw}"))),
    }
}

/// Text of a `text` message, or `None` for other message types.
fn message_text(message: &Message) -> Option<String> {
    if message.message_type != "text" {
        return None;
    }
    let content: Value = serde_json::from_str(&message.content).unwrap_or(Value::Null);
    Some(
        content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

/// Runs one message. Returns the reply text, or `None` when nothing should
/// be sent back.
pub async fn run_message(app: &AppState, member: &Member, message: &Message) -> Option<String> {
    let Some(text) = message_text(message) else {
        return Some(format!(
            "Unsupported message type {:?}. Send /help for the command list.",
            message.message_type
        ));
    };
    let command = match parse_command(&text) {
        Ok(Some(command)) => command,
        Ok(None) => return None,
        Err(e) => return Some(format!("Error: {e}. Send /help for the command list.")),
    };
    if command.admin_only() && !member.root {
        let err = BotError::PermissionDenied(format!("/{} needs administrator rights", command.name()));
        return Some(format!("Error: {err}"));
    }
    info!(user_id = %member.user_id, command = command.name(), "command");
    match execute(app, member, &message.mentions, command).await {
        Ok(reply) => reply,
        Err(e) => Some(format!("Error: {e}")),
    }
}

async fn execute(
    app: &AppState,
    member: &Member,
    mentions: &[Mention],
    command: Command,
) -> Result<Option<String>, BotError> {
    let bad = |e: CommandError| BotError::InvalidSelection(e.to_string());
    match command {
        Command::Help => Ok(Some(HELP.to_string())),
        Command::Search(target) => {
            let state = CardState {
                query: Some(target),
                ..CardState::at(SEARCH_VIEW)
            };
            let card = app.views.card(&state, &member.name).await?;
            app.cards.issue_new_card(&member.user_id, &card).await?;
            Ok(None)
        }
        Command::Return(oid) => {
            return_item(
                &app.store,
                app.clock.as_ref(),
                &app.cfg.inventory.warehouse_label,
                member,
                oid,
            )
            .await?;
            Ok(Some(format!("Item {oid} returned")))
        }
        Command::Add { tier, args } => add(app, member, tier, &args).await.map(Some),
        Command::Del { tier, args } => {
            let log = log_entry(app, member, "DELETE");
            let mut guard = app.store.lock().await;
            let store = guard.inner_mut();
            let reply = match tier {
                Tier::Item => {
                    let raw = arg(&args, "oid").map_err(bad)?;
                    let oid = parse_item_id(raw)
                        .map_err(|_| bad(CommandError::BadArg(format!("oid={raw}"))))?;
                    store.delete_item(oid, &LogEntry { object: oid, ..log })?;
                    format!("Deleted item {oid}")
                }
                Tier::List => {
                    let id = match args.get("name") {
                        Some(name) => store
                            .list_by_name(name)?
                            .ok_or_else(|| BotError::NotFound(format!("item type {name:?}")))?
                            .id,
                        None => num_arg(&args, "id", 0).map_err(bad)?,
                    };
                    store.delete_list(id)?;
                    format!("Deleted item type {id}")
                }
                Tier::Category => {
                    let id = match args.get("name") {
                        Some(name) => store
                            .category_by_name(name)?
                            .ok_or_else(|| BotError::NotFound(format!("category {name:?}")))?
                            .id,
                        None => num_arg(&args, "id", 0).map_err(bad)?,
                    };
                    store.delete_category(id)?;
                    format!("Deleted category {id}")
                }
            };
            info!(user_id = %member.user_id, %reply, "inventory changed");
            Ok(Some(reply))
        }
        Command::Op => set_root(app, member, mentions, true).await.map(Some),
        Command::Deop => set_root(app, member, mentions, false).await.map(Some),
        Command::Lsop => {
            let roots = app.store.lock().await.inner().roots()?;
            let names: Vec<String> = roots.into_iter().map(|m| m.name).collect();
            Ok(Some(format!("Administrators: {}", names.join(", "))))
        }
    }
}

async fn add(
    app: &AppState,
    member: &Member,
    tier: Tier,
    args: &BTreeMap<String, String>,
) -> Result<String, BotError> {
    let bad = |e: CommandError| BotError::InvalidSelection(e.to_string());
    let log = log_entry(app, member, "ADD");
    let mut guard = app.store.lock().await;
    let store = guard.inner_mut();
    let name = arg(args, "name").map_err(bad)?;
    let reply = match tier {
        Tier::Category => {
            let category = store.add_category(name)?;
            format!("Added category {} ({})", category.name, category.id)
        }
        Tier::List | Tier::Item => {
            let list = match store.list_by_name(name)? {
                Some(list) if tier == Tier::Item => list,
                Some(_) => return Err(BotError::Conflict(format!("item type {name:?} exists"))),
                None => {
                    let category_name = arg(args, "category_name").map_err(|_| {
                        BotError::NotFound(format!("item type {name:?}, pass category_name= to create it"))
                    })?;
                    let category = match store.category_by_name(category_name)? {
                        Some(category) => category,
                        None => store.add_category(category_name)?,
                    };
                    store.add_list(category.id, name)?
                }
            };
            if tier == Tier::List {
                format!("Added item type {} ({})", list.name, list.id)
            } else {
                let num = num_arg(args, "num", 1).map_err(bad)?;
                let num_broken = num_arg(args, "num_broken", 0).map_err(bad)?;
                if num == 0 || num_broken > num {
                    return Err(bad(CommandError::BadArg(format!(
                        "num={num} num_broken={num_broken}"
                    ))));
                }
                let created = store.add_items(
                    list.id,
                    num,
                    num_broken,
                    &app.cfg.inventory.warehouse_label,
                    &log,
                )?;
                format!(
                    "Added {} x {}: {}",
                    created.len(),
                    list.name,
                    created
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        }
    };
    info!(user_id = %member.user_id, %reply, "inventory changed");
    Ok(reply)
}

async fn set_root(
    app: &AppState,
    member: &Member,
    mentions: &[Mention],
    grant: bool,
) -> Result<String, BotError> {
    let targets: Vec<&Mention> = mentions.iter().filter(|m| !m.id.user_id.is_empty()).collect();
    if targets.is_empty() {
        return Err(BotError::InvalidSelection(
            CommandError::Usage("/op @user or /deop @user").to_string(),
        ));
    }
    let mut guard = app.store.lock().await;
    let mut names = Vec::new();
    for mention in targets {
        let mut target = guard.ensure_member(&mention.id)?;
        if !mention.name.is_empty() {
            target.name = mention.name.clone();
        }
        target.root = grant;
        guard.inner_mut().upsert_member(&target)?;
        names.push(target.name);
    }
    info!(user_id = %member.user_id, grant, targets = ?names, "admin rights changed");
    Ok(format!(
        "{} administrator rights: {}",
        if grant { "Granted" } else { "Revoked" },
        names.join(", ")
    ))
}

fn log_entry(app: &AppState, member: &Member, operation: &str) -> LogEntry {
    LogEntry {
        time_ms: app.clock.now_ms(),
        user_id: member.user_id.clone(),
        operation: operation.to_string(),
        object: 0,
        note: String::new(),
    }
}
