//! Asynchronous reconciliation of the local board to the external provider.
//!
//! Publishers drop [`CardMutation`]s on an unbounded work queue and never
//! block on remote I/O. A single worker applies them in order with
//! exponential backoff on failure; the local DB stays the source of truth,
//! and apply-time reads make the policy last-write-wins.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::db::KanbanDb;
use super::trello::KanbanProvider;
use crate::events::{DomainEvent, EventBus, EventPayload};

const MAX_ATTEMPTS: u32 = 5;

/// One pending provider-side change.
#[derive(Debug, Clone)]
pub enum CardMutation {
    Create {
        card_id: String,
        list_name: String,
        title: String,
        description: String,
    },
    Update {
        card_id: String,
        trello_card_id: Option<String>,
        title: String,
        labels: Vec<String>,
    },
    Move {
        card_id: String,
        trello_card_id: Option<String>,
        to_list: String,
    },
    Archive {
        trello_card_id: String,
    },
}

/// Handle for submitting card mutations; cheap to clone.
#[derive(Clone)]
pub struct TrelloSyncService {
    tx: mpsc::UnboundedSender<CardMutation>,
}

impl TrelloSyncService {
    /// Start the sync worker. `retry_base` is the first backoff delay;
    /// subsequent attempts double it.
    pub fn start(
        provider: Arc<dyn KanbanProvider>,
        db: Arc<Mutex<KanbanDb>>,
        bus: Arc<EventBus>,
        retry_base: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CardMutation>();
        tokio::spawn(async move {
            while let Some(mutation) = rx.recv().await {
                apply_with_retry(&*provider, &db, &bus, mutation, retry_base).await;
            }
        });
        Self { tx }
    }

    /// Queue a mutation. Never blocks; a closed worker only happens at
    /// shutdown, where dropping the mutation is fine.
    pub fn submit(&self, mutation: CardMutation) {
        if self.tx.send(mutation).is_err() {
            warn!("trello sync worker gone; mutation dropped");
        }
    }
}

async fn apply_with_retry(
    provider: &dyn KanbanProvider,
    db: &Arc<Mutex<KanbanDb>>,
    bus: &Arc<EventBus>,
    mutation: CardMutation,
    retry_base: Duration,
) {
    for attempt in 0..MAX_ATTEMPTS {
        match apply(provider, db, &mutation).await {
            Ok(Some(event)) => {
                bus.publish(DomainEvent::new("trello-sync", event)).await;
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(attempt, error = %e, "trello sync attempt failed");
                let backoff = retry_base * 2u32.pow(attempt);
                tokio::time::sleep(backoff).await;
            }
        }
    }
    error!(?mutation, "trello sync gave up after {MAX_ATTEMPTS} attempts");
}

/// Resolve the provider card id at apply time, so mutations queued before
/// the create finished pick the id up once it lands.
fn resolve_provider_id(
    db: &Arc<Mutex<KanbanDb>>,
    card_id: &str,
    queued: &Option<String>,
) -> anyhow::Result<String> {
    if let Some(id) = queued {
        return Ok(id.clone());
    }
    let db = db.lock().unwrap();
    db.get_card(card_id)?
        .and_then(|card| card.trello_card_id)
        .ok_or_else(|| anyhow::anyhow!("card {card_id} not yet synced to provider"))
}

async fn apply(
    provider: &dyn KanbanProvider,
    db: &Arc<Mutex<KanbanDb>>,
    mutation: &CardMutation,
) -> anyhow::Result<Option<EventPayload>> {
    match mutation {
        CardMutation::Create {
            card_id,
            list_name,
            title,
            description,
        } => {
            let trello_card_id = provider.create_card(list_name, title, description).await?;
            let issue_number = {
                let db = db.lock().unwrap();
                db.set_trello_card_id(card_id, &trello_card_id)?;
                db.get_card(card_id)?.and_then(|c| c.issue_number)
            };
            info!(card_id, trello_card_id, "card created on provider");
            Ok(Some(EventPayload::TrelloCardCreated {
                card_id: card_id.clone(),
                trello_card_id,
                issue_number,
            }))
        }
        CardMutation::Update {
            card_id,
            trello_card_id,
            title,
            labels,
        } => {
            let provider_id = resolve_provider_id(db, card_id, trello_card_id)?;
            provider.update_card(&provider_id, title, labels).await?;
            Ok(Some(EventPayload::TrelloCardUpdated {
                card_id: card_id.clone(),
                trello_card_id: provider_id,
            }))
        }
        CardMutation::Move {
            card_id,
            trello_card_id,
            to_list,
        } => {
            let provider_id = resolve_provider_id(db, card_id, trello_card_id)?;
            let from_list = {
                let db = db.lock().unwrap();
                db.get_card(card_id)?.map(|c| c.list_id).unwrap_or_default()
            };
            provider.move_card(&provider_id, to_list).await?;
            Ok(Some(EventPayload::TrelloCardMoved {
                card_id: card_id.clone(),
                from_list,
                to_list: to_list.clone(),
            }))
        }
        CardMutation::Archive { trello_card_id } => {
            provider.archive_card(trello_card_id).await?;
            Ok(Some(EventPayload::TrelloCardArchived {
                card_id: trello_card_id.clone(),
            }))
        }
    }
}
