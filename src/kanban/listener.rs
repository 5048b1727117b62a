//! Kanban reactions to domain events.
//!
//! Keeps the local board mirroring the job lifecycle: a started job makes
//! its issue card "live" in the list mapped from the agent type; terminal
//! job events clear the live state; issue events keep cards and labels in
//! sync. Board writes also feed the Trello sync queue when one is attached.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::db::{KanbanDb, new_issue_card};
use super::sync::{CardMutation, TrelloSyncService};
use super::{DEFAULT_LIST, list_for_agent_type};
use crate::events::{DomainEvent, EventBus, EventKind, EventPayload};

pub struct KanbanJobEventHandler {
    db: Arc<Mutex<KanbanDb>>,
    board_name: String,
    sync: Option<TrelloSyncService>,
}

impl KanbanJobEventHandler {
    pub fn new(db: Arc<Mutex<KanbanDb>>, board_name: impl Into<String>) -> Self {
        Self {
            db,
            board_name: board_name.into(),
            sync: None,
        }
    }

    pub fn with_sync(mut self, sync: TrelloSyncService) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Subscribe to the job and issue events this projection reacts to.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let kinds = [
            EventKind::IssueReceived,
            EventKind::IssueLabelled,
            EventKind::JobStarted,
            EventKind::JobProgress,
            EventKind::JobCompleted,
            EventKind::JobFailed,
        ];
        for kind in kinds {
            let handler = Arc::clone(self);
            bus.subscribe_fn(kind, move |event| {
                if let Err(e) = handler.handle(&event) {
                    error!(event_type = event.event_type(), error = %e, "kanban handler failed");
                }
            });
        }
    }

    fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        match &event.payload {
            EventPayload::IssueReceived {
                issue_number,
                title,
                labels,
                ..
            } => self.on_issue_received(*issue_number, title, labels),
            EventPayload::IssueLabelled {
                issue_number,
                label,
                action,
                ..
            } => self.on_issue_labelled(*issue_number, label, action),
            EventPayload::JobStarted {
                job_id,
                issue_number: Some(issue_number),
                agent_type,
                ..
            } => self.on_job_started(job_id, *issue_number, agent_type, event.timestamp),
            EventPayload::JobProgress {
                issue_number: Some(issue_number),
                step,
                total_steps,
                ..
            } => self.on_job_progress(*issue_number, *step, *total_steps),
            EventPayload::JobCompleted {
                issue_number: Some(issue_number),
                ..
            } => self.on_job_finished(*issue_number, "processing_completed"),
            EventPayload::JobFailed {
                issue_number: Some(issue_number),
                ..
            } => self.on_job_finished(*issue_number, "processing_failed"),
            _ => Ok(()),
        }
    }

    /// Ensure a card exists for the issue in the default list.
    fn on_issue_received(
        &self,
        issue_number: i64,
        title: &str,
        labels: &[String],
    ) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        if db.find_card_by_issue(issue_number)?.is_some() {
            return Ok(());
        }
        let board = db.ensure_board(&self.board_name)?;
        let list = db.ensure_list(&board.id, DEFAULT_LIST)?;
        let title = if title.is_empty() {
            format!("Issue #{issue_number}")
        } else {
            format!("Issue #{issue_number}: {title}")
        };
        let card = db.create_card(&new_issue_card(&list.id, issue_number, &title, labels.to_vec()))?;
        info!(card_id = %card.id, issue_number, "kanban card created for issue");
        if let Some(sync) = &self.sync {
            sync.submit(CardMutation::Create {
                card_id: card.id.clone(),
                list_name: DEFAULT_LIST.to_string(),
                title: card.title.clone(),
                description: card.description.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn on_issue_labelled(
        &self,
        issue_number: i64,
        label: &str,
        action: &str,
    ) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let Some(card) = db.find_card_by_issue(issue_number)? else {
            return Ok(());
        };
        let mut labels = card.labels.clone();
        match action {
            "added" if !labels.iter().any(|l| l == label) => labels.push(label.to_string()),
            "removed" => labels.retain(|l| l != label),
            _ => return Ok(()),
        }
        db.set_card_labels(&card.id, &labels)?;
        if let Some(sync) = &self.sync {
            sync.submit(CardMutation::Update {
                card_id: card.id.clone(),
                trello_card_id: card.trello_card_id.clone(),
                title: card.title.clone(),
                labels,
            });
        }
        Ok(())
    }

    /// Upsert the card into the agent's list and flip it live.
    fn on_job_started(
        &self,
        job_id: &str,
        issue_number: i64,
        agent_type: &str,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let board = db.ensure_board(&self.board_name)?;
        let list_name = list_for_agent_type(agent_type);
        let list = db.ensure_list(&board.id, list_name)?;

        let card = match db.find_card_by_issue(issue_number)? {
            Some(card) => {
                if card.list_id != list.id {
                    db.move_card(&card.id, &list.id, 0)?;
                }
                card
            }
            None => db.create_card(&new_issue_card(
                &list.id,
                issue_number,
                &format!("Issue #{issue_number}"),
                Vec::new(),
            ))?,
        };
        db.mark_card_processing(&card.id, job_id, timestamp)?;
        info!(card_id = %card.id, job_id, list = list_name, "card live");

        if let Some(sync) = &self.sync {
            sync.submit(CardMutation::Move {
                card_id: card.id.clone(),
                trello_card_id: card.trello_card_id.clone(),
                to_list: list_name.to_string(),
            });
        }
        Ok(())
    }

    /// Advance the live card's progress counters as the job moves through
    /// its steps.
    fn on_job_progress(&self, issue_number: i64, step: i64, total_steps: i64) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let Some(card) = db.find_card_by_issue(issue_number)? else {
            return Ok(());
        };
        if !card.being_processed {
            return Ok(());
        }
        db.update_card_progress(&card.id, step, total_steps)
    }

    fn on_job_finished(&self, issue_number: i64, history_event: &str) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        let Some(card) = db.find_card_by_issue(issue_number)? else {
            return Ok(());
        };
        if !card.being_processed {
            return Ok(());
        }
        db.clear_card_processing(&card.id, history_event)?;
        info!(card_id = %card.id, issue_number, event = history_event, "card settled");
        Ok(())
    }
}
