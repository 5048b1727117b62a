//! Kanban projection.
//!
//! The local SQLite board is the source of truth for issue/job lifecycle;
//! the external provider (Trello) is a projection target reconciled
//! asynchronously by [`sync::TrelloSyncService`].

pub mod db;
pub mod listener;
pub mod sync;
pub mod trello;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use db::KanbanDb;
pub use listener::KanbanJobEventHandler;
pub use sync::{CardMutation, TrelloSyncService};
pub use trello::{KanbanProvider, TrelloClient};

/// Default list an issue card lands in before any job picks it up.
pub const DEFAULT_LIST: &str = "Issues";

/// Board list an agent's work is tracked in, by agent type.
pub fn list_for_agent_type(agent_type: &str) -> &'static str {
    match agent_type {
        "analyze-issue" => "Brainstorm",
        "resolve-issue" => "Em Andamento",
        "review-issue" => "Em Revisão",
        "publish-issue" => "Publicar",
        _ => DEFAULT_LIST,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KanbanBoard {
    pub id: String,
    pub name: String,
    pub trello_board_id: Option<String>,
    pub trello_sync_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KanbanList {
    pub id: String,
    pub board_id: String,
    pub name: String,
    pub position: i64,
    pub trello_list_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A card mirroring one issue. Cards currently worked by an agent are
/// "live": `being_processed` set and pinned to position 0 of their list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KanbanCard {
    pub id: String,
    pub list_id: String,
    pub title: String,
    pub description: Option<String>,
    pub position: i64,
    pub labels: Vec<String>,

    pub being_processed: bool,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_job_id: Option<String>,
    pub processing_step: i64,
    pub processing_total_steps: i64,

    pub issue_number: Option<i64>,
    pub issue_url: Option<String>,
    pub pr_url: Option<String>,
    pub trello_card_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KanbanCard {
    pub fn processing_progress_percent(&self) -> f64 {
        if self.processing_total_steps == 0 {
            0.0
        } else {
            self.processing_step as f64 / self.processing_total_steps as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardHistory {
    pub id: i64,
    pub card_id: String,
    /// 'created', 'moved', 'updated', 'processing_started',
    /// 'processing_completed', 'processing_failed'
    pub event: String,
    pub from_list_id: Option<String>,
    pub to_list_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_list_mapping() {
        assert_eq!(list_for_agent_type("analyze-issue"), "Brainstorm");
        assert_eq!(list_for_agent_type("resolve-issue"), "Em Andamento");
        assert_eq!(list_for_agent_type("review-issue"), "Em Revisão");
        assert_eq!(list_for_agent_type("publish-issue"), "Publicar");
        assert_eq!(list_for_agent_type("unknown"), "Issues");
    }

    #[test]
    fn test_processing_progress_percent() {
        let mut card = KanbanCard {
            id: "c1".into(),
            list_id: "l1".into(),
            title: "Issue #1".into(),
            description: None,
            position: 0,
            labels: vec![],
            being_processed: true,
            processing_started_at: Some(Utc::now()),
            processing_job_id: Some("j1".into()),
            processing_step: 3,
            processing_total_steps: 8,
            issue_number: Some(1),
            issue_url: None,
            pr_url: None,
            trello_card_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!((card.processing_progress_percent() - 37.5).abs() < 1e-9);
        card.processing_total_steps = 0;
        assert_eq!(card.processing_progress_percent(), 0.0);
    }
}
