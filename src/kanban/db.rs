//! SQLite store for the kanban projection.
//!
//! Single-writer access through short operations; callers share the handle
//! behind a mutex. Schema lives in code and migrations are idempotent.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::{CardHistory, KanbanBoard, KanbanCard, KanbanList};

pub struct KanbanDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl KanbanDb {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open kanban database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS boards (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    trello_board_id TEXT,
                    trello_sync_enabled INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lists (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    trello_list_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(board_id, name)
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id TEXT PRIMARY KEY,
                    list_id TEXT NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    labels TEXT NOT NULL DEFAULT '[]',
                    being_processed INTEGER NOT NULL DEFAULT 0,
                    processing_started_at TEXT,
                    processing_job_id TEXT,
                    processing_step INTEGER NOT NULL DEFAULT 0,
                    processing_total_steps INTEGER NOT NULL DEFAULT 0,
                    issue_number INTEGER,
                    issue_url TEXT,
                    pr_url TEXT,
                    trello_card_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS card_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    card_id TEXT NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    event TEXT NOT NULL,
                    from_list_id TEXT,
                    to_list_id TEXT,
                    metadata TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_lists_board ON lists(board_id);
                CREATE INDEX IF NOT EXISTS idx_cards_list ON cards(list_id);
                CREATE INDEX IF NOT EXISTS idx_cards_issue ON cards(issue_number);
                CREATE INDEX IF NOT EXISTS idx_history_card ON card_history(card_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Boards ────────────────────────────────────────────────────────

    /// Fetch the board by name, creating it on first use.
    pub fn ensure_board(&self, name: &str) -> Result<KanbanBoard> {
        if let Some(board) = self.get_board_by_name(name)? {
            return Ok(board);
        }
        let ts = now();
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO boards (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, ts, ts],
            )
            .context("Failed to insert board")?;
        self.get_board_by_name(name)?
            .context("Board not found after insert")
    }

    pub fn get_board_by_name(&self, name: &str) -> Result<Option<KanbanBoard>> {
        self.conn
            .query_row(
                "SELECT id, name, trello_board_id, trello_sync_enabled, created_at, updated_at
                 FROM boards WHERE name = ?1",
                params![name],
                |row| {
                    Ok(KanbanBoard {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        trello_board_id: row.get(2)?,
                        trello_sync_enabled: row.get::<_, i64>(3)? != 0,
                        created_at: parse_ts(row.get(4)?),
                        updated_at: parse_ts(row.get(5)?),
                    })
                },
            )
            .optional()
            .context("Failed to query board")
    }

    // ── Lists ─────────────────────────────────────────────────────────

    /// Fetch a list by name within a board, creating it at the end of the
    /// board when missing.
    pub fn ensure_list(&self, board_id: &str, name: &str) -> Result<KanbanList> {
        if let Some(list) = self.find_list_by_name(board_id, name)? {
            return Ok(list);
        }
        let max_pos: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM lists WHERE board_id = ?1",
                params![board_id],
                |row| row.get(0),
            )
            .context("Failed to get max list position")?;
        let ts = now();
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO lists (id, board_id, name, position, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, board_id, name, max_pos + 1, ts, ts],
            )
            .context("Failed to insert list")?;
        self.find_list_by_name(board_id, name)?
            .context("List not found after insert")
    }

    pub fn find_list_by_name(&self, board_id: &str, name: &str) -> Result<Option<KanbanList>> {
        self.conn
            .query_row(
                "SELECT id, board_id, name, position, trello_list_id, created_at, updated_at
                 FROM lists WHERE board_id = ?1 AND name = ?2",
                params![board_id, name],
                Self::row_to_list,
            )
            .optional()
            .context("Failed to query list")
    }

    pub fn list_lists(&self, board_id: &str) -> Result<Vec<KanbanList>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, board_id, name, position, trello_list_id, created_at, updated_at
                 FROM lists WHERE board_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_lists")?;
        let rows = stmt
            .query_map(params![board_id], Self::row_to_list)
            .context("Failed to query lists")?;
        let mut lists = Vec::new();
        for row in rows {
            lists.push(row.context("Failed to read list row")?);
        }
        Ok(lists)
    }

    fn row_to_list(row: &rusqlite::Row<'_>) -> rusqlite::Result<KanbanList> {
        Ok(KanbanList {
            id: row.get(0)?,
            board_id: row.get(1)?,
            name: row.get(2)?,
            position: row.get(3)?,
            trello_list_id: row.get(4)?,
            created_at: parse_ts(row.get(5)?),
            updated_at: parse_ts(row.get(6)?),
        })
    }

    // ── Cards ─────────────────────────────────────────────────────────

    const CARD_COLUMNS: &'static str = "id, list_id, title, description, position, labels,
        being_processed, processing_started_at, processing_job_id, processing_step,
        processing_total_steps, issue_number, issue_url, pr_url, trello_card_id,
        created_at, updated_at";

    pub fn create_card(&self, card: &KanbanCard) -> Result<KanbanCard> {
        let labels = serde_json::to_string(&card.labels).context("Failed to encode labels")?;
        self.conn
            .execute(
                "INSERT INTO cards (id, list_id, title, description, position, labels,
                    being_processed, processing_started_at, processing_job_id, processing_step,
                    processing_total_steps, issue_number, issue_url, pr_url, trello_card_id,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    card.id,
                    card.list_id,
                    card.title,
                    card.description,
                    card.position,
                    labels,
                    card.being_processed as i64,
                    card.processing_started_at.map(|t| t.to_rfc3339()),
                    card.processing_job_id,
                    card.processing_step,
                    card.processing_total_steps,
                    card.issue_number,
                    card.issue_url,
                    card.pr_url,
                    card.trello_card_id,
                    card.created_at.to_rfc3339(),
                    card.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert card")?;
        self.add_history(&card.id, "created", None, Some(&card.list_id), None)?;
        self.get_card(&card.id)?.context("Card not found after insert")
    }

    pub fn get_card(&self, card_id: &str) -> Result<Option<KanbanCard>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM cards WHERE id = ?1", Self::CARD_COLUMNS),
                params![card_id],
                Self::row_to_card,
            )
            .optional()
            .context("Failed to query card")
    }

    pub fn list_cards(&self, list_id: Option<&str>) -> Result<Vec<KanbanCard>> {
        let (sql, list_filter) = match list_id {
            Some(id) => (
                format!(
                    "SELECT {} FROM cards WHERE list_id = ?1 ORDER BY position",
                    Self::CARD_COLUMNS
                ),
                Some(id),
            ),
            None => (
                format!("SELECT {} FROM cards ORDER BY position", Self::CARD_COLUMNS),
                None,
            ),
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_cards")?;
        let mut cards = Vec::new();
        match list_filter {
            Some(id) => {
                let rows = stmt
                    .query_map(params![id], Self::row_to_card)
                    .context("Failed to query cards")?;
                for row in rows {
                    cards.push(row.context("Failed to read card row")?);
                }
            }
            None => {
                let rows = stmt
                    .query_map([], Self::row_to_card)
                    .context("Failed to query cards")?;
                for row in rows {
                    cards.push(row.context("Failed to read card row")?);
                }
            }
        }
        Ok(cards)
    }

    pub fn find_card_by_issue(&self, issue_number: i64) -> Result<Option<KanbanCard>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM cards WHERE issue_number = ?1 ORDER BY updated_at DESC LIMIT 1",
                    Self::CARD_COLUMNS
                ),
                params![issue_number],
                Self::row_to_card,
            )
            .optional()
            .context("Failed to query card by issue")
    }

    /// Flip a card live: processing fields set, pinned to position 0.
    pub fn mark_card_processing(
        &self,
        card_id: &str,
        job_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE cards SET being_processed = 1, processing_job_id = ?1,
                    processing_started_at = ?2, position = 0, updated_at = ?3
                 WHERE id = ?4",
                params![job_id, started_at.to_rfc3339(), now(), card_id],
            )
            .context("Failed to mark card processing")?;
        anyhow::ensure!(count > 0, "Card {card_id} not found");
        self.add_history(
            card_id,
            "processing_started",
            None,
            None,
            Some(&serde_json::json!({"job_id": job_id}).to_string()),
        )
    }

    /// Clear the live flags when the owning job reaches a terminal state.
    pub fn clear_card_processing(&self, card_id: &str, history_event: &str) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE cards SET being_processed = 0, processing_job_id = NULL,
                    processing_step = 0, processing_total_steps = 0, updated_at = ?1
                 WHERE id = ?2",
                params![now(), card_id],
            )
            .context("Failed to clear card processing")?;
        anyhow::ensure!(count > 0, "Card {card_id} not found");
        self.add_history(card_id, history_event, None, None, None)
    }

    pub fn update_card_progress(&self, card_id: &str, step: i64, total: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET processing_step = ?1, processing_total_steps = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![step, total, now(), card_id],
            )
            .context("Failed to update card progress")?;
        Ok(())
    }

    pub fn move_card(&self, card_id: &str, to_list_id: &str, position: i64) -> Result<()> {
        let from_list: Option<String> = self
            .conn
            .query_row(
                "SELECT list_id FROM cards WHERE id = ?1",
                params![card_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read card list")?;
        let count = self
            .conn
            .execute(
                "UPDATE cards SET list_id = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
                params![to_list_id, position, now(), card_id],
            )
            .context("Failed to move card")?;
        anyhow::ensure!(count > 0, "Card {card_id} not found");
        self.add_history(card_id, "moved", from_list.as_deref(), Some(to_list_id), None)
    }

    pub fn set_card_labels(&self, card_id: &str, labels: &[String]) -> Result<()> {
        let encoded = serde_json::to_string(labels).context("Failed to encode labels")?;
        self.conn
            .execute(
                "UPDATE cards SET labels = ?1, updated_at = ?2 WHERE id = ?3",
                params![encoded, now(), card_id],
            )
            .context("Failed to set card labels")?;
        Ok(())
    }

    pub fn set_trello_card_id(&self, card_id: &str, trello_card_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET trello_card_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![trello_card_id, now(), card_id],
            )
            .context("Failed to set trello card id")?;
        Ok(())
    }

    pub fn set_card_pr_url(&self, card_id: &str, pr_url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cards SET pr_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![pr_url, now(), card_id],
            )
            .context("Failed to set card pr url")?;
        Ok(())
    }

    fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<KanbanCard> {
        let labels_raw: String = row.get(5)?;
        Ok(KanbanCard {
            id: row.get(0)?,
            list_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            position: row.get(4)?,
            labels: serde_json::from_str(&labels_raw).unwrap_or_default(),
            being_processed: row.get::<_, i64>(6)? != 0,
            processing_started_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
            processing_job_id: row.get(8)?,
            processing_step: row.get(9)?,
            processing_total_steps: row.get(10)?,
            issue_number: row.get(11)?,
            issue_url: row.get(12)?,
            pr_url: row.get(13)?,
            trello_card_id: row.get(14)?,
            created_at: parse_ts(row.get(15)?),
            updated_at: parse_ts(row.get(16)?),
        })
    }

    // ── History ───────────────────────────────────────────────────────

    pub fn add_history(
        &self,
        card_id: &str,
        event: &str,
        from_list_id: Option<&str>,
        to_list_id: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO card_history (card_id, event, from_list_id, to_list_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![card_id, event, from_list_id, to_list_id, metadata, now()],
            )
            .context("Failed to insert card history")?;
        Ok(())
    }

    pub fn list_history(&self, card_id: &str) -> Result<Vec<CardHistory>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, card_id, event, from_list_id, to_list_id, metadata, created_at
                 FROM card_history WHERE card_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_history")?;
        let rows = stmt
            .query_map(params![card_id], |row| {
                Ok(CardHistory {
                    id: row.get(0)?,
                    card_id: row.get(1)?,
                    event: row.get(2)?,
                    from_list_id: row.get(3)?,
                    to_list_id: row.get(4)?,
                    metadata: row.get(5)?,
                    created_at: parse_ts(row.get(6)?),
                })
            })
            .context("Failed to query history")?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.context("Failed to read history row")?);
        }
        Ok(history)
    }
}

/// Fresh card bound to an issue, ready for `create_card`.
pub fn new_issue_card(
    list_id: &str,
    issue_number: i64,
    title: &str,
    labels: Vec<String>,
) -> KanbanCard {
    let ts = Utc::now();
    KanbanCard {
        id: Uuid::new_v4().to_string(),
        list_id: list_id.to_string(),
        title: title.to_string(),
        description: None,
        position: 0,
        labels,
        being_processed: false,
        processing_started_at: None,
        processing_job_id: None,
        processing_step: 0,
        processing_total_steps: 0,
        issue_number: Some(issue_number),
        issue_url: None,
        pr_url: None,
        trello_card_id: None,
        created_at: ts,
        updated_at: ts,
    }
}
