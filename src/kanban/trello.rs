//! External kanban provider port and the Trello-backed implementation.
//!
//! Only the capability interface is part of the core contract; the wire
//! client below is a thin REST adapter and stays out of every hot path (all
//! calls come from the sync worker).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::errors::KanbanError;

/// Capability set of an external kanban provider.
#[async_trait]
pub trait KanbanProvider: Send + Sync {
    /// Create a card in the named list, returning the provider's card id.
    async fn create_card(
        &self,
        list_name: &str,
        title: &str,
        description: &str,
    ) -> Result<String, KanbanError>;

    async fn update_card(
        &self,
        trello_card_id: &str,
        title: &str,
        labels: &[String],
    ) -> Result<(), KanbanError>;

    async fn move_card(&self, trello_card_id: &str, to_list: &str) -> Result<(), KanbanError>;

    async fn archive_card(&self, trello_card_id: &str) -> Result<(), KanbanError>;
}

/// Trello REST adapter. List names are resolved through a configured
/// name → list-id map; an unmapped list is a provider error so the sync
/// worker's retry/backoff handles it like any other provider fault. Label
/// names resolve the same way, except unmapped labels are skipped — a label
/// that only exists on GitHub must not wedge the sync queue.
pub struct TrelloClient {
    http: Client,
    base_url: String,
    key: String,
    token: String,
    list_ids: HashMap<String, String>,
    label_ids: HashMap<String, String>,
}

impl TrelloClient {
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: "https://api.trello.com/1".to_string(),
            key: key.into(),
            token: token.into(),
            list_ids: HashMap::new(),
            label_ids: HashMap::new(),
        }
    }

    /// Override the API endpoint (tests point this at a local server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_list(mut self, name: impl Into<String>, list_id: impl Into<String>) -> Self {
        self.list_ids.insert(name.into(), list_id.into());
        self
    }

    pub fn with_label(mut self, name: impl Into<String>, label_id: impl Into<String>) -> Self {
        self.label_ids.insert(name.into(), label_id.into());
        self
    }

    fn list_id(&self, name: &str) -> Result<&str, KanbanError> {
        self.list_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| KanbanError::Provider(format!("no Trello list mapped for '{name}'")))
    }

    /// Comma-joined Trello label ids for the card's label names. The full
    /// set is sent on every update so provider-side removals follow the
    /// local state (last-write-wins).
    fn resolve_label_ids(&self, labels: &[String]) -> String {
        let mut ids = Vec::new();
        for label in labels {
            match self.label_ids.get(label) {
                Some(id) => ids.push(id.as_str()),
                None => debug!(label = %label, "no Trello label mapped; skipping"),
            }
        }
        ids.join(",")
    }

    fn auth(&self) -> [(&'static str, &str); 2] {
        [("key", self.key.as_str()), ("token", self.token.as_str())]
    }
}

#[async_trait]
impl KanbanProvider for TrelloClient {
    async fn create_card(
        &self,
        list_name: &str,
        title: &str,
        description: &str,
    ) -> Result<String, KanbanError> {
        let list_id = self.list_id(list_name)?;
        let response = self
            .http
            .post(format!("{}/cards", self.base_url))
            .query(&self.auth())
            .query(&[("idList", list_id), ("name", title), ("desc", description)])
            .send()
            .await
            .map_err(|e| KanbanError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| KanbanError::Provider(e.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KanbanError::Provider(e.to_string()))?;
        let card_id = body
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| KanbanError::Provider("create response missing card id".into()))?;
        debug!(card_id, list_name, "trello card created");
        Ok(card_id.to_string())
    }

    async fn update_card(
        &self,
        trello_card_id: &str,
        title: &str,
        labels: &[String],
    ) -> Result<(), KanbanError> {
        let id_labels = self.resolve_label_ids(labels);
        self.http
            .put(format!("{}/cards/{}", self.base_url, trello_card_id))
            .query(&self.auth())
            .query(&[("name", title), ("idLabels", id_labels.as_str())])
            .send()
            .await
            .map_err(|e| KanbanError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| KanbanError::Provider(e.to_string()))?;
        Ok(())
    }

    async fn move_card(&self, trello_card_id: &str, to_list: &str) -> Result<(), KanbanError> {
        let list_id = self.list_id(to_list)?;
        self.http
            .put(format!("{}/cards/{}", self.base_url, trello_card_id))
            .query(&self.auth())
            .query(&[("idList", list_id)])
            .send()
            .await
            .map_err(|e| KanbanError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| KanbanError::Provider(e.to_string()))?;
        Ok(())
    }

    async fn archive_card(&self, trello_card_id: &str) -> Result<(), KanbanError> {
        self.http
            .put(format!("{}/cards/{}/closed", self.base_url, trello_card_id))
            .query(&self.auth())
            .query(&[("value", "true")])
            .send()
            .await
            .map_err(|e| KanbanError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| KanbanError::Provider(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_list_is_provider_error() {
        let client = TrelloClient::new("k", "t").with_list("Issues", "list-1");
        assert_eq!(client.list_id("Issues").unwrap(), "list-1");
        assert!(matches!(
            client.list_id("Em Andamento").unwrap_err(),
            KanbanError::Provider(_)
        ));
    }

    #[test]
    fn test_label_ids_resolve_in_order_skipping_unmapped() {
        let client = TrelloClient::new("k", "t")
            .with_label("bug", "lbl-red")
            .with_label("backend", "lbl-blue");
        let labels = vec![
            "bug".to_string(),
            "github-only".to_string(),
            "backend".to_string(),
        ];
        assert_eq!(client.resolve_label_ids(&labels), "lbl-red,lbl-blue");
    }

    #[test]
    fn test_empty_label_set_clears_provider_labels() {
        let client = TrelloClient::new("k", "t").with_label("bug", "lbl-red");
        // An empty idLabels value is what tells Trello to drop every label.
        assert_eq!(client.resolve_label_ids(&[]), "");
    }

    #[tokio::test]
    async fn test_create_card_unreachable_endpoint_is_provider_error() {
        // Nothing listens on this port; the request must fail as a
        // provider error, not a panic.
        let client = TrelloClient::new("k", "t")
            .with_base_url("http://127.0.0.1:9")
            .with_list("Issues", "list-1");
        let err = client.create_card("Issues", "title", "desc").await.unwrap_err();
        assert!(matches!(err, KanbanError::Provider(_)));
    }
}
