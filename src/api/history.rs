//! Processing-history entries in the server's activity log.
//!
//! Logging failures never interrupt processing; callers get `None`
//! instead of an error.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::client::ApiClient;

/// One history entry. Built with struct update syntax from
/// `HistoryEntry::action(..)`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<i64>,
    pub action: String,
    pub new_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl HistoryEntry {
    pub fn action(action: &str, new_status: &str) -> Self {
        Self {
            action: action.to_string(),
            new_status: new_status.to_string(),
            success: true,
            ..Default::default()
        }
    }
}

/// API client for processing history.
#[derive(Clone)]
pub struct ProcessingHistoryApi {
    client: ApiClient,
}

impl ProcessingHistoryApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Create a history entry; returns its id for later reference.
    pub async fn create(&self, entry: &HistoryEntry) -> Option<i64> {
        let body = match serde_json::to_value(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!("History-Eintrag nicht serialisierbar: {}", e);
                return None;
            }
        };
        match self.client.post("/processing-history", &body).await {
            Ok(response) if response.get("success").and_then(Value::as_bool) == Some(true) => {
                response["data"]["id"].as_i64()
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "History-Logging fehlgeschlagen fuer Dokument {:?}: {}",
                    entry.document_id, e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization_skips_unset() {
        let entry = HistoryEntry {
            document_id: Some(12),
            previous_status: Some("pending".into()),
            ..HistoryEntry::action("start_processing", "processing")
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action"], "start_processing");
        assert_eq!(value["document_id"], 12);
        assert!(value.get("error_message").is_none());
        assert!(value.get("duration_ms").is_none());
    }
}
