use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{ClassificationResult, ModelVariant};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("history endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// One classification, as recorded in the user's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub content_type: String,
    pub content_url: String,
    pub result: ClassificationResult,
    pub model_type: ModelVariant,
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(variant: ModelVariant, result: ClassificationResult, content_url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type: "image".to_string(),
            content_url,
            result,
            model_type: variant,
            timestamp: Utc::now(),
        }
    }
}

/// `sha256:<hex>` reference for images submitted without a content URL.
pub fn content_digest(image_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Where successful classifications are recorded. Failures here never
/// affect the response already returned to the caller.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: HistoryEntry) -> BoxFuture<'_, Result<(), HistoryError>>;
}

pub struct LogHistorySink;

impl HistorySink for LogHistorySink {
    fn record(&self, entry: HistoryEntry) -> BoxFuture<'_, Result<(), HistoryError>> {
        Box::pin(async move {
            log::info!(
                "History {}: {} -> {} ({}%)",
                entry.id,
                entry.model_type,
                entry.result.predicted_class,
                entry.result.confidence_text()
            );
            Ok(())
        })
    }
}

/// Posts entries as JSON to an external history service.
#[derive(Clone)]
pub struct HttpHistorySink {
    client: reqwest::Client,
    url: String,
}

impl HttpHistorySink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HistorySink for HttpHistorySink {
    fn record(&self, entry: HistoryEntry) -> BoxFuture<'_, Result<(), HistoryError>> {
        Box::pin(async move {
            let response = self.client.post(&self.url).json(&entry).send().await?;
            if !response.status().is_success() {
                return Err(HistoryError::Status(response.status()));
            }
            log::debug!("Recorded history entry {}", entry.id);
            Ok(())
        })
    }
}
