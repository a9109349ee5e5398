use crate::storage::{ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRecord {
    pub bucket: String,
    pub name: String,
    pub label: String,
    pub confidence: Option<f64>,
    /// Seconds since the Unix epoch.
    pub classified_at: u64,
}

impl ClassificationRecord {
    pub fn new(bucket: &str, name: &str, label: &str, confidence: Option<f64>) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            confidence,
            classified_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn record(&self, record: &ClassificationRecord) -> Result<(), StorageError>;
}

/// Writes each classification as `{name}.json` into a destination bucket.
pub struct BucketResultSink {
    store: Arc<dyn ObjectStore>,
    destination_bucket: String,
}

impl BucketResultSink {
    pub fn new(store: Arc<dyn ObjectStore>, destination_bucket: &str) -> Self {
        Self {
            store,
            destination_bucket: destination_bucket.to_string(),
        }
    }
}

#[async_trait]
impl ResultSink for BucketResultSink {
    async fn record(&self, record: &ClassificationRecord) -> Result<(), StorageError> {
        let body = serde_json::to_vec(record)?;
        self.store
            .put(
                &self.destination_bucket,
                &format!("{}.json", record.name),
                "application/json",
                Bytes::from(body),
            )
            .await
    }
}
