use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Structured event has no data")]
    MissingData,
    #[error("Event is missing the {0} field")]
    MissingField(&'static str),
}

/// Payload of a `google.cloud.storage.object.v1.finalized` event.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageObjectData {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_metageneration")]
    pub metageneration: Option<i64>,
    #[serde(default)]
    pub time_created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Storage sends int64 fields as JSON strings.
fn deserialize_metageneration<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Text(String),
        Number(i64),
    }

    match Option::<Int64>::deserialize(deserializer)? {
        Some(Int64::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(Int64::Number(n)) => Ok(Some(n)),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct StructuredEvent {
    id: Option<String>,
    data: Option<StorageObjectData>,
}

impl StorageObjectData {
    /// Decodes a CloudEvent body. Structured mode carries the payload under `data`; binary mode
    /// sends the payload as the body and the attributes as `ce-*` headers.
    pub fn from_event_body(content_type: Option<&str>, body: &[u8]) -> Result<Self, EventError> {
        let structured = content_type
            .map(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE))
            .unwrap_or(false);

        let data = if structured {
            let event: StructuredEvent = serde_json::from_slice(body)?;
            tracing::debug!("Structured event id={:?}", event.id);
            event.data.ok_or(EventError::MissingData)?
        } else {
            serde_json::from_slice(body)?
        };

        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.bucket.is_empty() {
            return Err(EventError::MissingField("bucket"));
        }
        if self.name.is_empty() {
            return Err(EventError::MissingField("name"));
        }
        Ok(())
    }
}
