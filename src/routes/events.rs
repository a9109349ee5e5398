use crate::{
    event::{EventError, StorageObjectData},
    pipeline::{PipelineError, Stage},
    retry::Transient,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum HandleEventError {
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
}

impl IntoResponse for HandleEventError {
    fn into_response(self) -> Response {
        let (status, stage) = match &self {
            HandleEventError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, None),
            HandleEventError::Pipeline(e) if e.kind.is_transient() => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(e.stage))
            }
            HandleEventError::Pipeline(e) => (StatusCode::INTERNAL_SERVER_ERROR, Some(e.stage)),
        };
        let body = ErrorBody {
            error: self.to_string(),
            stage,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize, Debug)]
pub struct Classification {
    pub bucket: String,
    pub name: String,
    pub label: String,
    pub confidence: Option<f64>,
}

/// CloudEvent push endpoint for storage object finalization.
#[instrument(skip(state, headers, body), fields(ce_id = tracing::field::Empty))]
pub async fn handle_event(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Classification>, HandleEventError> {
    state.metrics.record_request("event");

    if let Some(id) = headers.get("ce-id").and_then(|v| v.to_str().ok()) {
        tracing::Span::current().record("ce_id", id);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let data = StorageObjectData::from_event_body(content_type, &body).map_err(|e| {
        tracing::warn!("Rejecting event: {}", e);
        e
    })?;

    let result = state.pipeline.run(&data.bucket, &data.name).await?;

    Ok(Json(Classification {
        bucket: data.bucket,
        name: data.name,
        label: result.label,
        confidence: result.confidence,
    }))
}
