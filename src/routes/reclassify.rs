use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Deserialize, Debug)]
pub struct ReclassifyRequest {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Serialize, Debug)]
pub struct ReclassifyItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the pipeline for every object under a prefix, one at a time.
#[instrument(skip(state))]
pub async fn reclassify(
    State(state): State<SharedState>,
    Json(request): Json<ReclassifyRequest>,
) -> Response {
    state.metrics.record_request("reclassify");

    if request.bucket.is_empty() {
        return (StatusCode::BAD_REQUEST, "bucket is required").into_response();
    }

    let names = match state
        .pipeline
        .store()
        .list(&request.bucket, &request.prefix)
        .await
    {
        Ok(names) => names,
        Err(e) => {
            tracing::error!("Failed to list objects: {}", e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let mut items = Vec::with_capacity(names.len());
    for name in names {
        let item = match state.pipeline.run(&request.bucket, &name).await {
            Ok(result) => ReclassifyItem {
                name,
                label: Some(result.label),
                error: None,
            },
            Err(e) => ReclassifyItem {
                name,
                label: None,
                error: Some(e.to_string()),
            },
        };
        items.push(item);
    }

    Json(items).into_response()
}
