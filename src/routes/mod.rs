mod events;
mod health;
mod metrics;
mod reclassify;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

use events::handle_event;
use health::healthcheck;
use metrics::metrics_handler;
use reclassify::reclassify;

pub use events::{Classification, HandleEventError};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", post(handle_event))
        .route("/reclassify", post(reclassify))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
}
