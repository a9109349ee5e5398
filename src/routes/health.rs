use axum::response::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

pub async fn healthcheck() -> Json<Status> {
    Json(Status {
        status: "Available",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
