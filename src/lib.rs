mod routes;
mod server;

pub mod app;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod event;
pub mod pipeline;
pub mod predictor;
pub mod results;
pub mod retry;
pub mod storage;
pub mod telemetry;

pub use app::{build_pipeline, start_app};
pub use pipeline::{ErrorKind, InvocationResult, Pipeline, PipelineError, Stage};
pub use routes::{Classification, HandleEventError};
pub use server::{HttpServer, SharedState};
