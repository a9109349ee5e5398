//! One invocation per upload event: fetch the image, authenticate, encode, invoke the prediction
//! endpoint and decode the top label. Stages run strictly in order and the first failure ends
//! the invocation.

use crate::{
    codec::{self, DecodeError},
    config::ConfigError,
    credentials::{AuthError, CredentialProvider},
    predictor::{InvocationError, Predictor},
    results::{ClassificationRecord, ResultSink},
    retry::{RetryPolicy, Transient},
    storage::{ObjectStore, StorageError},
    telemetry::Metrics,
};
use bytes::Bytes;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Authenticating,
    Encoding,
    Invoking,
    Decoding,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Authenticating => "authenticating",
            Stage::Encoding => "encoding",
            Stage::Invoking => "invoking",
            Stage::Decoding => "decoding",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Transient for ErrorKind {
    fn is_transient(&self) -> bool {
        match self {
            ErrorKind::Storage(e) => e.is_transient(),
            ErrorKind::Invocation(e) => e.is_transient(),
            ErrorKind::Config(_) | ErrorKind::Auth(_) | ErrorKind::Decode(_) => false,
        }
    }
}

#[derive(Error, Debug)]
#[error("Invocation failed while {stage}: {kind}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub kind: ErrorKind,
}

impl PipelineError {
    fn new(stage: Stage, kind: impl Into<ErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
        }
    }
}

/// Outcome of a successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub label: String,
    pub confidence: Option<f64>,
    pub raw_response: Bytes,
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    credentials: Arc<dyn CredentialProvider>,
    predictor: Arc<dyn Predictor>,
    results: Option<Arc<dyn ResultSink>>,
    retry: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialProvider>,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            store,
            credentials,
            predictor,
            results: None,
            retry: RetryPolicy::none(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultSink>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn run(&self, bucket: &str, name: &str) -> Result<InvocationResult, PipelineError> {
        let span = tracing::info_span!("invocation", bucket = %bucket, name = %name);
        let started = Instant::now();

        let outcome = self.run_stages(bucket, name).instrument(span.clone()).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.in_scope(|| match &outcome {
            Ok(result) => {
                tracing::info!(
                    "Classified gs://{}/{} as {} (confidence {:?}) in {}ms",
                    bucket,
                    name,
                    result.label,
                    result.confidence,
                    elapsed_ms
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_invocation("done", None, elapsed_ms);
                    metrics.record_label(&result.label);
                }
            }
            Err(err) => {
                tracing::error!("{}", err);
                if let Some(metrics) = &self.metrics {
                    metrics.record_invocation("failed", Some(err.stage.as_str()), elapsed_ms);
                }
            }
        });

        outcome
    }

    async fn run_stages(&self, bucket: &str, name: &str) -> Result<InvocationResult, PipelineError> {
        tracing::debug!(stage = %Stage::Fetching, "Entering stage");
        let image = self
            .retry
            .run("fetch", || self.store.fetch(bucket, name))
            .await
            .map_err(|e| PipelineError::new(Stage::Fetching, e))?;

        tracing::debug!(stage = %Stage::Authenticating, "Entering stage");
        let credential = self
            .credentials
            .acquire_token()
            .await
            .map_err(|e| PipelineError::new(Stage::Authenticating, e))?;

        tracing::debug!(stage = %Stage::Encoding, size = image.len(), "Entering stage");
        let request = codec::encode(&image);
        drop(image);

        tracing::debug!(stage = %Stage::Invoking, "Entering stage");
        let raw_response = self
            .retry
            .run("predict", || self.predictor.invoke(&credential, &request))
            .await
            .map_err(|e| PipelineError::new(Stage::Invoking, e))?;

        tracing::debug!(stage = %Stage::Decoding, "Entering stage");
        let prediction =
            codec::decode(&raw_response).map_err(|e| PipelineError::new(Stage::Decoding, e))?;

        let result = InvocationResult {
            label: prediction.label,
            confidence: prediction.confidence,
            raw_response,
        };
        self.record(bucket, name, &result).await;

        Ok(result)
    }

    /// Persistence is best effort; the label is returned even if it cannot be stored.
    async fn record(&self, bucket: &str, name: &str, result: &InvocationResult) {
        let Some(results) = &self.results else {
            return;
        };

        let record = ClassificationRecord::new(bucket, name, &result.label, result.confidence);
        if let Err(e) = results.record(&record).await {
            tracing::warn!("Failed to persist classification: {}", e);
            if let Some(metrics) = &self.metrics {
                metrics.record_result_sink_failure();
            }
        }
    }
}
