use crate::{
    codec::PredictionRequest, config::PredictionConfig, credentials::Credential, retry::Transient,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("non 200 HTTP status code; {status}; {body}")]
    Status { status: u16, body: String },
    #[error("Prediction request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl InvocationError {
    pub fn status(&self) -> Option<u16> {
        match self {
            InvocationError::Status { status, .. } => Some(*status),
            InvocationError::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

impl Transient for InvocationError {
    fn is_transient(&self) -> bool {
        match self {
            InvocationError::Transport(_) => true,
            InvocationError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
        }
    }
}

#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    /// Sends one request and returns the raw body of a 200 response.
    async fn invoke(
        &self,
        credential: &Credential,
        request: &PredictionRequest,
    ) -> Result<Bytes, InvocationError>;
}

/// Online prediction against a deployed Vertex AI endpoint.
#[derive(Debug, Clone)]
pub struct VertexPredictor {
    client: reqwest::Client,
    endpoint_url: String,
    timeout: Option<Duration>,
}

impl VertexPredictor {
    pub fn new(client: reqwest::Client, config: &PredictionConfig) -> Self {
        Self {
            client,
            endpoint_url: config.get_endpoint_url(),
            timeout: config.get_timeout(),
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

#[async_trait]
impl Predictor for VertexPredictor {
    #[instrument(skip(self, credential, request), fields(endpoint = %self.endpoint_url))]
    async fn invoke(
        &self,
        credential: &Credential,
        request: &PredictionRequest,
    ) -> Result<Bytes, InvocationError> {
        let mut builder = self
            .client
            .post(&self.endpoint_url)
            .header(header::AUTHORIZATION, credential.bearer())
            .json(request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::OK {
            return Err(InvocationError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        tracing::debug!("Prediction response: {}", String::from_utf8_lossy(&body));
        Ok(body)
    }
}
