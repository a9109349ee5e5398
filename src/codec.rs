use base64::{prelude::BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const MAX_PREDICTIONS: u32 = 5;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed prediction response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Prediction response contains no predictions")]
    NoPredictions,
    #[error("First prediction contains no display names")]
    NoLabels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRequest {
    pub instances: Vec<Instance>,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    pub confidence_threshold: f64,
    pub max_predictions: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            confidence_threshold: CONFIDENCE_THRESHOLD,
            max_predictions: MAX_PREDICTIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PredictionResponse {
    #[serde(default)]
    pub predictions: Vec<ClassPrediction>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassPrediction {
    #[serde(default)]
    pub display_names: Vec<String>,
    #[serde(default)]
    pub confidences: Vec<f64>,
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Top label of a prediction response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: Option<f64>,
}

/// Wraps the image as the single instance of a request with the fixed inference parameters.
pub fn encode(image: &[u8]) -> PredictionRequest {
    PredictionRequest {
        instances: vec![Instance {
            content: BASE64_STANDARD.encode(image),
        }],
        parameters: Parameters::default(),
    }
}

pub fn decode(body: &[u8]) -> Result<Prediction, DecodeError> {
    let response: PredictionResponse = serde_json::from_slice(body)?;
    response.top_prediction()
}

impl PredictionResponse {
    pub fn top_prediction(&self) -> Result<Prediction, DecodeError> {
        let first = self.predictions.first().ok_or(DecodeError::NoPredictions)?;
        let label = first.display_names.first().ok_or(DecodeError::NoLabels)?;

        Ok(Prediction {
            label: label.clone(),
            confidence: first.confidences.first().copied(),
        })
    }
}
