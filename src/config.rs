use serde::Deserialize;
use std::{path::Path, time::Duration};
use thiserror::Error;

const DEFAULT_REGION: &str = "us-central1";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const DEFAULT_STORAGE_BASE_URL: &str = "https://storage.googleapis.com";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{0} env var is not defined")]
    MissingValue(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub results: ResultsConfig,
}

impl Config {
    /// Rejects configurations the pipeline cannot run with. Called once at start-up, before any
    /// collaborator is constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prediction.project_id.trim().is_empty() {
            return Err(ConfigError::MissingValue("PROJECT_ID"));
        }
        if self.prediction.endpoint_id.trim().is_empty() {
            return Err(ConfigError::MissingValue("ENDPOINT_ID"));
        }
        if self.prediction.region.trim().is_empty() {
            return Err(ConfigError::Invalid("prediction.region is empty".into()));
        }
        if let AuthStrategy::Static = self.auth.strategy {
            if self.auth.static_token.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::Invalid(
                    "auth.static_token is required with the `static` strategy".into(),
                ));
            }
        }
        if self.retry.backoff_factor == 0 {
            return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1".into()));
        }
        Ok(())
    }
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictionConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub endpoint_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides `https://{region}-aiplatform.googleapis.com`.
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_region() -> String {
    DEFAULT_REGION.into()
}

impl PredictionConfig {
    pub fn get_base_url(&self) -> String {
        match &self.api_host {
            Some(host) => host.trim_end_matches('/').to_string(),
            None => format!("https://{}-aiplatform.googleapis.com", self.region),
        }
    }

    pub fn get_endpoint_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/endpoints/{}:predict",
            self.get_base_url(),
            self.project_id,
            self.region,
            self.endpoint_id
        )
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    IdentityToken,
    MetadataService,
    Static,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_strategy")]
    pub strategy: AuthStrategy,
    #[serde(default = "default_metadata_host")]
    pub metadata_host: String,
    /// Audience for the identity-token strategy. Falls back to the prediction base URL.
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub static_token: Option<String>,
    #[serde(default = "default_cache_tokens")]
    pub cache_tokens: bool,
    #[serde(default = "default_expiry_skew_secs")]
    pub expiry_skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            strategy: default_auth_strategy(),
            metadata_host: default_metadata_host(),
            audience: None,
            scope: default_scope(),
            static_token: None,
            cache_tokens: default_cache_tokens(),
            expiry_skew_secs: default_expiry_skew_secs(),
        }
    }
}

fn default_auth_strategy() -> AuthStrategy {
    AuthStrategy::IdentityToken
}

fn default_metadata_host() -> String {
    DEFAULT_METADATA_HOST.into()
}

fn default_scope() -> String {
    CLOUD_PLATFORM_SCOPE.into()
}

fn default_cache_tokens() -> bool {
    true
}

fn default_expiry_skew_secs() -> u64 {
    30
}

impl AuthConfig {
    pub fn get_expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_base_url")]
    pub base_url: String,
    #[serde(default = "default_storage_scope")]
    pub scope: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: default_storage_base_url(),
            scope: default_storage_scope(),
        }
    }
}

fn default_storage_base_url() -> String {
    DEFAULT_STORAGE_BASE_URL.into()
}

fn default_storage_scope() -> String {
    STORAGE_SCOPE.into()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResultsConfig {
    #[serde(default)]
    pub destination_bucket: Option<String>,
}

impl ResultsConfig {
    pub fn get_destination_bucket(&self) -> Option<&str> {
        self.destination_bucket
            .as_deref()
            .filter(|bucket| !bucket.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Loads `configuration/base.yaml`, the `APP_ENVIRONMENT` overlay and `UC_*` variables, then
/// applies the platform variables (`PROJECT_ID`, `ENDPOINT_ID`, `PORT`, `DESTINATION_BUCKET`).
pub fn get_configuration() -> Result<Config, ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| ConfigError::Invalid(format!("Failed to determine the current directory: {}", e)))?;

    load_configuration(&base_path.join("configuration"), |key| std::env::var(key).ok())
}

fn load_configuration<F>(configuration_directory: &Path, var: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Cloud Run sets K_SERVICE; default to production there.
    let environment: Environment = var("APP_ENVIRONMENT")
        .or_else(|| var("K_SERVICE").map(|_| "production".into()))
        .unwrap_or_else(|| "local".into())
        .try_into()
        .map_err(ConfigError::Invalid)?;

    let port = match var("PORT") {
        Some(port) => Some(
            port.parse::<u16>()
                .map_err(|e| ConfigError::Invalid(format!("PORT is not a valid port: {}", e)))?,
        ),
        None => None,
    };

    let builder = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")).required(false))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("UC")
                .prefix_separator("_")
                .separator("__"),
        )
        .set_override_option("prediction.project_id", var("PROJECT_ID"))?
        .set_override_option("prediction.endpoint_id", var("ENDPOINT_ID"))?
        .set_override_option("server.port", port.map(i64::from))?
        .set_override_option("results.destination_bucket", var("DESTINATION_BUCKET"))?;

    let config = builder.build()?.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}
