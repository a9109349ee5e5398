//! Bearer credentials for the prediction and storage APIs.
//!
//! Two metadata-server strategies are supported: an identity token minted for an audience, and
//! an OAuth access token for a scope. A static token can be configured for local runs. Any of
//! them can be wrapped in a [`TokenCache`].

use async_trait::async_trait;
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const SERVICE_ACCOUNT_PATH: &str = "computeMetadata/v1/instance/service-accounts/default";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Metadata server request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Metadata server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed token response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Token response did not contain a token")]
    MissingToken,
}

#[derive(Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub audience_or_scope: String,
    pub expiry: Option<SystemTime>,
}

impl Credential {
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// True when the credential will still be valid `skew` from now. Credentials without an
    /// expiry, or a skew past the end of time, are never considered fresh.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        match self.expiry {
            Some(expiry) => SystemTime::now()
                .checked_add(skew)
                .is_some_and(|deadline| deadline < expiry),
            None => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("audience_or_scope", &self.audience_or_scope)
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn acquire_token(&self) -> Result<Credential, AuthError>;
}

/// Identity token for a fixed audience, minted by the metadata server.
#[derive(Debug, Clone)]
pub struct IdentityTokenProvider {
    client: reqwest::Client,
    metadata_host: String,
    audience: String,
}

impl IdentityTokenProvider {
    pub fn new(client: reqwest::Client, metadata_host: &str, audience: &str) -> Self {
        Self {
            client,
            metadata_host: metadata_host.to_string(),
            audience: audience.to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for IdentityTokenProvider {
    #[instrument(skip(self), fields(audience = %self.audience))]
    async fn acquire_token(&self) -> Result<Credential, AuthError> {
        let url = format!(
            "{}/{}/identity?audience={}",
            metadata_base(&self.metadata_host),
            SERVICE_ACCOUNT_PATH,
            urlencoding::encode(&self.audience)
        );
        let body = metadata_get(&self.client, &url).await?;
        let token = String::from_utf8_lossy(&body).trim().to_string();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let expiry = jwt_expiry(&token);
        tracing::debug!("Acquired identity token, expiry known: {}", expiry.is_some());

        Ok(Credential {
            token,
            audience_or_scope: self.audience.clone(),
            expiry,
        })
    }
}

/// OAuth access token for a scope, issued by the metadata server.
#[derive(Debug, Clone)]
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    metadata_host: String,
    scope: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl MetadataTokenProvider {
    pub fn new(client: reqwest::Client, metadata_host: &str, scope: &str) -> Self {
        Self {
            client,
            metadata_host: metadata_host.to_string(),
            scope: scope.to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for MetadataTokenProvider {
    #[instrument(skip(self), fields(scope = %self.scope))]
    async fn acquire_token(&self) -> Result<Credential, AuthError> {
        let url = format!(
            "{}/{}/token?scopes={}",
            metadata_base(&self.metadata_host),
            SERVICE_ACCOUNT_PATH,
            urlencoding::encode(&self.scope)
        );
        let body = metadata_get(&self.client, &url).await?;
        let response: AccessTokenResponse = serde_json::from_slice(&body)?;

        let token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        // An unrepresentable lifetime is treated as an unknown one.
        let expiry = response
            .expires_in
            .and_then(|secs| SystemTime::now().checked_add(Duration::from_secs(secs)));

        Ok(Credential {
            token,
            audience_or_scope: self.scope.clone(),
            expiry,
        })
    }
}

/// Pre-issued token, e.g. the output of `gcloud auth print-access-token`.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn acquire_token(&self) -> Result<Credential, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(Credential {
            token: self.token.clone(),
            audience_or_scope: String::new(),
            expiry: None,
        })
    }
}

/// Shares the last credential between invocations until it is about to expire.
///
/// Readers take the read lock; a refresh takes the write lock and re-checks freshness so
/// concurrent invocations trigger a single exchange.
pub struct TokenCache<C: CredentialProvider> {
    inner: C,
    skew: Duration,
    cached: RwLock<Option<Credential>>,
}

impl<C: CredentialProvider> TokenCache<C> {
    pub fn new(inner: C, skew: Duration) -> Self {
        Self {
            inner,
            skew,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<C: CredentialProvider> CredentialProvider for TokenCache<C> {
    async fn acquire_token(&self) -> Result<Credential, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(self.skew)) {
                return Ok(credential.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(self.skew)) {
            return Ok(credential.clone());
        }

        let credential = self.inner.acquire_token().await?;
        *cached = credential
            .is_fresh(self.skew)
            .then(|| credential.clone());

        Ok(credential)
    }
}

fn metadata_base(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

async fn metadata_get(client: &reqwest::Client, url: &str) -> Result<bytes::Bytes, AuthError> {
    let response = client
        .get(url)
        .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
        .send()
        .await?;

    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(AuthError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(body)
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<u64>,
}

/// Reads the `exp` claim of a JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let claims = BASE64_URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&claims).ok()?;
    claims
        .exp
        .and_then(|exp| UNIX_EPOCH.checked_add(Duration::from_secs(exp)))
}
