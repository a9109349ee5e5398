use crate::{
    credentials::{AuthError, CredentialProvider},
    retry::Transient,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage location: bucket={bucket:?}, object={name:?}")]
    InvalidLocation { bucket: String, name: String },
    #[error("Object gs://{bucket}/{name} not found")]
    NotFound { bucket: String, name: String },
    #[error("Permission denied ({status}): {body}")]
    PermissionDenied { status: u16, body: String },
    #[error("Storage request failed with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Storage credentials unavailable: {0}")]
    Auth(#[from] AuthError),
    #[error("Malformed storage response: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        match self {
            StorageError::Transport(_) => true,
            StorageError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Bytes, StorageError>;

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn put(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        content: Bytes,
    ) -> Result<(), StorageError>;
}

/// Google Cloud Storage through its JSON API.
pub struct GcsObjectStore {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsObjectStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn authorization(&self) -> Result<String, StorageError> {
        Ok(self.credentials.acquire_token().await?.bearer())
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    #[instrument(skip(self))]
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Bytes, StorageError> {
        if bucket.is_empty() || name.is_empty() {
            return Err(StorageError::InvalidLocation {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }

        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.base_url,
            urlencoding::encode(bucket),
            urlencoding::encode(name)
        );
        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, self.authorization().await?)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }
        let body = response.bytes().await?;
        check_status(status, &body)?;

        tracing::debug!("Fetched {} bytes", body.len());
        Ok(body)
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let authorization = self.authorization().await?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let response = self
                .client
                .get(&url)
                .query(&query)
                .header(header::AUTHORIZATION, &authorization)
                .send()
                .await?;
            let status = response.status();
            let body = response.bytes().await?;
            check_status(status, &body)?;

            let page: ObjectList = serde_json::from_slice(&body)?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!("Listed {} objects", names.len());
        Ok(names)
    }

    #[instrument(skip(self, content), fields(size = content.len()))]
    async fn put(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let response = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(header::AUTHORIZATION, self.authorization().await?)
            .header(header::CONTENT_TYPE, content_type)
            .body(content)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        check_status(status, &body)
    }
}

fn check_status(status: StatusCode, body: &[u8]) -> Result<(), StorageError> {
    if status.is_success() {
        return Ok(());
    }
    let body = String::from_utf8_lossy(body).into_owned();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StorageError::PermissionDenied {
            status: status.as_u16(),
            body,
        }),
        _ => Err(StorageError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenProvider;
    use httpmock::prelude::*;

    fn store(server: &MockServer) -> GcsObjectStore {
        GcsObjectStore::new(
            reqwest::Client::new(),
            &server.base_url(),
            Arc::new(StaticTokenProvider::new("tok")),
        )
    }

    #[tokio::test]
    async fn test_fetch_returns_object_bytes() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/storage/v1/b/b/o/")
                .path_contains("img1.jpg")
                .query_param("alt", "media")
                .header("authorization", "Bearer tok");
            then.status(200).body([0xff_u8, 0xd8, 0xff, 0xe0]);
        });

        let bytes = store(&server).fetch("b", "apples/img1.jpg").await.unwrap();

        mock.assert();
        assert_eq!(bytes.as_ref(), &[0xff, 0xd8, 0xff, 0xe0]);
    }

    #[tokio::test]
    async fn test_fetch_missing_object() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(404).body("No such object");
        });

        let err = store(&server).fetch("b", "missing.jpg").await.unwrap_err();

        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_permission_denied() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(403).body("denied");
        });

        let err = store(&server).fetch("b", "img.jpg").await.unwrap_err();

        assert!(matches!(err, StorageError::PermissionDenied { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_transient() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(503).body("backend unavailable");
        });

        let err = store(&server).fetch("b", "img.jpg").await.unwrap_err();

        assert!(matches!(err, StorageError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_rejects_empty_location() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.any_request();
            then.status(200);
        });

        let err = store(&server).fetch("", "img.jpg").await.unwrap_err();

        assert!(matches!(err, StorageError::InvalidLocation { .. }));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let server = MockServer::start_async().await;
        // Registered first so the follow-up request carrying the page token lands here.
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/storage/v1/b/b/o")
                .query_param("pageToken", "p2");
            then.status(200).body(r#"{"items":[{"name":"apples/3.jpg"}]}"#);
        });
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/storage/v1/b/b/o")
                .query_param("prefix", "apples/");
            then.status(200).body(
                r#"{"items":[{"name":"apples/1.jpg"},{"name":"apples/2.jpg"}],"nextPageToken":"p2"}"#,
            );
        });

        let names = store(&server).list("b", "apples/").await.unwrap();

        first.assert();
        second.assert();
        assert_eq!(names, vec!["apples/1.jpg", "apples/2.jpg", "apples/3.jpg"]);
    }

    #[tokio::test]
    async fn test_list_empty_prefix() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/storage/v1/b/b/o");
            then.status(200).body(r#"{"kind":"storage#objects"}"#);
        });

        let names = store(&server).list("b", "tomatoes/").await.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_put_uploads_media() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/upload/storage/v1/b/dest/o")
                .query_param("uploadType", "media")
                .query_param("name", "apples/img1.jpg.json")
                .header("content-type", "application/json")
                .body(r#"{"label":"apple"}"#);
            then.status(200).body(r#"{"name":"apples/img1.jpg.json"}"#);
        });

        store(&server)
            .put(
                "dest",
                "apples/img1.jpg.json",
                "application/json",
                Bytes::from_static(br#"{"label":"apple"}"#),
            )
            .await
            .unwrap();

        mock.assert();
    }
}
