//! Secret Manager backed store
//!
//! Talks to a Google Secret Manager compatible REST API. Each key becomes one
//! secret; writes add a new secret version and reads access `latest`.
//!
//! # Requests
//!
//! ```text
//! get     GET  /v1/projects/{project}/secrets/{id}/versions/latest:access
//! put     POST /v1/projects/{project}/secrets/{id}:addVersion
//!         POST /v1/projects/{project}/secrets?secretId={id}   (on 404, then retry)
//! delete  unsupported
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

use super::{BackingStore, BoxError, StoreError};

/// Public Secret Manager endpoint
pub const DEFAULT_BASE_URL: &str = "https://secretmanager.googleapis.com";

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies bearer tokens for Secret Manager requests
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, BoxError>;
}

/// A fixed bearer token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, BoxError> {
        Ok(self.0.clone())
    }
}

#[derive(Error, Debug)]
enum ApiError {
    #[error("secret manager returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("secret payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: SecretPayload,
}

#[derive(Serialize, Deserialize)]
struct SecretPayload {
    data: String,
}

#[derive(Serialize)]
struct AddVersionRequest {
    payload: SecretPayload,
}

/// Store keeping each key in its own secret
pub struct SecretManagerStore {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
    project: String,
    prefix: String,
}

impl SecretManagerStore {
    /// Create a store for `project`, naming secrets `<prefix><key>`
    pub fn new(
        project: impl Into<String>,
        prefix: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, StoreError> {
        Self::with_options(
            project,
            prefix,
            tokens,
            DEFAULT_BASE_URL,
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Create a store with an explicit endpoint and request timeout
    pub fn with_options(
        project: impl Into<String>,
        prefix: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::backing("connect", "", e))?;

        let store = Self {
            client,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            prefix: prefix.into(),
        };

        info!(
            project = %store.project,
            prefix = %store.prefix,
            timeout_secs = request_timeout.as_secs(),
            "Initialized secret manager store"
        );
        Ok(store)
    }

    /// Secret id used for `key`
    ///
    /// Secret ids only allow `[A-Za-z0-9_-]`, everything else maps to `_`.
    pub fn secret_id(&self, key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, sanitized)
    }

    fn secrets_url(&self) -> String {
        format!("{}/v1/projects/{}/secrets", self.base_url, self.project)
    }

    async fn bearer(&self, op: &'static str, key: &str) -> Result<String, StoreError> {
        self.tokens
            .token()
            .await
            .map_err(|e| StoreError::backing(op, key, e))
    }

    async fn add_version(
        &self,
        key: &str,
        id: &str,
        token: &str,
        data: &str,
    ) -> Result<reqwest::Response, StoreError> {
        let body = AddVersionRequest {
            payload: SecretPayload {
                data: data.to_string(),
            },
        };
        self.client
            .post(format!("{}/{}:addVersion", self.secrets_url(), id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::backing("put", key, e))
    }

    async fn create_secret(&self, key: &str, id: &str, token: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.secrets_url())
            .query(&[("secretId", id)])
            .bearer_auth(token)
            .json(&serde_json::json!({ "replication": { "automatic": {} } }))
            .send()
            .await
            .map_err(|e| StoreError::backing("put", key, e))?;

        // A concurrent writer may have created it first
        if response.status() == StatusCode::CONFLICT {
            trace!(secret = %id, "Secret already exists");
            return Ok(());
        }
        check_status("put", key, response).await?;

        info!(secret = %id, "Created secret");
        Ok(())
    }
}

async fn check_status(
    op: &'static str,
    key: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::backing(op, key, ApiError::Status { status, body }))
}

impl fmt::Debug for SecretManagerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretManagerStore")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl BackingStore for SecretManagerStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let id = self.secret_id(key);
        let token = self.bearer("get", key).await?;

        let response = self
            .client
            .get(format!("{}/{}/versions/latest:access", self.secrets_url(), id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StoreError::backing("get", key, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            trace!(secret = %id, "Secret not found");
            return Err(StoreError::CacheMiss);
        }
        let response = check_status("get", key, response).await?;

        let access: AccessResponse = response
            .json()
            .await
            .map_err(|e| StoreError::backing("get", key, e))?;
        let data = STANDARD
            .decode(access.payload.data.as_bytes())
            .map_err(|e| StoreError::backing("get", key, ApiError::from(e)))?;

        debug!(secret = %id, bytes = data.len(), "Fetched secret");
        Ok(data)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let id = self.secret_id(key);
        let token = self.bearer("put", key).await?;
        let encoded = STANDARD.encode(data);

        let mut response = self.add_version(key, &id, &token, &encoded).await?;
        if response.status() == StatusCode::NOT_FOUND {
            self.create_secret(key, &id, &token).await?;
            response = self.add_version(key, &id, &token, &encoded).await?;
        }
        check_status("put", key, response).await?;

        debug!(secret = %id, bytes = data.len(), "Added secret version");
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported {
            op: "delete",
            store: "secret manager",
        })
    }
}
