//! HTTP client for the manifest-log API.
//!
//! The CLI uses this to talk to a running server. Configuration is via
//! environment variables:
//! - `MANIFEST_LOG_URL` - Base URL (default: `http://localhost:17010/api/v1`)
//! - `MANIFEST_LOG_API_KEY` - API key for authentication (optional for local)

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::api::middleware::API_KEY_ENV;
use crate::models::*;

pub const URL_ENV: &str = "MANIFEST_LOG_URL";

/// Default URL for local development.
pub const DEFAULT_URL: &str = "http://localhost:17010/api/v1";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: API key required or invalid")]
    Unauthorized,

    #[error("Server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone)]
pub struct ManifestClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl ManifestClient {
    pub fn from_env() -> Self {
        let base_url = std::env::var(URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string());
        let api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::status_error(status, response).await)
        }
    }

    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<(), ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(status, response).await)
        }
    }

    async fn status_error(status: StatusCode, response: reqwest::Response) -> ClientError {
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => ClientError::NotFound(body),
            StatusCode::BAD_REQUEST => ClientError::BadRequest(body),
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
            _ => ClientError::Server(format!("{}: {}", status, body)),
        }
    }

    // ============================================================
    // Manifest Operations
    // ============================================================

    pub async fn list_manifests(&self) -> Result<Vec<Manifest>, ClientError> {
        let response = self
            .request(reqwest::Method::GET, "/manifests")
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Get a manifest with its full release history.
    pub async fn get_manifest(&self, id: Uuid) -> Result<ManifestWithReleases, ClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/manifests/{}", id))
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn create_manifest(
        &self,
        input: &CreateManifestInput,
    ) -> Result<ManifestWithReleases, ClientError> {
        let response = self
            .request(reqwest::Method::POST, "/manifests")
            .json(input)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn update_manifest(
        &self,
        id: Uuid,
        input: &UpdateManifestInput,
    ) -> Result<Manifest, ClientError> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/manifests/{}", id))
            .json(input)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn delete_manifest(&self, id: Uuid) -> Result<(), ClientError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/manifests/{}", id))
            .send()
            .await?;
        self.handle_empty_response(response).await
    }

    // ============================================================
    // Release Operations
    // ============================================================

    pub async fn release(
        &self,
        id: Uuid,
        input: &ReleaseInput,
    ) -> Result<ReleaseOutcome, ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/manifests/{}/releases", id))
            .json(input)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn get_release(&self, id: Uuid, version: u32) -> Result<Release, ClientError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/manifests/{}/releases/{}", id, version),
            )
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn get_latest_release(&self, id: Uuid) -> Result<Release, ClientError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/manifests/{}/releases/latest", id),
            )
            .send()
            .await?;
        self.handle_response(response).await
    }

    // ============================================================
    // Fork / Follow Operations
    // ============================================================

    pub async fn fork(
        &self,
        id: Uuid,
        input: &CreateManifestInput,
    ) -> Result<ManifestWithReleases, ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/manifests/{}/fork", id))
            .json(input)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn add_follower(
        &self,
        id: Uuid,
        input: &CreateManifestInput,
    ) -> Result<ManifestWithReleases, ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/manifests/{}/followers", id))
            .json(input)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn list_followers(&self, id: Uuid) -> Result<Vec<Manifest>, ClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/manifests/{}/followers", id))
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn unfollow(&self, id: Uuid) -> Result<Manifest, ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/manifests/{}/unfollow", id))
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn sync_follower(&self, id: Uuid) -> Result<ReleaseOutcome, ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/manifests/{}/sync", id))
            .send()
            .await?;
        self.handle_response(response).await
    }
}
