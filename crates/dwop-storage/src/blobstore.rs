//! [`BlobStore`] and its Supabase Storage REST implementation.

use async_trait::async_trait;
use dwop_core::model::SIGNED_URL_TTL_SECS;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::url::normalize_url;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(String),
    #[error("storage API returned an error response: {0}")]
    Response(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Request(err.to_string())
    }
}

/// Object storage operations the parser and job executor need. `upload`
/// persists a blob; the two `signed_*_url` methods mint time-limited URLs
/// with [`SIGNED_URL_TTL_SECS`] (the single TTL constant every bucket
/// shares).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
    async fn signed_download_url(&self, bucket: &str, path: &str) -> Result<String, StorageError>;
    async fn signed_upload_url(&self, bucket: &str, path: &str) -> Result<String, StorageError>;
}

#[derive(Serialize)]
struct SignRequest {
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// `BlobStore` over the Supabase Storage REST API
/// (`<project_url>/storage/v1/object/...`). Authenticated with the
/// project's service-role key.
pub struct SupabaseBlobStore {
    client: reqwest::Client,
    project_url: String,
    service_key: String,
}

impl SupabaseBlobStore {
    pub fn new(project_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            project_url: project_url.into(),
            service_key: service_key.into(),
        }
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{bucket}/{path}",
            self.project_url.trim_end_matches('/')
        )
    }

    fn sign_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/sign/{bucket}/{path}",
            self.project_url.trim_end_matches('/')
        )
    }

    async fn mint_signed_url(&self, bucket: &str, path: &str) -> Result<String, StorageError> {
        let resp = self
            .client
            .post(self.sign_url(bucket, path))
            .bearer_auth(&self.service_key)
            .json(&SignRequest {
                expires_in: SIGNED_URL_TTL_SECS,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Response(format!("{status}: {body}")));
        }

        let parsed: SignResponse = resp.json().await?;
        Ok(normalize_url(&self.project_url, &parsed.signed_url))
    }
}

#[async_trait]
impl BlobStore for SupabaseBlobStore {
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let resp = self
            .client
            .post(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Response(format!("{status}: {body}")));
        }

        let link = format!("{bucket}/{path}");
        debug!(%link, "uploaded blob");
        Ok(link)
    }

    #[instrument(skip(self))]
    async fn signed_download_url(&self, bucket: &str, path: &str) -> Result<String, StorageError> {
        self.mint_signed_url(bucket, path).await
    }

    #[instrument(skip(self))]
    async fn signed_upload_url(&self, bucket: &str, path: &str) -> Result<String, StorageError> {
        // Supabase's sign endpoint mints a URL usable for both GET and PUT
        // against the same object; the orchestrator only cares which
        // bucket/path it points at.
        self.mint_signed_url(bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_join_has_no_double_slash() {
        let store = SupabaseBlobStore::new("https://proj.supabase.co/", "key");
        assert_eq!(
            store.object_url("Task_Code", "abc/code"),
            "https://proj.supabase.co/storage/v1/object/Task_Code/abc/code"
        );
    }

    #[test]
    fn sign_url_targets_the_sign_subpath() {
        let store = SupabaseBlobStore::new("https://proj.supabase.co", "key");
        assert_eq!(
            store.sign_url("Workflow_Env", "wf/env"),
            "https://proj.supabase.co/storage/v1/object/sign/Workflow_Env/wf/env"
        );
    }
}
