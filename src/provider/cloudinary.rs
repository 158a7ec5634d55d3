//! Media hosting on Cloudinary, and plain HTTP retrieval of remote media.

use crate::MediaKind;
use crate::config::MediaConfig;
use crate::error::{ProviderError, Result};
use crate::provider::{MediaStore, read_bytes, read_json, require};

use async_trait::async_trait;
use futures::StreamExt as _;
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncWriteExt as _;

use std::path::Path;

const PROVIDER: &str = "cloudinary";

pub struct CloudinaryClient {
    http: reqwest::Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl CloudinaryClient {
    pub fn new(http: reqwest::Client, config: &MediaConfig) -> Result<Self> {
        Ok(Self {
            http,
            cloud_name: require(&config.cloud_name, "media.cloud_name")?,
            api_key: require(&config.api_key, "media.api_key")?,
            api_secret: require(&config.api_secret, "media.api_secret")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn upload_url(&self) -> String {
        format!("{}/v1_1/{}/auto/upload", self.base_url, self.cloud_name)
    }
}

/// Signed upload parameters are sorted `key=value` pairs joined by `&`,
/// followed by the secret, hashed with SHA-1.
fn sign(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl MediaStore for CloudinaryClient {
    #[tracing::instrument(skip_all, fields(kind = kind.as_str(), bytes = bytes.len()))]
    async fn upload(&self, bytes: Vec<u8>, kind: MediaKind) -> std::result::Result<String, ProviderError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(&[("timestamp", timestamp.as_str())], &self.api_secret);

        let file = reqwest::multipart::Part::bytes(bytes)
            .file_name(format!("persona_{}.{}", kind.as_str(), kind.extension()));
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("api_key", self.api_key.clone())
            .text("timestamp", timestamp)
            .text("signature", signature);

        let response = self
            .http
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        let url = body["secure_url"]
            .as_str()
            .ok_or_else(|| ProviderError::payload(PROVIDER, "upload response has no secure_url"))?;
        tracing::debug!(%url, "media uploaded");
        Ok(url.to_string())
    }

    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, ProviderError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| ProviderError::request("media fetch", error))?;
        read_bytes("media fetch", response).await
    }

    #[tracing::instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<u64, ProviderError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| ProviderError::request("media download", error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: "media download",
                status: status.as_u16(),
                message: format!("GET {url}"),
            });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|error| ProviderError::Artifact(format!("failed to create {}: {error}", dest.display())))?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| ProviderError::request("media download", error))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| ProviderError::Artifact(format!("failed to write {}: {error}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|error| ProviderError::Artifact(format!("failed to flush {}: {error}", dest.display())))?;

        tracing::debug!(bytes = written, "media downloaded");
        Ok(written)
    }
}
