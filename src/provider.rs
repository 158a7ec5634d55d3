//! Capability interfaces for external providers, plus the HTTP plumbing the
//! concrete adapters share.

pub mod anthropic;
pub mod cloudinary;
pub mod elevenlabs;
pub mod movement;
pub mod subtitles;

use crate::config::{Config, VoiceConfig};
use crate::error::{ConfigError, ProviderError, Result};
use crate::pipeline::PollStatus;
use crate::prompts::PromptEngine;
use crate::transcript::TimedWord;
use crate::{BoundingBox, MediaKind};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// An image passed inline to a vision-capable generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub media_type: String,
    pub data_base64: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub images: Vec<ImageInput>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens,
            temperature: None,
            images: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, request: GenerationRequest) -> std::result::Result<String, ProviderError>;
}

/// Voice parameters sent with every synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub voice_id: String,
    pub model_id: String,
    pub style: f32,
    pub stability: f32,
    pub similarity_boost: f32,
    pub use_speaker_boost: bool,
}

impl VoiceProfile {
    pub fn from_config(config: &VoiceConfig) -> Result<Self> {
        let voice_id = config
            .voice_id
            .clone()
            .ok_or_else(|| ConfigError::MissingKey("voice.voice_id".into()))?;
        Ok(Self {
            voice_id,
            model_id: config.model_id.clone(),
            style: config.style,
            stability: config.stability,
            similarity_boost: config.similarity_boost,
            use_speaker_boost: config.use_speaker_boost,
        })
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Returns encoded audio (mp3).
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<Vec<u8>, ProviderError>;
}

/// Hosting for generated media, and retrieval of remote media.
#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    /// Upload and return a publicly reachable URL.
    async fn upload(&self, bytes: Vec<u8>, kind: MediaKind) -> std::result::Result<String, ProviderError>;

    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, ProviderError>;

    /// Stream `url` into `dest`, returning the byte count.
    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<u64, ProviderError>;
}

/// Provider-assigned id of an asynchronous job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait AvatarRenderer: Send + Sync + 'static {
    async fn create_job(
        &self,
        photo_url: &str,
        audio_url: &str,
        bounding_box: BoundingBox,
    ) -> std::result::Result<JobId, ProviderError>;

    /// One status check; `Ready` carries the rendered video URL.
    async fn poll_result(&self, job: &JobId) -> std::result::Result<PollStatus<String>, ProviderError>;
}

/// A video held by the transcription/caption provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVideo {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub video: RemoteVideo,
    pub words: Vec<TimedWord>,
}

#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Upload `video` and return its word timeline once transcription finishes.
    async fn transcribe(&self, video: &Path) -> std::result::Result<Transcription, ProviderError>;

    /// Re-spell `words` to match `reference`, keeping the original timing.
    async fn correct(
        &self,
        words: &[TimedWord],
        reference: &str,
    ) -> std::result::Result<Vec<TimedWord>, ProviderError>;
}

#[async_trait]
pub trait CaptionBurner: Send + Sync + 'static {
    async fn create_job(
        &self,
        video: &RemoteVideo,
        words: &[TimedWord],
    ) -> std::result::Result<JobId, ProviderError>;

    /// One status check; `Ready` carries the captioned video URL.
    async fn poll_result(
        &self,
        video: &RemoteVideo,
        job: &JobId,
    ) -> std::result::Result<PollStatus<String>, ProviderError>;
}

/// Every capability the pipeline needs, behind trait objects.
#[derive(Clone)]
pub struct Providers {
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub media: Arc<dyn MediaStore>,
    pub avatar: Arc<dyn AvatarRenderer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub captions: Arc<dyn CaptionBurner>,
}

impl Providers {
    /// Build the HTTP adapters from configuration.
    pub fn from_config(config: &Config, prompts: Arc<PromptEngine>) -> Result<Self> {
        let http = http_client(Duration::from_secs(config.llm.timeout_secs))?;

        let text: Arc<dyn TextGenerator> =
            Arc::new(anthropic::AnthropicClient::new(http.clone(), &config.llm)?);
        let speech = Arc::new(elevenlabs::ElevenLabsClient::new(http.clone(), &config.voice)?);
        let media = Arc::new(cloudinary::CloudinaryClient::new(http.clone(), &config.media)?);
        let avatar = Arc::new(movement::MovementClient::new(http.clone(), &config.avatar)?);
        let subtitles = Arc::new(subtitles::SubtitlesClient::new(
            http,
            &config.captions,
            text.clone(),
            prompts,
            config.llm.correction_max_tokens,
        )?);

        Ok(Self {
            text,
            speech,
            media,
            avatar,
            transcriber: subtitles.clone(),
            captions: subtitles,
        })
    }
}

/// Shared HTTP client for provider and platform calls.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    Ok(client)
}

pub(crate) fn require(value: &Option<String>, key: &str) -> Result<String> {
    value
        .clone()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
}

/// Cut a response body for inclusion in an error message.
pub(crate) fn truncate_body(body: &str) -> &str {
    const LIMIT: usize = 500;
    match body.char_indices().nth(LIMIT) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}

/// Read a JSON response, mapping transport, status and parse failures.
///
/// Non-success statuses are reported with the provider's own error message
/// when the body carries one.
pub(crate) async fn read_json(
    provider: &'static str,
    response: reqwest::Response,
) -> std::result::Result<serde_json::Value, ProviderError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|error| ProviderError::request(provider, format!("failed to read response body: {error}")))?;

    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|body| error_message(&body))
            .unwrap_or_else(|| truncate_body(&text).to_string());
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&text).map_err(|error| {
        ProviderError::payload(
            provider,
            format!("response ({status}) is not valid JSON: {error}\nBody: {}", truncate_body(&text)),
        )
    })
}

/// Read a binary response body, mapping non-success statuses.
pub(crate) async fn read_bytes(
    provider: &'static str,
    response: reqwest::Response,
) -> std::result::Result<Vec<u8>, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            message: truncate_body(&text).to_string(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|error| ProviderError::request(provider, format!("failed to read response body: {error}")))?;
    Ok(bytes.to_vec())
}

fn error_message(body: &serde_json::Value) -> Option<String> {
    let candidates = [
        &body["error"]["message"],
        &body["detail"]["message"],
        &body["detail"],
        &body["message"],
        &body["error"],
    ];
    candidates
        .into_iter()
        .find_map(|value| value.as_str().map(str::to_string))
}
