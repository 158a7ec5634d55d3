//! Speech synthesis through the ElevenLabs text-to-speech API.

use crate::config::VoiceConfig;
use crate::error::{ProviderError, Result};
use crate::provider::{SpeechSynthesizer, VoiceProfile, read_bytes, require};

use async_trait::async_trait;

const PROVIDER: &str = "elevenlabs";

pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ElevenLabsClient {
    pub fn new(http: reqwest::Client, config: &VoiceConfig) -> Result<Self> {
        Ok(Self {
            http,
            api_key: require(&config.api_key, "voice.api_key")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn build_body(text: &str, voice: &VoiceProfile) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "model_id": voice.model_id,
        "voice_settings": {
            "style": voice.style,
            "use_speaker_boost": voice.use_speaker_boost,
            "similarity_boost": voice.similarity_boost,
            "stability": voice.stability,
        }
    })
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    #[tracing::instrument(skip_all, fields(voice_id = %voice.voice_id, chars = text.len()))]
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        let url = format!("{}/v1/text-to-speech/{}", self.base_url, voice.voice_id);

        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/mpeg")
            .json(&build_body(text, voice))
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let audio = read_bytes(PROVIDER, response).await?;
        if audio.is_empty() {
            return Err(ProviderError::payload(PROVIDER, "empty audio body"));
        }
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio)
    }
}
