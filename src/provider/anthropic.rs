//! Text generation through the Anthropic messages API.

use crate::config::LlmConfig;
use crate::error::{ProviderError, Result};
use crate::provider::{GenerationRequest, TextGenerator, read_json, require};

use async_trait::async_trait;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    messages_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            http,
            api_key: require(&config.api_key, "llm.api_key")?,
            messages_url: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

/// Request body for one user turn, images first.
fn build_body(model: &str, request: &GenerationRequest) -> serde_json::Value {
    let content = if request.images.is_empty() {
        serde_json::json!(request.prompt)
    } else {
        let mut blocks: Vec<serde_json::Value> = request
            .images
            .iter()
            .map(|image| {
                serde_json::json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.media_type,
                        "data": image.data_base64,
                    }
                })
            })
            .collect();
        blocks.push(serde_json::json!({"type": "text", "text": request.prompt}));
        serde_json::json!(blocks)
    };

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": [{"role": "user", "content": content}],
    });
    if let Some(system) = &request.system {
        body["system"] = serde_json::json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    body
}

/// Concatenate the text blocks of a messages response.
fn extract_text(body: &serde_json::Value) -> std::result::Result<String, ProviderError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::payload(PROVIDER, "response has no content array"))?;
    let text: String = blocks
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect();
    let text = text.trim();
    if text.is_empty() {
        return Err(ProviderError::payload(PROVIDER, "response contained no text"));
    }
    Ok(text.to_string())
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    #[tracing::instrument(skip_all, fields(model = %self.model, max_tokens = request.max_tokens, images = request.images.len()))]
    async fn generate(&self, request: GenerationRequest) -> std::result::Result<String, ProviderError> {
        let body = build_body(&self.model, &request);

        let response = self
            .http
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let response_body = read_json(PROVIDER, response).await?;
        let text = extract_text(&response_body)?;
        tracing::debug!(chars = text.len(), "generated text");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImageInput;

    #[test]
    fn text_only_request_uses_plain_content() {
        let request = GenerationRequest::new("gm", 80)
            .with_system("You are Lea.")
            .with_temperature(Some(0.8));
        let body = build_body("claude-test", &request);

        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["max_tokens"], 80);
        assert_eq!(body["system"], "You are Lea.");
        assert_eq!(body["messages"][0]["content"], "gm");
        assert!((body["temperature"].as_f64().unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn image_request_puts_images_before_text() {
        let request = GenerationRequest::new("describe", 1000).with_image(ImageInput {
            media_type: "image/jpeg".into(),
            data_base64: "aGk=".into(),
        });
        let body = build_body("claude-test", &request);
        let content = &body["messages"][0]["content"];

        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["data"], "aGk=");
        assert_eq!(content[1]["text"], "describe");
        assert!(body.get("system").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn extracts_and_trims_text_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "  Hello "},
                {"type": "text", "text": "there\n"}
            ]
        });
        assert_eq!(extract_text(&body).unwrap(), "Hello there");

        let empty = serde_json::json!({"content": []});
        assert!(matches!(extract_text(&empty), Err(ProviderError::Payload { .. })));
    }
}
