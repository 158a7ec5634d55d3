//! Talking-head avatar rendering through the Movement project API.

use crate::BoundingBox;
use crate::config::AvatarConfig;
use crate::error::{ProviderError, Result};
use crate::pipeline::PollStatus;
use crate::provider::{AvatarRenderer, JobId, read_json, require};

use async_trait::async_trait;

const PROVIDER: &str = "movement";

pub struct MovementClient {
    http: reqwest::Client,
    token: String,
    create_url: String,
    project_url: String,
}

impl MovementClient {
    pub fn new(http: reqwest::Client, config: &AvatarConfig) -> Result<Self> {
        Ok(Self {
            http,
            token: require(&config.api_key, "avatar.api_key")?,
            create_url: require(&config.create_url, "avatar.create_url")?,
            project_url: require(&config.project_url, "avatar.project_url")?
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

fn build_body(photo_url: &str, audio_url: &str, bounding_box: BoundingBox) -> serde_json::Value {
    serde_json::json!({
        "photoUrl": photo_url,
        "info": [{"audioUrl": audio_url, "box": bounding_box.as_array()}],
        "watermark": 0,
        "useSr": false,
    })
}

/// Interpret a project lookup: an empty or missing `videoUrl` means the render
/// is still running.
fn project_status(body: &serde_json::Value) -> PollStatus<String> {
    match body["data"]["videoUrl"].as_str() {
        Some(url) if !url.is_empty() => PollStatus::Ready(url.to_string()),
        _ => PollStatus::Pending,
    }
}

fn project_id(body: &serde_json::Value) -> Option<String> {
    match &body["data"]["id"] {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl AvatarRenderer for MovementClient {
    #[tracing::instrument(skip_all, fields(audio_url = %audio_url))]
    async fn create_job(
        &self,
        photo_url: &str,
        audio_url: &str,
        bounding_box: BoundingBox,
    ) -> std::result::Result<JobId, ProviderError> {
        let response = self
            .http
            .post(&self.create_url)
            .header("movement_token", &self.token)
            .json(&build_body(photo_url, audio_url, bounding_box))
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        let id = project_id(&body)
            .ok_or_else(|| ProviderError::payload(PROVIDER, "create response has no data.id"))?;
        tracing::info!(project_id = %id, "avatar render started");
        Ok(JobId(id))
    }

    async fn poll_result(&self, job: &JobId) -> std::result::Result<PollStatus<String>, ProviderError> {
        let response = self
            .http
            .get(format!("{}/{}", self.project_url, job))
            .header("movement_token", &self.token)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        Ok(project_status(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_matches_project_format() {
        let body = build_body("https://img/p.png", "https://cdn/a.mp3", BoundingBox::default());

        assert_eq!(body["photoUrl"], "https://img/p.png");
        assert_eq!(body["info"][0]["audioUrl"], "https://cdn/a.mp3");
        assert_eq!(body["info"][0]["box"], serde_json::json!([444, 131, 733, 478]));
        assert_eq!(body["watermark"], 0);
        assert_eq!(body["useSr"], false);
    }

    #[test]
    fn project_status_waits_for_video_url() {
        let pending = serde_json::json!({"data": {"id": "p1", "videoUrl": null}});
        assert_eq!(project_status(&pending), PollStatus::Pending);

        let empty = serde_json::json!({"data": {"id": "p1", "videoUrl": ""}});
        assert_eq!(project_status(&empty), PollStatus::Pending);

        let ready = serde_json::json!({"data": {"videoUrl": "https://cdn/v.mp4"}});
        assert_eq!(
            project_status(&ready),
            PollStatus::Ready("https://cdn/v.mp4".into())
        );
    }

    #[test]
    fn project_id_accepts_strings_and_numbers() {
        assert_eq!(project_id(&serde_json::json!({"data": {"id": "abc"}})).as_deref(), Some("abc"));
        assert_eq!(project_id(&serde_json::json!({"data": {"id": 42}})).as_deref(), Some("42"));
        assert_eq!(project_id(&serde_json::json!({"data": {}})), None);
    }
}
