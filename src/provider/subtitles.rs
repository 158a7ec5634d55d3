//! Transcription and burned-in captions through the subtitles.ai video API.
//!
//! A video is uploaded once; the transcription task and the caption task are
//! both created against that upload.

use crate::config::CaptionConfig;
use crate::error::{ProviderError, Result};
use crate::pipeline::{PollConfig, PollStatus, poll_until_ready};
use crate::prompts::PromptEngine;
use crate::provider::{
    CaptionBurner, JobId, RemoteVideo, TextGenerator, Transcriber, Transcription, read_json,
};
use crate::transcript::{self, TimedWord};

use async_trait::async_trait;

use std::path::Path;
use std::sync::Arc;

const PROVIDER: &str = "subtitles";

pub struct SubtitlesClient {
    http: reqwest::Client,
    api_key: String,
    template_id: String,
    language: String,
    base_url: String,
    transcription_poll: PollConfig,
    corrector: Arc<dyn TextGenerator>,
    prompts: Arc<PromptEngine>,
    correction_max_tokens: u32,
}

impl SubtitlesClient {
    pub fn new(
        http: reqwest::Client,
        config: &CaptionConfig,
        corrector: Arc<dyn TextGenerator>,
        prompts: Arc<PromptEngine>,
        correction_max_tokens: u32,
    ) -> Result<Self> {
        // Credentials are checked on first use: front-ends without captions
        // never call this client.
        Ok(Self {
            http,
            api_key: config.api_key.clone().unwrap_or_default(),
            template_id: config.template_id.clone().unwrap_or_default(),
            language: config.language.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            transcription_poll: config.transcription_poll,
            corrector,
            prompts,
            correction_max_tokens,
        })
    }

    fn task_url(&self, video: &RemoteVideo) -> String {
        format!("{}/videos/{}/task", self.base_url, video.id)
    }

    async fn upload(&self, path: &Path) -> std::result::Result<RemoteVideo, ProviderError> {
        let bytes = tokio::fs::read(path).await.map_err(|error| {
            ProviderError::Artifact(format!("failed to read {}: {error}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".into());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/videos", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        let id = body["id"]
            .as_str()
            .ok_or_else(|| ProviderError::payload(PROVIDER, "upload response has no id"))?;
        tracing::debug!(video_id = %id, "video uploaded for captioning");
        Ok(RemoteVideo { id: id.to_string() })
    }

    async fn create_task(
        &self,
        video: &RemoteVideo,
        body: serde_json::Value,
    ) -> std::result::Result<JobId, ProviderError> {
        let response = self
            .http
            .post(self.task_url(video))
            .header("X-Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        body["taskId"]
            .as_str()
            .map(|id| JobId(id.to_string()))
            .ok_or_else(|| ProviderError::payload(PROVIDER, "task response has no taskId"))
    }

    async fn task_status(
        &self,
        video: &RemoteVideo,
        job: &JobId,
    ) -> std::result::Result<PollStatus<Option<String>>, ProviderError> {
        let response = self
            .http
            .get(format!("{}/{}", self.task_url(video), job))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        Ok(parse_task_status(&body))
    }

    async fn fetch_transcript(
        &self,
        video: &RemoteVideo,
        job: &JobId,
    ) -> std::result::Result<Vec<TimedWord>, ProviderError> {
        let response = self
            .http
            .get(format!("{}/{}/transcript", self.task_url(video), job))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|error| ProviderError::request(PROVIDER, error))?;

        let body = read_json(PROVIDER, response).await?;
        serde_json::from_value(body)
            .map_err(|error| ProviderError::payload(PROVIDER, format!("malformed transcript: {error}")))
    }
}

fn parse_task_status(body: &serde_json::Value) -> PollStatus<Option<String>> {
    let status = body["status"].as_str().unwrap_or_default().to_lowercase();
    match status.as_str() {
        "completed" => PollStatus::Ready(
            body["downloadUrl"]
                .as_str()
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        ),
        "failed" | "error" => PollStatus::Failed(format!("task status {status}")),
        _ => PollStatus::Pending,
    }
}

#[async_trait]
impl Transcriber for SubtitlesClient {
    #[tracing::instrument(skip_all, fields(video = %video.display()))]
    async fn transcribe(&self, video: &Path) -> std::result::Result<Transcription, ProviderError> {
        if self.api_key.is_empty() || self.template_id.is_empty() {
            return Err(ProviderError::payload(
                PROVIDER,
                "captions.api_key and captions.template_id must be set",
            ));
        }
        let remote = self.upload(video).await?;
        let job = self
            .create_task(
                &remote,
                serde_json::json!({
                    "templateId": self.template_id,
                    "language": self.language,
                    "autoApprove": true,
                }),
            )
            .await?;

        poll_until_ready("transcription", self.transcription_poll, |_| {
            self.task_status(&remote, &job)
        })
        .await?;

        let words = self.fetch_transcript(&remote, &job).await?;
        if words.is_empty() {
            return Err(ProviderError::payload(PROVIDER, "transcript is empty"));
        }
        tracing::debug!(words = words.len(), "transcript ready");
        Ok(Transcription {
            video: remote,
            words,
        })
    }

    async fn correct(
        &self,
        words: &[TimedWord],
        reference: &str,
    ) -> std::result::Result<Vec<TimedWord>, ProviderError> {
        transcript::correct_with_generator(
            self.corrector.as_ref(),
            &self.prompts,
            words,
            reference,
            self.correction_max_tokens,
        )
        .await
    }
}

#[async_trait]
impl CaptionBurner for SubtitlesClient {
    #[tracing::instrument(skip_all, fields(video_id = %video.id, words = words.len()))]
    async fn create_job(
        &self,
        video: &RemoteVideo,
        words: &[TimedWord],
    ) -> std::result::Result<JobId, ProviderError> {
        self.create_task(
            video,
            serde_json::json!({
                "templateId": self.template_id,
                "transcript": words,
                "autoApprove": true,
                "language": self.language,
            }),
        )
        .await
    }

    async fn poll_result(
        &self,
        video: &RemoteVideo,
        job: &JobId,
    ) -> std::result::Result<PollStatus<String>, ProviderError> {
        Ok(match self.task_status(video, job).await? {
            PollStatus::Ready(Some(url)) => PollStatus::Ready(url),
            PollStatus::Ready(None) => {
                PollStatus::Failed("caption task completed without a download url".into())
            }
            PollStatus::Pending => PollStatus::Pending,
            PollStatus::Failed(reason) => PollStatus::Failed(reason),
        })
    }
}
