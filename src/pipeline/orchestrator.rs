//! Drives one accepted trigger through generation, synthesis, rendering and
//! captioning, then delivers the result and settles the ledger.

use crate::config::{Config, GenerationConfig, PersonaConfig};
use crate::error::{ProviderError, Rejection, Result};
use crate::ledger::{Admission, Ledger, RatePolicy};
use crate::pipeline::artifact::RunScratch;
use crate::pipeline::poll::{PollConfig, Polled, poll_until_ready};
use crate::pipeline::state::{PipelineRun, Stage, StageOutcome};
use crate::platform::PublisherDyn;
use crate::prompts::{PromptEngine, join_image_analyses};
use crate::provider::{
    GenerationRequest, ImageInput, JobId, Providers, RemoteVideo, VoiceProfile,
};
use crate::trigger::text::strip_emoji;
use crate::{MediaFile, MediaKind, Modality, TriggerEvent};

use chrono::Utc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

const POST_TEXT_MAX_WORDS: usize = 10;

/// Stand-in analysis for an image that could not be fetched or described.
const UNANALYZABLE_IMAGE: &str = "Unable to analyze this image";

/// Per-front-end choices for a run.
#[derive(Debug, Clone, Copy)]
pub struct RunPlan {
    pub modality: Modality,
    pub captions: bool,
    pub generation: GenerationConfig,
    pub policy: RatePolicy,
    /// Write a short post text to accompany the media.
    pub post_caption: bool,
}

#[derive(Debug)]
pub enum HandleOutcome {
    Rejected(Rejection),
    Finished(Box<PipelineRun>),
}

impl HandleOutcome {
    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            HandleOutcome::Finished(run) => Some(run.as_ref()),
            HandleOutcome::Rejected(_) => None,
        }
    }
}

/// Shared by every front-end task. Holds no per-run state.
pub struct Orchestrator {
    providers: Providers,
    ledger: Ledger,
    publisher: Arc<dyn PublisherDyn>,
    prompts: Arc<PromptEngine>,
    persona: PersonaConfig,
    system_prompt: String,
    voice: VoiceProfile,
    vision_max_tokens: u32,
    caption_max_tokens: u32,
    avatar_poll: PollConfig,
    caption_poll: PollConfig,
    scratch_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        providers: Providers,
        ledger: Ledger,
        publisher: Arc<dyn PublisherDyn>,
        prompts: Arc<PromptEngine>,
    ) -> Result<Self> {
        Ok(Self {
            providers,
            ledger,
            publisher,
            prompts,
            persona: config.persona.clone(),
            system_prompt: config.persona.system_prompt(),
            voice: VoiceProfile::from_config(&config.voice)?,
            vision_max_tokens: config.llm.vision_max_tokens,
            caption_max_tokens: config.llm.caption_max_tokens,
            avatar_poll: config.avatar.poll,
            caption_poll: config.captions.poll,
            scratch_root: config.scratch_dir(),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn publisher(&self) -> &Arc<dyn PublisherDyn> {
        &self.publisher
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn prompts(&self) -> &PromptEngine {
        &self.prompts
    }

    /// Admit `event` against the ledger and, when accepted, run it to the end.
    ///
    /// Rejected triggers never reach a provider. Accepted ones always leave a
    /// settled ledger row, completed or failed.
    pub async fn handle(&self, event: &TriggerEvent, plan: &RunPlan) -> Result<HandleOutcome> {
        if let Admission::Rejected(rejection) = self.admit(event, plan.policy).await? {
            return Ok(HandleOutcome::Rejected(rejection));
        }
        let run = self.run_admitted(event, plan).await;
        Ok(HandleOutcome::Finished(Box::new(run)))
    }

    /// Claim the trigger's dedup key and rate slot.
    pub async fn admit(&self, event: &TriggerEvent, policy: RatePolicy) -> Result<Admission> {
        let admission = self.ledger.admit(event, policy, Utc::now()).await?;
        if let Admission::Rejected(rejection) = &admission {
            tracing::info!(
                dedup_key = %event.dedup_key,
                source = %event.source,
                author_id = %event.author_id,
                %rejection,
                "trigger rejected"
            );
        }
        Ok(admission)
    }

    /// Execute an admitted trigger and settle its ledger row.
    pub async fn run_admitted(&self, event: &TriggerEvent, plan: &RunPlan) -> PipelineRun {
        let run = self.execute(event, plan).await;
        self.settle_ledger(&run).await;
        run
    }

    async fn settle_ledger(&self, run: &PipelineRun) {
        let result = match run.posted_id() {
            Some(posted_id) => {
                self.ledger
                    .record_outcome(&run.dedup_key, posted_id, Utc::now())
                    .await
            }
            None => {
                let reason = run
                    .failure()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "run ended without delivery".into());
                self.ledger.record_failure(&run.dedup_key, &reason).await
            }
        };
        if let Err(error) = result {
            tracing::error!(dedup_key = %run.dedup_key, %error, "failed to settle ledger row");
        }
    }

    /// Run the pipeline for an already admitted trigger.
    #[tracing::instrument(skip_all, fields(run_id, dedup_key = %event.dedup_key, source = %event.source))]
    pub async fn execute(&self, event: &TriggerEvent, plan: &RunPlan) -> PipelineRun {
        let mut run = PipelineRun::new(&event.dedup_key);
        tracing::Span::current().record("run_id", run.run_id.as_str());

        let scratch = match RunScratch::create(&self.scratch_root, &run.run_id) {
            Ok(scratch) => scratch,
            Err(error) => {
                run.fail(Stage::Accepted, format!("{error:#}"));
                return run;
            }
        };

        self.drive(&mut run, event, plan, &scratch).await;
        scratch.cleanup();

        match run.failure() {
            None => tracing::info!(
                stage = %run.stage(),
                posted_id = run.posted_id().unwrap_or_default(),
                degraded = run.errors().len(),
                "run finished"
            ),
            Some(failure) => tracing::warn!(%failure, "run failed"),
        }
        run
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        event: &TriggerEvent,
        plan: &RunPlan,
        scratch: &RunScratch,
    ) {
        let image_analysis = self.analyze_images(&event.attached_image_refs).await;

        let generated = self
            .generate_response(event, plan, image_analysis.as_deref())
            .await;
        let StageOutcome::Advanced(text) = run.settle(Stage::TextGenerated, generated) else {
            return;
        };
        run.generated_text = Some(text.clone());

        let caption = if plan.post_caption {
            let caption = self.write_post_caption(&text, event).await;
            run.post_caption = Some(caption.clone());
            caption
        } else {
            String::new()
        };

        let audio_path = scratch.file(&format!("{}_response.mp3", self.persona.name));
        let synthesized = self.synthesize(&text, &audio_path).await;
        let StageOutcome::Advanced(audio) = run.settle(Stage::AudioSynthesized, synthesized) else {
            return;
        };
        run.audio_path = Some(audio_path.clone());

        if plan.modality == Modality::Audio {
            let media = MediaFile {
                path: audio_path,
                kind: MediaKind::Audio,
                remote_url: None,
            };
            self.deliver(run, event, media, &caption).await;
            return;
        }

        let started = self.start_avatar(audio).await;
        let StageOutcome::Advanced((audio_url, job)) = run.settle(Stage::AvatarJobCreated, started)
        else {
            return;
        };
        run.audio_url = Some(audio_url);
        run.avatar_project_id = Some(job.to_string());

        let raw_path = scratch.file("video_response.mp4");
        let rendered = self.render_avatar(&job, &raw_path).await;
        record_poll_attempts(run, Stage::AvatarRendered, &rendered);
        let StageOutcome::Advanced(raw_url) =
            run.settle(Stage::AvatarRendered, rendered.map(|polled| polled.value))
        else {
            return;
        };
        run.raw_video_url = Some(raw_url.clone());
        run.raw_video_path = Some(raw_path.clone());

        let raw = MediaFile {
            path: raw_path,
            kind: MediaKind::Video,
            remote_url: Some(raw_url),
        };
        let media = if plan.captions {
            match self.burn_captions(run, &text, &raw, scratch).await {
                Some(captioned) => captioned,
                None => raw,
            }
        } else {
            raw
        };

        self.deliver(run, event, media, &caption).await;
    }

    /// Captioned copy of `raw`, or `None` when any caption step failed.
    async fn burn_captions(
        &self,
        run: &mut PipelineRun,
        reference: &str,
        raw: &MediaFile,
        scratch: &RunScratch,
    ) -> Option<MediaFile> {
        let transcribed = self.providers.transcriber.transcribe(&raw.path).await;
        let StageOutcome::Advanced(transcription) = run.settle(Stage::Transcribed, transcribed)
        else {
            return None;
        };
        run.transcript = transcription.words.clone();

        let corrected = self
            .providers
            .transcriber
            .correct(&transcription.words, reference)
            .await;
        let words = match run.settle(Stage::TranscriptCorrected, corrected) {
            StageOutcome::Advanced(words) => {
                run.corrected_transcript = Some(words.clone());
                words
            }
            StageOutcome::Degraded(_) => transcription.words,
            StageOutcome::Fatal(_) => return None,
        };

        let created = self
            .providers
            .captions
            .create_job(&transcription.video, &words)
            .await;
        let StageOutcome::Advanced(job) = run.settle(Stage::CaptionJobCreated, created) else {
            return None;
        };

        let path = scratch.file("video_response_subtitled.mp4");
        let rendered = self
            .render_captions(&transcription.video, &job, &path)
            .await;
        record_poll_attempts(run, Stage::CaptionRendered, &rendered);
        let StageOutcome::Advanced(url) =
            run.settle(Stage::CaptionRendered, rendered.map(|polled| polled.value))
        else {
            return None;
        };
        run.captioned_video_url = Some(url.clone());
        run.captioned_video_path = Some(path.clone());

        Some(MediaFile {
            path,
            kind: MediaKind::Video,
            remote_url: Some(url),
        })
    }

    async fn deliver(
        &self,
        run: &mut PipelineRun,
        event: &TriggerEvent,
        media: MediaFile,
        text: &str,
    ) {
        match self.publisher.publish(&event.reply_to, &media, text).await {
            Ok(posted_id) => {
                tracing::info!(
                    platform = self.publisher.name(),
                    %posted_id,
                    kind = media.kind.as_str(),
                    "response delivered"
                );
                run.complete(media, posted_id);
            }
            Err(error) => {
                run.fail(
                    Stage::Completed,
                    format!("delivery via {} failed: {error}", self.publisher.name()),
                );
            }
        }
    }

    async fn generate_response(
        &self,
        event: &TriggerEvent,
        plan: &RunPlan,
        image_analysis: Option<&str>,
    ) -> std::result::Result<String, ProviderError> {
        let prompt = self
            .prompts
            .render_response(&self.system_prompt, &event.prompt_text(), image_analysis)
            .map_err(|error| ProviderError::payload("prompts", error.to_string()))?;

        let request = GenerationRequest::new(prompt, plan.generation.max_tokens)
            .with_system(self.system_prompt.clone())
            .with_temperature(plan.generation.temperature);
        self.providers.text.generate(request).await
    }

    /// One-line post text for social deliveries. Empty on any failure.
    async fn write_post_caption(&self, response: &str, event: &TriggerEvent) -> String {
        let thread_context = event.thread_context.join(" ");
        let result = async {
            let prompt = self
                .prompts
                .render_post_caption(&self.persona.name, response, &thread_context)
                .map_err(|error| ProviderError::payload("prompts", error.to_string()))?;
            self.providers
                .text
                .generate(GenerationRequest::new(prompt, self.caption_max_tokens))
                .await
        }
        .await;

        match result {
            Ok(text) => post_text(&text),
            Err(error) => {
                tracing::warn!(%error, "failed to write post caption, posting without text");
                String::new()
            }
        }
    }

    /// Describe every attached image. A failed image is replaced by a fixed
    /// notice rather than failing the run.
    async fn analyze_images(&self, image_refs: &[String]) -> Option<String> {
        let mut analyses = Vec::with_capacity(image_refs.len());
        for url in image_refs {
            match self.analyze_image(url).await {
                Ok(analysis) => analyses.push(analysis),
                Err(error) => {
                    tracing::warn!(%url, %error, "failed to analyze image");
                    analyses.push(UNANALYZABLE_IMAGE.to_string());
                }
            }
        }
        join_image_analyses(&analyses)
    }

    async fn analyze_image(&self, url: &str) -> std::result::Result<String, ProviderError> {
        use base64::Engine as _;

        let bytes = self.providers.media.fetch(url).await?;
        tracing::debug!(%url, size = bytes.len(), "fetched image for analysis");
        let image = ImageInput {
            media_type: image_media_type(url).to_string(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let request =
            GenerationRequest::new(self.prompts.image_description(), self.vision_max_tokens)
                .with_image(image);
        self.providers.text.generate(request).await
    }

    async fn synthesize(
        &self,
        text: &str,
        dest: &Path,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        let audio = self.providers.speech.synthesize(text, &self.voice).await?;
        tokio::fs::write(dest, &audio).await.map_err(|error| {
            ProviderError::Artifact(format!("failed to write {}: {error}", dest.display()))
        })?;
        Ok(audio)
    }

    async fn start_avatar(
        &self,
        audio: Vec<u8>,
    ) -> std::result::Result<(String, JobId), ProviderError> {
        let audio_url = self.providers.media.upload(audio, MediaKind::Audio).await?;
        let job = self
            .providers
            .avatar
            .create_job(&self.persona.photo_url, &audio_url, self.persona.avatar_box)
            .await?;
        Ok((audio_url, job))
    }

    async fn render_avatar(
        &self,
        job: &JobId,
        dest: &Path,
    ) -> std::result::Result<Polled<String>, ProviderError> {
        let polled = poll_until_ready("avatar render", self.avatar_poll, |_| {
            self.providers.avatar.poll_result(job)
        })
        .await?;
        self.providers.media.download(&polled.value, dest).await?;
        Ok(polled)
    }

    async fn render_captions(
        &self,
        video: &RemoteVideo,
        job: &JobId,
        dest: &Path,
    ) -> std::result::Result<Polled<String>, ProviderError> {
        let polled = poll_until_ready("caption render", self.caption_poll, |_| {
            self.providers.captions.poll_result(video, job)
        })
        .await?;
        self.providers.media.download(&polled.value, dest).await?;
        Ok(polled)
    }
}

fn record_poll_attempts(
    run: &mut PipelineRun,
    stage: Stage,
    result: &std::result::Result<Polled<String>, ProviderError>,
) {
    match result {
        Ok(polled) => run.record_attempts(stage, polled.attempts),
        Err(ProviderError::PollTimeout { attempts, .. }) => run.record_attempts(stage, *attempts),
        Err(_) => {}
    }
}

/// First non-blank line of the model output, unquoted, without emoji and
/// cut to [`POST_TEXT_MAX_WORDS`] words.
fn post_text(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches('"');
    strip_emoji(line)
        .split_whitespace()
        .take(POST_TEXT_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn image_media_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
