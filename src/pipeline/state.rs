//! Pipeline run state machine.
//!
//! A run moves forward through [`Stage`]s and never re-enters one. Stage
//! failures are settled against a fixed table: some degrade the response and
//! let the run continue, the rest end it.

use crate::MediaFile;
use crate::error::ProviderError;
use crate::transcript::TimedWord;

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Stages in execution order. A stage names what has been achieved.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Accepted,
    TextGenerated,
    AudioSynthesized,
    AvatarJobCreated,
    AvatarRendered,
    Transcribed,
    TranscriptCorrected,
    CaptionJobCreated,
    CaptionRendered,
    Completed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Accepted => "accepted",
            Stage::TextGenerated => "text_generated",
            Stage::AudioSynthesized => "audio_synthesized",
            Stage::AvatarJobCreated => "avatar_job_created",
            Stage::AvatarRendered => "avatar_rendered",
            Stage::Transcribed => "transcribed",
            Stage::TranscriptCorrected => "transcript_corrected",
            Stage::CaptionJobCreated => "caption_job_created",
            Stage::CaptionRendered => "caption_rendered",
            Stage::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do when the work leading to a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// End the run.
    Abort,
    /// Deliver the uncaptioned render.
    UncaptionedVideo,
    /// Burn captions from the uncorrected transcript.
    OriginalTranscript,
}

/// Fallback applied when reaching `stage` fails.
pub fn fallback_for(stage: Stage) -> Fallback {
    match stage {
        Stage::Transcribed | Stage::CaptionJobCreated | Stage::CaptionRendered => {
            Fallback::UncaptionedVideo
        }
        Stage::TranscriptCorrected => Fallback::OriginalTranscript,
        Stage::Accepted
        | Stage::TextGenerated
        | Stage::AudioSynthesized
        | Stage::AvatarJobCreated
        | Stage::AvatarRendered
        | Stage::Completed => Fallback::Abort,
    }
}

/// A failure tagged with the stage that was being attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub reason: String,
    pub timed_out: bool,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.reason)
    }
}

/// How a stage attempt settled.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Advanced(T),
    Degraded(Fallback),
    Fatal(StageError),
}

/// One execution of the response pipeline. Owned by a single orchestrator task.
#[derive(Debug, Clone, Default)]
pub struct PipelineRun {
    pub run_id: String,
    pub dedup_key: String,
    stage: Stage,
    failure: Option<StageError>,
    pub generated_text: Option<String>,
    pub post_caption: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub audio_url: Option<String>,
    pub avatar_project_id: Option<String>,
    pub raw_video_url: Option<String>,
    pub raw_video_path: Option<PathBuf>,
    pub transcript: Vec<TimedWord>,
    pub corrected_transcript: Option<Vec<TimedWord>>,
    pub captioned_video_url: Option<String>,
    pub captioned_video_path: Option<PathBuf>,
    final_media: Option<MediaFile>,
    posted_id: Option<String>,
    attempts: BTreeMap<Stage, u32>,
    errors: Vec<StageError>,
}

impl PipelineRun {
    pub fn new(dedup_key: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            dedup_key: dedup_key.into(),
            ..Self::default()
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn failure(&self) -> Option<&StageError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }

    pub fn final_media(&self) -> Option<&MediaFile> {
        self.final_media.as_ref()
    }

    pub fn posted_id(&self) -> Option<&str> {
        self.posted_id.as_deref()
    }

    /// Every failure recorded during the run, degraded ones included.
    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn record_attempts(&mut self, stage: Stage, attempts: u32) {
        *self.attempts.entry(stage).or_default() += attempts;
    }

    /// Move forward to `next`. Moving backwards, standing still, or leaving a
    /// failed run is refused. `Completed` is only reachable through
    /// [`PipelineRun::complete`].
    pub fn advance(&mut self, next: Stage) -> bool {
        if self.failure.is_some() || next <= self.stage || next == Stage::Completed {
            tracing::warn!(
                run_id = %self.run_id,
                from = %self.stage,
                to = %next,
                "refused stage transition"
            );
            return false;
        }
        tracing::debug!(run_id = %self.run_id, stage = %next, "stage reached");
        self.stage = next;
        true
    }

    /// Finish the run after delivery.
    pub fn complete(&mut self, media: MediaFile, posted_id: String) -> bool {
        if self.failure.is_some() || self.stage == Stage::Completed {
            return false;
        }
        self.stage = Stage::Completed;
        self.final_media = Some(media);
        self.posted_id = Some(posted_id);
        true
    }

    /// Settle the attempt to reach `stage` against the fallback table.
    pub fn settle<T>(
        &mut self,
        stage: Stage,
        result: Result<T, ProviderError>,
    ) -> StageOutcome<T> {
        match result {
            Ok(value) => {
                self.advance(stage);
                StageOutcome::Advanced(value)
            }
            Err(error) => {
                let stage_error = StageError {
                    stage,
                    reason: error.to_string(),
                    timed_out: error.is_timeout(),
                };
                self.errors.push(stage_error.clone());

                match fallback_for(stage) {
                    Fallback::Abort => {
                        tracing::warn!(
                            run_id = %self.run_id,
                            dedup_key = %self.dedup_key,
                            %stage,
                            %error,
                            "stage failed, aborting run"
                        );
                        self.failure = Some(stage_error.clone());
                        StageOutcome::Fatal(stage_error)
                    }
                    fallback => {
                        tracing::warn!(
                            run_id = %self.run_id,
                            dedup_key = %self.dedup_key,
                            %stage,
                            %error,
                            ?fallback,
                            "stage failed, degrading response"
                        );
                        StageOutcome::Degraded(fallback)
                    }
                }
            }
        }
    }

    /// Abort for a reason that is not a provider failure (e.g. delivery).
    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> StageError {
        let stage_error = StageError {
            stage,
            reason: reason.into(),
            timed_out: false,
        };
        self.errors.push(stage_error.clone());
        self.failure = Some(stage_error.clone());
        stage_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaKind;
    use std::time::Duration;

    fn media() -> MediaFile {
        MediaFile {
            path: PathBuf::from("/tmp/out.mp4"),
            kind: MediaKind::Video,
            remote_url: Some("https://cdn/raw.mp4".into()),
        }
    }

    #[test]
    fn stages_only_move_forward() {
        let mut run = PipelineRun::new("k");
        assert_eq!(run.stage(), Stage::Accepted);

        assert!(run.advance(Stage::TextGenerated));
        assert!(run.advance(Stage::AvatarRendered));
        assert!(!run.advance(Stage::AudioSynthesized));
        assert!(!run.advance(Stage::AvatarRendered));
        assert_eq!(run.stage(), Stage::AvatarRendered);
    }

    #[test]
    fn completed_requires_final_media() {
        let mut run = PipelineRun::new("k");
        assert!(!run.advance(Stage::Completed));
        assert!(run.final_media().is_none());

        assert!(run.complete(media(), "post-1".into()));
        assert!(run.is_completed());
        assert_eq!(run.final_media(), Some(&media()));
        assert_eq!(run.posted_id(), Some("post-1"));
        assert!(!run.complete(media(), "post-2".into()));
    }

    #[test]
    fn fallback_table() {
        assert_eq!(fallback_for(Stage::TextGenerated), Fallback::Abort);
        assert_eq!(fallback_for(Stage::AvatarRendered), Fallback::Abort);
        assert_eq!(fallback_for(Stage::Transcribed), Fallback::UncaptionedVideo);
        assert_eq!(
            fallback_for(Stage::TranscriptCorrected),
            Fallback::OriginalTranscript
        );
        assert_eq!(fallback_for(Stage::CaptionJobCreated), Fallback::UncaptionedVideo);
        assert_eq!(fallback_for(Stage::CaptionRendered), Fallback::UncaptionedVideo);
    }

    #[test]
    fn fatal_failure_is_terminal() {
        let mut run = PipelineRun::new("k");
        let outcome = run.settle::<()>(
            Stage::AvatarRendered,
            Err(ProviderError::PollTimeout {
                label: "avatar render".into(),
                attempts: 100,
                interval: Duration::from_secs(5),
            }),
        );

        let StageOutcome::Fatal(error) = outcome else {
            panic!("avatar timeout must be fatal");
        };
        assert_eq!(error.stage, Stage::AvatarRendered);
        assert!(error.timed_out);
        assert!(run.is_failed());
        assert!(!run.advance(Stage::Transcribed));
        assert!(!run.complete(media(), "p".into()));
        assert!(run.final_media().is_none());
    }

    #[test]
    fn degraded_failure_keeps_run_alive() {
        let mut run = PipelineRun::new("k");
        run.advance(Stage::AvatarRendered);

        let outcome = run.settle::<()>(
            Stage::CaptionRendered,
            Err(ProviderError::request("subtitles", "503")),
        );
        assert!(matches!(outcome, StageOutcome::Degraded(Fallback::UncaptionedVideo)));
        assert!(!run.is_failed());
        assert_eq!(run.errors().len(), 1);
        assert_eq!(run.stage(), Stage::AvatarRendered);
        assert!(run.complete(media(), "p".into()));
    }

    #[test]
    fn attempts_accumulate_per_stage() {
        let mut run = PipelineRun::new("k");
        run.record_attempts(Stage::AvatarRendered, 3);
        run.record_attempts(Stage::AvatarRendered, 2);
        assert_eq!(run.attempts(Stage::AvatarRendered), 5);
        assert_eq!(run.attempts(Stage::CaptionRendered), 0);
    }
}
