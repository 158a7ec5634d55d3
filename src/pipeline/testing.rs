//! In-process fakes for every provider and platform seam, shared by the
//! pipeline and trigger tests.

use crate::config::Config;
use crate::error::{ProviderError, Result};
use crate::ledger::Ledger;
use crate::pipeline::{Orchestrator, PollConfig, PollStatus};
use crate::platform::{Post, Publisher, SocialFeed};
use crate::prompts::PromptEngine;
use crate::provider::{
    AvatarRenderer, CaptionBurner, GenerationRequest, JobId, MediaStore, Providers, RemoteVideo,
    SpeechSynthesizer, TextGenerator, Transcriber, Transcription, VoiceProfile,
};
use crate::transcript::{TimedWord, align_words};
use crate::{BoundingBox, MediaFile, MediaKind, Modality, ReplyTarget, TriggerEvent, TriggerSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub target: ReplyTarget,
    pub media: MediaFile,
    pub text: String,
}

/// Scripted behaviour and recorded calls.
pub(crate) struct MockState {
    pub text_reply: String,
    pub caption_reply: String,
    pub relevance_answer: String,
    pub fail_text: bool,
    pub avatar_pending_polls: u32,
    pub avatar_never_ready: bool,
    pub fail_transcription: bool,
    pub fail_correction: bool,
    pub fail_captions: bool,
    pub fail_publish: bool,
    pub fail_feed: bool,

    pub search_results: Vec<Post>,
    pub posts: HashMap<String, Post>,
    pub conversations: HashMap<String, Vec<Post>>,
    pub timelines: HashMap<String, Vec<Post>>,

    pub generate_calls: Vec<GenerationRequest>,
    pub synth_calls: u32,
    pub uploads: u32,
    pub avatar_jobs: u32,
    pub avatar_polls: u32,
    pub transcriptions: u32,
    pub caption_jobs: Vec<Vec<TimedWord>>,
    pub searches: Vec<(String, Option<String>)>,
    pub published: Vec<Published>,
    pub notices: Vec<(ReplyTarget, String)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            text_reply: "BTC is heading to the moon".into(),
            caption_reply: "\"the moon is close\"\nsecond line".into(),
            relevance_answer: "Yes.".into(),
            fail_text: false,
            avatar_pending_polls: 2,
            avatar_never_ready: false,
            fail_transcription: false,
            fail_correction: false,
            fail_captions: false,
            fail_publish: false,
            fail_feed: false,
            search_results: Vec::new(),
            posts: HashMap::new(),
            conversations: HashMap::new(),
            timelines: HashMap::new(),
            generate_calls: Vec::new(),
            synth_calls: 0,
            uploads: 0,
            avatar_jobs: 0,
            avatar_polls: 0,
            transcriptions: 0,
            caption_jobs: Vec::new(),
            searches: Vec::new(),
            published: Vec::new(),
            notices: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockWorld {
    pub state: Mutex<MockState>,
}

fn unavailable(provider: &'static str) -> ProviderError {
    ProviderError::Status {
        provider,
        status: 503,
        message: "unavailable".into(),
    }
}

#[async_trait]
impl TextGenerator for MockWorld {
    async fn generate(&self, request: GenerationRequest) -> std::result::Result<String, ProviderError> {
        let mut state = self.state.lock();
        state.generate_calls.push(request.clone());
        if state.fail_text {
            return Err(unavailable("llm"));
        }
        Ok(if !request.images.is_empty() {
            "a rising chart".into()
        } else if request.prompt.starts_with("Decide whether") {
            state.relevance_answer.clone()
        } else if request.prompt.contains("Requirements:") {
            state.caption_reply.clone()
        } else {
            state.text_reply.clone()
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for MockWorld {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceProfile,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        self.state.lock().synth_calls += 1;
        Ok(b"ID3 mp3 bytes".to_vec())
    }
}

#[async_trait]
impl MediaStore for MockWorld {
    async fn upload(&self, _bytes: Vec<u8>, kind: MediaKind) -> std::result::Result<String, ProviderError> {
        let mut state = self.state.lock();
        state.uploads += 1;
        Ok(format!("https://cdn/upload-{}.{}", state.uploads, kind.extension()))
    }

    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, ProviderError> {
        if url.contains("broken") {
            return Err(ProviderError::Status {
                provider: "media",
                status: 404,
                message: "not found".into(),
            });
        }
        Ok(b"\x89PNG".to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<u64, ProviderError> {
        let body = format!("video from {url}");
        tokio::fs::write(dest, body.as_bytes())
            .await
            .map_err(|error| ProviderError::Artifact(error.to_string()))?;
        Ok(body.len() as u64)
    }
}

#[async_trait]
impl AvatarRenderer for MockWorld {
    async fn create_job(
        &self,
        _photo_url: &str,
        _audio_url: &str,
        _bounding_box: BoundingBox,
    ) -> std::result::Result<JobId, ProviderError> {
        let mut state = self.state.lock();
        state.avatar_jobs += 1;
        Ok(JobId(format!("project-{}", state.avatar_jobs)))
    }

    async fn poll_result(&self, _job: &JobId) -> std::result::Result<PollStatus<String>, ProviderError> {
        let mut state = self.state.lock();
        state.avatar_polls += 1;
        if state.avatar_never_ready || state.avatar_polls <= state.avatar_pending_polls {
            return Ok(PollStatus::Pending);
        }
        Ok(PollStatus::Ready("https://cdn/raw.mp4".into()))
    }
}

#[async_trait]
impl Transcriber for MockWorld {
    async fn transcribe(&self, _video: &Path) -> std::result::Result<Transcription, ProviderError> {
        let mut state = self.state.lock();
        state.transcriptions += 1;
        if state.fail_transcription {
            return Err(unavailable("subtitles"));
        }
        Ok(Transcription {
            video: RemoteVideo { id: "video-1".into() },
            words: vec![
                TimedWord::new("helo", 0.0, 0.5),
                TimedWord::new("wrld", 0.5, 1.0),
            ],
        })
    }

    async fn correct(
        &self,
        words: &[TimedWord],
        _reference: &str,
    ) -> std::result::Result<Vec<TimedWord>, ProviderError> {
        if self.state.lock().fail_correction {
            return Err(unavailable("llm"));
        }
        Ok(align_words(words, &["Hello".into(), "World".into()])?)
    }
}

#[async_trait]
impl CaptionBurner for MockWorld {
    async fn create_job(
        &self,
        _video: &RemoteVideo,
        words: &[TimedWord],
    ) -> std::result::Result<JobId, ProviderError> {
        self.state.lock().caption_jobs.push(words.to_vec());
        Ok(JobId("task-1".into()))
    }

    async fn poll_result(
        &self,
        _video: &RemoteVideo,
        _job: &JobId,
    ) -> std::result::Result<PollStatus<String>, ProviderError> {
        if self.state.lock().fail_captions {
            return Ok(PollStatus::Failed("render error".into()));
        }
        Ok(PollStatus::Ready("https://cdn/captioned.mp4".into()))
    }
}

impl Publisher for MockWorld {
    fn name(&self) -> &str {
        "mock"
    }

    async fn publish(&self, target: &ReplyTarget, media: &MediaFile, text: &str) -> Result<String> {
        assert!(media.path.exists(), "published media must exist on disk");
        let mut state = self.state.lock();
        if state.fail_publish {
            return Err(unavailable("platform").into());
        }
        state.published.push(Published {
            target: target.clone(),
            media: media.clone(),
            text: text.to_string(),
        });
        Ok(format!("post-{}", state.published.len()))
    }

    async fn notify(&self, target: &ReplyTarget, text: &str) -> Result<()> {
        self.state.lock().notices.push((target.clone(), text.to_string()));
        Ok(())
    }
}

#[async_trait]
impl SocialFeed for MockWorld {
    async fn search_recent(
        &self,
        query: &str,
        since_id: Option<&str>,
        _max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        let mut state = self.state.lock();
        state
            .searches
            .push((query.to_string(), since_id.map(str::to_string)));
        if state.fail_feed {
            return Err(unavailable("twitter"));
        }
        let floor: u64 = since_id.and_then(|id| id.parse().ok()).unwrap_or(0);
        Ok(state
            .search_results
            .iter()
            .filter(|post| post.numeric_id() > floor)
            .cloned()
            .collect())
    }

    async fn get_post(&self, id: &str) -> std::result::Result<Option<Post>, ProviderError> {
        Ok(self.state.lock().posts.get(id).cloned())
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        Ok(self
            .state
            .lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_posts_by(
        &self,
        handle: &str,
        _since: DateTime<Utc>,
        _max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        let state = self.state.lock();
        if state.fail_feed {
            return Err(unavailable("twitter"));
        }
        Ok(state.timelines.get(handle).cloned().unwrap_or_default())
    }
}

pub(crate) fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.persona.system_prompt_fragments = vec!["You are Lea.".into()];
    config.persona.user_id = Some("999".into());
    config.voice.voice_id = Some("voice-1".into());
    config.avatar.poll = PollConfig::new(0, 4);
    config.captions.poll = PollConfig::new(0, 3);
    config
}

pub(crate) struct Harness {
    pub world: Arc<MockWorld>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Config,
    _data_dir: tempfile::TempDir,
}

impl Harness {
    pub fn ledger(&self) -> &Ledger {
        self.orchestrator.ledger()
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.config.scratch_dir()
    }
}

pub(crate) async fn harness(configure: impl FnOnce(&mut MockState)) -> Harness {
    let world = Arc::new(MockWorld::default());
    configure(&mut world.state.lock());

    let data_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path());
    let providers = Providers {
        text: world.clone(),
        speech: world.clone(),
        media: world.clone(),
        avatar: world.clone(),
        transcriber: world.clone(),
        captions: world.clone(),
    };
    let ledger = crate::ledger::tests::setup_ledger().await;
    let orchestrator = Orchestrator::new(
        &config,
        providers,
        ledger,
        world.clone(),
        Arc::new(PromptEngine::new().unwrap()),
    )
    .unwrap();

    Harness {
        world,
        orchestrator: Arc::new(orchestrator),
        config,
        _data_dir: data_dir,
    }
}

pub(crate) fn trigger(
    source: TriggerSource,
    dedup_key: &str,
    author_id: &str,
    text: &str,
    modality: Modality,
) -> TriggerEvent {
    TriggerEvent {
        source,
        channel_id: "channel-1".into(),
        author_id: author_id.into(),
        author_handle: format!("handle_{author_id}"),
        text: text.into(),
        thread_context: Vec::new(),
        attached_image_refs: Vec::new(),
        dedup_key: dedup_key.into(),
        modality,
        reply_to: ReplyTarget {
            channel_id: "channel-1".into(),
            parent_id: Some(dedup_key.into()),
        },
    }
}

pub(crate) fn post(id: &str, author_id: &str, text: &str) -> Post {
    Post {
        id: id.into(),
        author_id: author_id.into(),
        author_handle: Some(format!("handle_{author_id}")),
        text: text.into(),
        conversation_id: Some(id.into()),
        ..Post::default()
    }
}
