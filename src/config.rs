//! Configuration loading and validation.

use crate::BoundingBox;
use crate::error::{ConfigError, Result};
use crate::ledger::RatePolicy;
use crate::pipeline::PollConfig;

use serde::Deserialize;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment prefix for overriding any file key, e.g. `PERSONABOT__TELEGRAM__COOLDOWN_SECS`.
const ENV_PREFIX: &str = "PERSONABOT";

/// Upper bound when reading numbered persona prompt fragments from the environment.
const MAX_PROMPT_FRAGMENTS: usize = 256;

/// Personabot configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory holding the ledger and run scratch space.
    pub data_dir: PathBuf,
    pub persona: PersonaConfig,
    pub llm: LlmConfig,
    pub voice: VoiceConfig,
    pub media: MediaConfig,
    pub avatar: AvatarConfig,
    pub captions: CaptionConfig,
    pub telegram: TelegramConfig,
    pub twitter: TwitterConfig,
    pub mentions: MentionConfig,
    pub proactive: ProactiveConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            persona: PersonaConfig::default(),
            llm: LlmConfig::default(),
            voice: VoiceConfig::default(),
            media: MediaConfig::default(),
            avatar: AvatarConfig::default(),
            captions: CaptionConfig::default(),
            telegram: TelegramConfig::default(),
            twitter: TwitterConfig::default(),
            mentions: MentionConfig::default(),
            proactive: ProactiveConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Who the persona is and how it looks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub name: String,
    /// Social handle without the leading `@`.
    pub handle: String,
    /// Platform user id of the persona account, used to skip its own posts.
    pub user_id: Option<String>,
    /// Ordered fragments concatenated into the system prompt.
    pub system_prompt_fragments: Vec<String>,
    pub photo_url: String,
    pub avatar_box: BoundingBox,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "Lea".into(),
            handle: "lea_gpt".into(),
            user_id: None,
            system_prompt_fragments: Vec::new(),
            photo_url: "https://s11.gifyu.com/images/SyFer.png".into(),
            avatar_box: BoundingBox::default(),
        }
    }
}

impl PersonaConfig {
    pub fn system_prompt(&self) -> String {
        self.system_prompt_fragments.concat()
    }

    /// `@handle`, lowercased, as it appears in post text.
    pub fn mention_tag(&self) -> String {
        format!("@{}", self.handle.trim_start_matches('@').to_lowercase())
    }
}

/// Text generation provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub vision_max_tokens: u32,
    pub caption_max_tokens: u32,
    pub relevance_max_tokens: u32,
    pub correction_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            timeout_secs: 120,
            vision_max_tokens: 1000,
            caption_max_tokens: 60,
            relevance_max_tokens: 10,
            correction_max_tokens: 1000,
        }
    }
}

/// Speech synthesis settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub api_key: Option<String>,
    pub voice_id: Option<String>,
    pub base_url: String,
    pub model_id: String,
    pub style: f32,
    pub stability: f32,
    pub similarity_boost: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: None,
            base_url: "https://api.elevenlabs.io".into(),
            model_id: "eleven_multilingual_v2".into(),
            style: 1.0,
            stability: 0.0,
            similarity_boost: 0.0,
            use_speaker_boost: false,
        }
    }
}

/// Media hosting settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub cloud_name: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub base_url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cloud_name: None,
            api_key: None,
            api_secret: None,
            base_url: "https://api.cloudinary.com".into(),
        }
    }
}

/// Avatar rendering settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub api_key: Option<String>,
    pub create_url: Option<String>,
    pub project_url: Option<String>,
    pub poll: PollConfig,
}

/// Transcription and caption burning settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub api_key: Option<String>,
    pub template_id: Option<String>,
    pub base_url: String,
    pub language: String,
    /// Polling for the burned-in caption render.
    pub poll: PollConfig,
    /// Polling for the transcription task.
    pub transcription_poll: PollConfig,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            template_id: None,
            base_url: "https://api.subtitles.ai".into(),
            language: "en".into(),
            poll: PollConfig::new(10, 30),
            transcription_poll: PollConfig::new(10, 30),
        }
    }
}

/// Token and temperature settings for one front-end's responses.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: None,
        }
    }
}

/// Sliding-window response cap.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowLimit {
    pub max_count: u32,
    pub window_secs: u64,
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self {
            max_count: 2,
            window_secs: 3600,
        }
    }
}

impl WindowLimit {
    pub fn policy(&self) -> RatePolicy {
        RatePolicy::SlidingWindow {
            max_count: self.max_count,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

/// Random delay range between polling cycles.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct DelayRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DelayRange {
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn sample(&self) -> Duration {
        use rand::Rng as _;

        let (low, high) = if self.min_secs <= self.max_secs {
            (self.min_secs, self.max_secs)
        } else {
            (self.max_secs, self.min_secs)
        };
        Duration::from_secs(rand::rng().random_range(low..=high))
    }
}

/// Chat front-end (Telegram) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    /// Chats the bot answers in. Messages from any other chat are ignored.
    pub allowed_chat_ids: Vec<i64>,
    /// Mention that addresses the bot, e.g. `@Leagpt_bot`.
    pub mention: String,
    pub cooldown_secs: u64,
    pub max_concurrent_runs: usize,
    pub captions: bool,
    pub generation: GenerationConfig,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            mention: "@Leagpt_bot".into(),
            cooldown_secs: 300,
            max_concurrent_runs: 5,
            captions: false,
            generation: GenerationConfig {
                max_tokens: 80,
                temperature: Some(0.8),
            },
        }
    }
}

impl TelegramConfig {
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy::FixedCooldown(Duration::from_secs(self.cooldown_secs))
    }
}

/// Social platform (X) credentials and endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwitterConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub access_token: Option<String>,
    pub access_token_secret: Option<String>,
    pub bearer_token: Option<String>,
    pub api_base: String,
    pub upload_base: String,
    /// Polling for server-side video processing after upload.
    pub media_poll: PollConfig,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            access_token: None,
            access_token_secret: None,
            bearer_token: None,
            api_base: "https://api.twitter.com".into(),
            upload_base: "https://upload.twitter.com".into(),
            media_poll: PollConfig::new(5, 60),
        }
    }
}

/// Mention watcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MentionConfig {
    pub recent_window_mins: i64,
    pub fallback_window_mins: i64,
    pub min_words: usize,
    pub max_results: u32,
    pub per_author: WindowLimit,
    pub captions: bool,
    pub generation: GenerationConfig,
    pub cycle_delay: DelayRange,
    pub error_backoff: DelayRange,
}

impl Default for MentionConfig {
    fn default() -> Self {
        Self {
            recent_window_mins: 10,
            fallback_window_mins: 60,
            min_words: 1,
            max_results: 100,
            per_author: WindowLimit {
                max_count: 5,
                window_secs: 3600,
            },
            captions: true,
            generation: GenerationConfig {
                max_tokens: 500,
                temperature: None,
            },
            cycle_delay: DelayRange::new(15, 30),
            error_backoff: DelayRange::new(300, 480),
        }
    }
}

/// Proactive scanner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProactiveConfig {
    /// Account handles to watch.
    pub roster: Vec<String>,
    pub lookback_mins: i64,
    pub max_posts_per_account: u32,
    pub per_account: WindowLimit,
    /// Topics a post must touch to be worth answering.
    pub relevance_topics: Vec<String>,
    pub captions: bool,
    pub generation: GenerationConfig,
    pub cycle_secs: u64,
    pub error_backoff: DelayRange,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            roster: Vec::new(),
            lookback_mins: 10,
            max_posts_per_account: 10,
            per_account: WindowLimit::default(),
            relevance_topics: vec![
                "cryptocurrency, blockchain, tokens, or digital assets".into(),
                "politics, elections, or government policy".into(),
                "artificial intelligence, language models, or AI products".into(),
            ],
            captions: true,
            generation: GenerationConfig {
                max_tokens: 800,
                temperature: None,
            },
            cycle_secs: 300,
            error_backoff: DelayRange::new(300, 480),
        }
    }
}

/// OpenTelemetry export settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub otlp_headers: HashMap<String, String>,
    pub service_name: String,
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            otlp_headers: HashMap::new(),
            service_name: "personabot".into(),
            sample_rate: 1.0,
        }
    }
}

/// Which front-end a process runs; decides which credentials are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontEnd {
    Chat,
    Mentions,
    Proactive,
}

impl FrontEnd {
    fn captions_enabled(self, config: &Config) -> bool {
        match self {
            FrontEnd::Chat => config.telegram.captions,
            FrontEnd::Mentions => config.mentions.captions,
            FrontEnd::Proactive => config.proactive.captions,
        }
    }
}

impl Config {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("personabot"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Load from an optional TOML file, `PERSONABOT__*` overrides, and provider
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an injectable lookup for fallback variables.
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let display_path = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".into());
        let load_error = |source: config::ConfigError| ConfigError::Load {
            path: display_path.clone(),
            source: Arc::new(source),
        };

        let mut config: Config = builder
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)?;

        config.apply_env_fallbacks(&lookup);
        Ok(config)
    }

    /// Fill unset credentials from each provider's conventional variables.
    pub fn apply_env_fallbacks(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        let fill = |slot: &mut Option<String>, key: &str| {
            if slot.as_deref().is_none_or(str::is_empty) {
                if let Some(value) = lookup(key).filter(|value| !value.is_empty()) {
                    *slot = Some(value);
                }
            }
        };

        fill(&mut self.llm.api_key, "ANTHROPIC_API_KEY");
        fill(&mut self.voice.api_key, "ELEVEN_LABS_API_KEY");
        fill(&mut self.voice.voice_id, "ELEVEN_LABS_VOICE_ID");
        fill(&mut self.media.cloud_name, "CLOUDINARY_CLOUD_NAME");
        fill(&mut self.media.api_key, "CLOUDINARY_API_KEY");
        fill(&mut self.media.api_secret, "CLOUDINARY_API_SECRET");
        fill(&mut self.avatar.api_key, "MOVEMENT_API_KEY");
        fill(&mut self.avatar.create_url, "MOVEMENT_CREATE_URL");
        fill(&mut self.avatar.project_url, "MOVEMENT_PROJECT_URL");
        fill(&mut self.captions.api_key, "SUBTITLES_API_KEY");
        fill(&mut self.captions.template_id, "SUBTITLES_TEMPLATE_ID");
        fill(&mut self.telegram.bot_token, "TELEGRAM_BOT_TOKEN");
        fill(&mut self.twitter.api_key, "TWITTER_API_KEY");
        fill(&mut self.twitter.api_secret, "TWITTER_API_SECRET");
        fill(&mut self.twitter.access_token, "TWITTER_ACCESS_TOKEN");
        fill(&mut self.twitter.access_token_secret, "TWITTER_ACCESS_TOKEN_SECRET");
        fill(&mut self.twitter.bearer_token, "TWITTER_BEARER_TOKEN");

        if self.persona.system_prompt_fragments.is_empty() {
            self.persona.system_prompt_fragments = (1..=MAX_PROMPT_FRAGMENTS)
                .map_while(|index| lookup(&format!("CHARACTER_CONTEXT_LINE_{index}")))
                .collect();
        }
    }

    /// Check that everything `front_end` needs is present.
    pub fn validate_for(&self, front_end: FrontEnd) -> Result<()> {
        let mut required: Vec<(&str, &Option<String>)> = vec![
            ("llm.api_key", &self.llm.api_key),
            ("voice.api_key", &self.voice.api_key),
            ("voice.voice_id", &self.voice.voice_id),
            ("media.cloud_name", &self.media.cloud_name),
            ("media.api_key", &self.media.api_key),
            ("media.api_secret", &self.media.api_secret),
            ("avatar.api_key", &self.avatar.api_key),
            ("avatar.create_url", &self.avatar.create_url),
            ("avatar.project_url", &self.avatar.project_url),
        ];

        if front_end.captions_enabled(self) {
            required.extend([
                ("captions.api_key", &self.captions.api_key),
                ("captions.template_id", &self.captions.template_id),
            ]);
        }

        match front_end {
            FrontEnd::Chat => required.push(("telegram.bot_token", &self.telegram.bot_token)),
            FrontEnd::Mentions | FrontEnd::Proactive => required.extend([
                ("twitter.api_key", &self.twitter.api_key),
                ("twitter.api_secret", &self.twitter.api_secret),
                ("twitter.access_token", &self.twitter.access_token),
                ("twitter.access_token_secret", &self.twitter.access_token_secret),
                ("twitter.bearer_token", &self.twitter.bearer_token),
            ]),
        }

        if let Some((key, _)) = required
            .iter()
            .find(|(_, value)| value.as_deref().is_none_or(str::is_empty))
        {
            return Err(ConfigError::MissingKey((*key).to_string()).into());
        }

        if self.persona.system_prompt_fragments.is_empty() {
            return Err(ConfigError::Invalid(
                "persona.system_prompt_fragments is empty and no CHARACTER_CONTEXT_LINE_1 is set"
                    .into(),
            )
            .into());
        }

        match front_end {
            FrontEnd::Chat if self.telegram.allowed_chat_ids.is_empty() => {
                Err(ConfigError::Invalid("telegram.allowed_chat_ids is empty".into()).into())
            }
            FrontEnd::Chat if self.telegram.max_concurrent_runs == 0 => Err(ConfigError::Invalid(
                "telegram.max_concurrent_runs must be at least 1".into(),
            )
            .into()),
            FrontEnd::Mentions if self.persona.user_id.is_none() => {
                Err(ConfigError::MissingKey("persona.user_id".into()).into())
            }
            FrontEnd::Proactive if self.proactive.roster.is_empty() => {
                Err(ConfigError::Invalid("proactive.roster is empty".into()).into())
            }
            _ => Ok(()),
        }
    }

    /// Path of the ledger database.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    /// Parent directory for per-run scratch directories.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}
