//! Top-level error types for Personabot.

use std::sync::Arc;
use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("trigger rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<config::ConfigError>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Ledger storage errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to open ledger database: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt ledger row for key {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}

/// Failure of a single call to an external capability.
///
/// Raised by every provider and platform adapter. The orchestrator decides per
/// stage whether a `ProviderError` degrades the run or ends it.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {message}")]
    Request { provider: &'static str, message: String },

    #[error("{provider} returned {status}: {message}")]
    Status {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} returned an unexpected payload: {message}")]
    Payload { provider: &'static str, message: String },

    #[error("{job} failed: {reason}")]
    JobFailed { job: String, reason: String },

    /// A bounded poll exhausted its attempts without a terminal result.
    #[error("{label} timed out after {attempts} polls ({interval:?} apart)")]
    PollTimeout {
        label: String,
        attempts: u32,
        interval: Duration,
    },

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),
}

impl ProviderError {
    pub fn request(provider: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Request {
            provider,
            message: error.to_string(),
        }
    }

    pub fn payload(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Payload {
            provider,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PollTimeout { .. })
    }

    /// The remote side asked us to slow down (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }
}

/// Why a trigger was turned away before a pipeline run started.
///
/// Rejections are expected outcomes and are logged, not surfaced as failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("dedup key {0} was already handled")]
    Duplicate(String),

    #[error("author {author_id} is rate limited")]
    RateLimited { author_id: String },

    #[error("message has {found} content words, need {required}")]
    BelowWordThreshold { found: usize, required: usize },

    #[error("channel {0} is not allowlisted")]
    DisallowedChannel(String),

    #[error("no output mode marker in message")]
    MissingModeMarker,

    #[error("post is authored by the persona")]
    SelfAuthored,

    #[error("post replies directly to the persona")]
    ReplyToPersona,

    #[error("thread is rooted at a persona post")]
    PersonaThread,

    #[error("post does not mention the persona")]
    NotAMention,

    #[error("post is not relevant to the configured topics")]
    Irrelevant,
}

/// Corrected transcript could not be laid onto the original timeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlignmentError {
    #[error("original transcript has no timed segments")]
    EmptyTimeline,

    #[error("corrected transcript has no words")]
    EmptyCorrection,
}
