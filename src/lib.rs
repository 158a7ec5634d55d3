//! Personabot: a virtual persona that answers chat and social triggers with
//! synthesized voice and talking-head video.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod platform;
pub mod prompts;
pub mod provider;
pub mod transcript;
pub mod trigger;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Front-end that produced a trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Chat,
    Mention,
    Proactive,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Chat => "chat",
            TriggerSource::Mention => "mention",
            TriggerSource::Proactive => "proactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(TriggerSource::Chat),
            "mention" => Some(TriggerSource::Mention),
            "proactive" => Some(TriggerSource::Proactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format of a response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Audio,
    Video,
}

/// Where the finished response is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    /// Chat id or social conversation id.
    pub channel_id: String,
    /// Message or post being answered, when the platform threads replies.
    pub parent_id: Option<String>,
}

/// One inbound stimulus requiring a response. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    pub channel_id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
    /// Prior message texts in the conversation, oldest first.
    pub thread_context: Vec<String>,
    pub attached_image_refs: Vec<String>,
    pub dedup_key: String,
    pub modality: Modality,
    pub reply_to: ReplyTarget,
}

impl TriggerEvent {
    /// Prompt handed to text generation: thread context followed by the trigger text.
    pub fn prompt_text(&self) -> String {
        if self.thread_context.is_empty() {
            return self.text.clone();
        }
        let mut prompt = self.thread_context.join(" ");
        prompt.push(' ');
        prompt.push_str(&self.text);
        prompt
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Audio => "mp3",
            MediaKind::Video => "mp4",
            MediaKind::Image => "png",
        }
    }
}

/// A media file ready for delivery, living in a run's scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub kind: MediaKind,
    /// Hosted copy, when one exists.
    pub remote_url: Option<String>,
}

/// Placement of the animated face inside the avatar photo, in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BoundingBox {
    pub fn as_array(&self) -> [u32; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            x0: 444,
            y0: 131,
            x1: 733,
            y1: 478,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(thread: Vec<&str>) -> TriggerEvent {
        TriggerEvent {
            source: TriggerSource::Mention,
            channel_id: "c1".into(),
            author_id: "u1".into(),
            author_handle: "alice".into(),
            text: "what now?".into(),
            thread_context: thread.into_iter().map(String::from).collect(),
            attached_image_refs: Vec::new(),
            dedup_key: "root".into(),
            modality: Modality::Video,
            reply_to: ReplyTarget {
                channel_id: "c1".into(),
                parent_id: Some("p1".into()),
            },
        }
    }

    #[test]
    fn prompt_text_prefixes_thread_context() {
        assert_eq!(event(vec![]).prompt_text(), "what now?");
        assert_eq!(
            event(vec!["gm", "markets are up"]).prompt_text(),
            "gm markets are up what now?"
        );
    }

    #[test]
    fn trigger_source_round_trips_through_str() {
        for source in [
            TriggerSource::Chat,
            TriggerSource::Mention,
            TriggerSource::Proactive,
        ] {
            assert_eq!(TriggerSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(TriggerSource::parse("dm"), None);
    }
}
