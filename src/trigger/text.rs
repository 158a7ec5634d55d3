//! Text inspection shared by the front-ends: mode markers, mentions, and
//! content word counts.

use crate::Modality;

use regex::Regex;

use std::sync::LazyLock;

pub const VIDEO_MARKER: &str = "/video/";
pub const AUDIO_MARKER: &str = "/audio/";

static HANDLES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@\w+").expect("hardcoded regex"));

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}\x{1F1E0}-\x{1F1FF}]")
        .expect("hardcoded regex")
});

/// Output modality requested by a chat message. Video wins when both
/// markers are present.
pub fn mode_marker(text: &str) -> Option<Modality> {
    if text.contains(VIDEO_MARKER) {
        Some(Modality::Video)
    } else if text.contains(AUDIO_MARKER) {
        Some(Modality::Audio)
    } else {
        None
    }
}

pub fn strip_mode_markers(text: &str) -> String {
    text.replace(VIDEO_MARKER, "")
        .replace(AUDIO_MARKER, "")
        .trim()
        .to_string()
}

pub fn strip_emoji(text: &str) -> String {
    EMOJI.replace_all(text, "").into_owned()
}

/// Case-insensitive check for `mention` (with or without its `@`).
pub fn contains_mention(text: &str, mention: &str) -> bool {
    let mention = mention.trim_start_matches('@').to_lowercase();
    if mention.is_empty() {
        return false;
    }
    text.to_lowercase().contains(&format!("@{mention}"))
}

/// Words left once @handles and emoji are removed.
pub fn content_word_count(text: &str) -> usize {
    let without_handles = HANDLES.replace_all(text, "");
    let without_emoji = EMOJI.replace_all(&without_handles, "");
    without_emoji.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_marker_wins() {
        assert_eq!(mode_marker("@bot hi /audio/ /video/"), Some(Modality::Video));
        assert_eq!(mode_marker("@bot hi /audio/"), Some(Modality::Audio));
        assert_eq!(mode_marker("@bot hi /VIDEO/"), None);
        assert_eq!(mode_marker("@bot hi"), None);
    }

    #[test]
    fn markers_are_stripped_from_prompt() {
        assert_eq!(
            strip_mode_markers("@Leagpt_bot what is BTC? /video/"),
            "@Leagpt_bot what is BTC?"
        );
        assert_eq!(strip_mode_markers("/audio/"), "");
    }

    #[test]
    fn mention_match_ignores_case() {
        assert!(contains_mention("hey @LEA_GPT look", "lea_gpt"));
        assert!(contains_mention("hey @lea_gpt", "@Lea_GPT"));
        assert!(!contains_mention("hey lea_gpt", "lea_gpt"));
        assert!(!contains_mention("anything", ""));
    }

    #[test]
    fn handles_and_emoji_are_not_content() {
        assert_eq!(content_word_count("@lea_gpt @alice"), 0);
        assert_eq!(content_word_count("@lea_gpt 🚀 🇺🇸"), 0);
        assert_eq!(content_word_count("@lea_gpt thoughts? 🚀"), 1);
        assert_eq!(content_word_count("  gm   frens  "), 2);
    }
}
