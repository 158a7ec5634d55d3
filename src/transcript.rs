//! Word timelines and transcript correction.

use crate::error::{AlignmentError, ProviderError};
use crate::prompts::PromptEngine;
use crate::provider::{GenerationRequest, TextGenerator};

use serde::{Deserialize, Serialize};

/// One transcribed word with its time span in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedWord {
    pub text: String,
    #[serde(rename = "type", default = "word_kind")]
    pub kind: String,
    pub start_time: f64,
    pub end_time: f64,
}

fn word_kind() -> String {
    "word".into()
}

impl TimedWord {
    pub fn new(text: impl Into<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            text: text.into(),
            kind: word_kind(),
            start_time,
            end_time,
        }
    }
}

/// Plain text of a timeline, words separated by single spaces.
pub fn timeline_text(words: &[TimedWord]) -> String {
    words
        .iter()
        .map(|word| word.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lay `corrected` words over the time segmentation of `original`.
///
/// With equal counts every corrected word takes its original segment's span.
/// Otherwise word `i` of `n` covers the fractional segment range
/// `[i*m/n, (i+1)*m/n)` of the `m` original segments, with times interpolated
/// inside each segment. No corrected word is dropped and the result stays
/// inside the original speech span.
pub fn align_words(
    original: &[TimedWord],
    corrected: &[String],
) -> Result<Vec<TimedWord>, AlignmentError> {
    if original.is_empty() {
        return Err(AlignmentError::EmptyTimeline);
    }
    if corrected.is_empty() {
        return Err(AlignmentError::EmptyCorrection);
    }

    let m = original.len();
    let n = corrected.len();
    if m != n {
        tracing::warn!(
            original_words = m,
            corrected_words = n,
            "corrected transcript length differs, re-timing proportionally"
        );
    }

    // Position `numerator / n` in segment units, mapped to seconds.
    let time_at = |segment: usize, numerator: usize| {
        let word = &original[segment.min(m - 1)];
        match numerator - segment * n {
            0 => word.start_time,
            offset if offset == n => word.end_time,
            offset => {
                let fraction = offset as f64 / n as f64;
                word.start_time + fraction * (word.end_time - word.start_time)
            }
        }
    };

    Ok(corrected
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let start_numerator = index * m;
            let end_numerator = (index + 1) * m;
            let start_segment = start_numerator / n;
            let end_segment = end_numerator.div_ceil(n) - 1;
            TimedWord::new(
                text.clone(),
                time_at(start_segment, start_numerator),
                time_at(end_segment, end_numerator),
            )
        })
        .collect())
}

/// Ask the text generator to fix `original` against `reference`, then align.
pub async fn correct_with_generator(
    generator: &dyn TextGenerator,
    prompts: &PromptEngine,
    original: &[TimedWord],
    reference: &str,
    max_tokens: u32,
) -> Result<Vec<TimedWord>, ProviderError> {
    let prompt = prompts
        .render_transcript_correction(&timeline_text(original), reference)
        .map_err(|error| ProviderError::payload("prompts", error.to_string()))?;

    let output = generator
        .generate(GenerationRequest::new(prompt, max_tokens))
        .await?;
    let words: Vec<String> = output.split_whitespace().map(String::from).collect();

    Ok(align_words(original, &words)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline(spans: &[(&str, f64, f64)]) -> Vec<TimedWord> {
        spans
            .iter()
            .map(|(text, start, end)| TimedWord::new(*text, *start, *end))
            .collect()
    }

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(String::from).collect()
    }

    fn spans(aligned: &[TimedWord]) -> Vec<(f64, f64)> {
        aligned.iter().map(|w| (w.start_time, w.end_time)).collect()
    }

    #[test]
    fn equal_counts_keep_original_timing() {
        let original = timeline(&[("helo", 0.0, 0.4), ("wrld", 0.5, 1.1), ("agan", 1.2, 1.6)]);
        let aligned = align_words(&original, &words("Hello world again")).unwrap();

        assert_eq!(timeline_text(&aligned), "Hello world again");
        assert_eq!(spans(&aligned), vec![(0.0, 0.4), (0.5, 1.1), (1.2, 1.6)]);
        assert!(aligned.iter().all(|w| w.kind == "word"));
    }

    #[test]
    fn fewer_corrected_words_span_several_segments() {
        let original = timeline(&[("a", 0.0, 1.0), ("b", 1.0, 2.0), ("c", 2.0, 3.0), ("d", 3.0, 4.0)]);
        let aligned = align_words(&original, &words("ab cd")).unwrap();

        assert_eq!(spans(&aligned), vec![(0.0, 2.0), (2.0, 4.0)]);
    }

    #[test]
    fn more_corrected_words_split_segments() {
        let original = timeline(&[("gm", 0.0, 1.0), ("frens", 1.0, 2.0)]);
        let aligned = align_words(&original, &words("good morning my friends")).unwrap();

        assert_eq!(aligned.len(), 4);
        assert_eq!(
            spans(&aligned),
            vec![(0.0, 0.5), (0.5, 1.0), (1.0, 1.5), (1.5, 2.0)]
        );
    }

    #[test]
    fn uneven_ratio_stays_monotonic_and_bounded() {
        let original = timeline(&[
            ("one", 0.0, 0.3),
            ("two", 0.4, 0.9),
            ("three", 1.0, 1.2),
            ("four", 1.5, 2.5),
            ("five", 2.6, 3.0),
        ]);
        let aligned = align_words(&original, &words("one two three")).unwrap();

        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[0].start_time, 0.0);
        assert_eq!(aligned[2].end_time, 3.0);
        for pair in aligned.windows(2) {
            assert!(pair[0].start_time <= pair[0].end_time);
            assert!(pair[0].end_time <= pair[1].start_time);
        }
    }

    #[test]
    fn empty_inputs_are_alignment_errors() {
        let original = timeline(&[("a", 0.0, 1.0)]);
        assert_eq!(
            align_words(&[], &words("a")),
            Err(AlignmentError::EmptyTimeline)
        );
        assert_eq!(
            align_words(&original, &[]),
            Err(AlignmentError::EmptyCorrection)
        );
    }

    #[test]
    fn deserializes_provider_transcript() {
        let json = r#"[{"text":"gm","type":"word","start_time":0.1,"end_time":0.4},
                       {"text":"all","start_time":0.5,"end_time":0.8}]"#;
        let parsed: Vec<TimedWord> = serde_json::from_str(json).unwrap();

        assert_eq!(parsed[0], TimedWord::new("gm", 0.1, 0.4));
        assert_eq!(parsed[1].kind, "word");
    }
}
