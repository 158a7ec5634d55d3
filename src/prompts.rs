//! Prompt templates rendered with minijinja.

use crate::error::Result;

use anyhow::Context as _;
use minijinja::{Environment, context};

const RESPONSE: &str = r#"{{ persona_prompt }}
{{ prompt }}
{%- if image_analysis %}

Note: an analysis of the attached image is included below. Draw on it when the message asks about the image or when it supports your answer; describe the picture precisely if asked. Otherwise ignore it.

Image analysis:
{{ image_analysis }}
{%- endif %}"#;

const IMAGE_DESCRIPTION: &str = "Describe precisely and objectively what this image shows, then give your opinion. \
Group any numbers attached to tokens or NFTs and describe them together. \
If it is a price chart, say whether it looks bullish, bearish or neutral: a large red final candle suggests a rug pull, a large green one suggests a pump. \
If it is not a chart, do not mention charts.";

const POST_CAPTION: &str = r#"{%- if thread_context -%}
Post context: {{ thread_context }}
{{ persona_name }}'s response: {{ response }}
{%- else -%}
You are {{ persona_name }} and you are writing a short post about something you just said: {{ response }}
{%- endif %}
Requirements:
1. At most 10 words
2. Provocative, funny or intriguing, whichever fits the response
3. @mention a person only if the response is about that person
4. No openers such as "Here's", "Discover" or "Watch"
5. Build suspense instead of summarizing
6. No emoji
7. Return only the post text
8. Write as {{ persona_name }}, not about {{ persona_name }}"#;

const TRANSCRIPT_CORRECTION: &str = r#"Correct a speech transcription so its words match a reference text.
Return only the corrected words separated by single spaces, with no introduction or commentary.

Original transcription: {{ original }}
Reference text: {{ reference }}

Rules:
1. Fix spelling, case and punctuation to match the reference exactly
2. Keep one output word per original word wherever possible
3. Output nothing except the words"#;

const RELEVANCE: &str = r#"Decide whether the following post is about any of these topics:
{%- for topic in topics %}
({{ loop.index }}) {{ topic }}
{%- endfor %}

Answer only "yes" or "no".

Post: {{ post }}"#;

/// Renders every prompt the pipeline and front-ends send to the text generator.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("response", RESPONSE)
            .context("failed to add response template")?;
        env.add_template("post_caption", POST_CAPTION)
            .context("failed to add post_caption template")?;
        env.add_template("transcript_correction", TRANSCRIPT_CORRECTION)
            .context("failed to add transcript_correction template")?;
        env.add_template("relevance", RELEVANCE)
            .context("failed to add relevance template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("template {name} not registered"))?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("failed to render {name} prompt"))?;
        Ok(rendered)
    }

    /// User turn for the persona's reply. The persona prompt also goes out as
    /// the system context.
    pub fn render_response(
        &self,
        persona_prompt: &str,
        prompt: &str,
        image_analysis: Option<&str>,
    ) -> Result<String> {
        self.render(
            "response",
            context! { persona_prompt, prompt, image_analysis },
        )
    }

    pub fn image_description(&self) -> &'static str {
        IMAGE_DESCRIPTION
    }

    pub fn render_post_caption(
        &self,
        persona_name: &str,
        response: &str,
        thread_context: &str,
    ) -> Result<String> {
        self.render(
            "post_caption",
            context! { persona_name, response, thread_context },
        )
    }

    pub fn render_transcript_correction(&self, original: &str, reference: &str) -> Result<String> {
        self.render("transcript_correction", context! { original, reference })
    }

    pub fn render_relevance(&self, topics: &[String], post: &str) -> Result<String> {
        self.render("relevance", context! { topics, post })
    }
}

/// Join per-image descriptions the way they are fed back into the prompt.
pub fn join_image_analyses(analyses: &[String]) -> Option<String> {
    match analyses {
        [] => None,
        [single] => Some(single.clone()),
        many => Some(
            many.iter()
                .enumerate()
                .map(|(index, analysis)| format!("Image {} :\n{analysis}", index + 1))
                .collect::<Vec<_>>()
                .join("\n\n"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_includes_image_analysis_only_when_present() {
        let engine = PromptEngine::new().unwrap();

        let plain = engine
            .render_response("You are Lea.", "gm", None)
            .unwrap();
        assert_eq!(plain, "You are Lea.\ngm");

        let with_image = engine
            .render_response("You are Lea.", "what is this?", Some("a green candle"))
            .unwrap();
        assert!(with_image.starts_with("You are Lea.\nwhat is this?"));
        assert!(with_image.ends_with("Image analysis:\na green candle"));
    }

    #[test]
    fn post_caption_switches_on_thread_context() {
        let engine = PromptEngine::new().unwrap();

        let threaded = engine
            .render_post_caption("Lea", "BTC to the moon", "is btc dead?")
            .unwrap();
        assert!(threaded.starts_with("Post context: is btc dead?\nLea's response: BTC to the moon"));

        let standalone = engine
            .render_post_caption("Lea", "BTC to the moon", "")
            .unwrap();
        assert!(standalone.starts_with("You are Lea and"));
        assert!(standalone.contains("At most 10 words"));
    }

    #[test]
    fn relevance_numbers_topics() {
        let engine = PromptEngine::new().unwrap();
        let rendered = engine
            .render_relevance(&["crypto".into(), "AI".into()], "new model dropped")
            .unwrap();

        assert!(rendered.contains("(1) crypto\n(2) AI"));
        assert!(rendered.ends_with("Post: new model dropped"));
    }

    #[test]
    fn image_analyses_are_numbered_when_several() {
        assert_eq!(join_image_analyses(&[]), None);
        assert_eq!(
            join_image_analyses(&["a cat".into()]).as_deref(),
            Some("a cat")
        );
        assert_eq!(
            join_image_analyses(&["a cat".into(), "a dog".into()]).as_deref(),
            Some("Image 1 :\na cat\n\nImage 2 :\na dog")
        );
    }
}
