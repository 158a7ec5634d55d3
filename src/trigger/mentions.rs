//! Mention watcher: polls the social platform for posts addressing the
//! persona and answers each conversation at most once.

use crate::config::{Config, MentionConfig};
use crate::error::{ConfigError, Rejection, Result};
use crate::pipeline::{HandleOutcome, Orchestrator, RunPlan};
use crate::platform::{Post, ReferenceKind, SocialFeed};
use crate::trigger::text::{contains_mention, content_word_count};
use crate::trigger::{CycleReport, error_backoff, pause};
use crate::{Modality, ReplyTarget, TriggerEvent, TriggerSource};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use std::sync::Arc;

pub struct MentionWatcher {
    feed: Arc<dyn SocialFeed>,
    orchestrator: Arc<Orchestrator>,
    config: MentionConfig,
    persona_id: String,
    mention_tag: String,
    /// Highest post id seen by the last successful cycle.
    since_id: Option<String>,
}

impl MentionWatcher {
    pub fn new(
        feed: Arc<dyn SocialFeed>,
        orchestrator: Arc<Orchestrator>,
        config: &Config,
    ) -> Result<Self> {
        let persona_id = config
            .persona
            .user_id
            .clone()
            .ok_or_else(|| ConfigError::MissingKey("persona.user_id".into()))?;
        Ok(Self {
            feed,
            orchestrator,
            config: config.mentions.clone(),
            persona_id,
            mention_tag: config.persona.mention_tag(),
            since_id: None,
        })
    }

    pub fn since_id(&self) -> Option<&str> {
        self.since_id.as_deref()
    }

    fn plan(&self) -> RunPlan {
        RunPlan {
            modality: Modality::Video,
            captions: self.config.captions,
            generation: self.config.generation,
            policy: self.config.per_author.policy(),
            post_caption: true,
        }
    }

    /// Fetch new mentions and handle each one in id order.
    ///
    /// The recency window only applies to the first search, which has no
    /// cursor yet. After that every mention past the cursor is handled. The
    /// cursor only advances when the whole batch was processed, so a failed
    /// cycle is retried and already claimed threads are skipped by the ledger.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let query = format!("{} -is:retweet", self.mention_tag);
        let posts = self
            .feed
            .search_recent(&query, self.since_id.as_deref(), self.config.max_results)
            .await?;

        let mut report = CycleReport {
            fetched: posts.len(),
            ..CycleReport::default()
        };
        let Some(newest) = posts.iter().max_by_key(|post| post.numeric_id()) else {
            return Ok(report);
        };
        let newest = newest.id.clone();

        let mut candidates: Vec<Post> = posts
            .into_iter()
            .filter(|post| contains_mention(&post.text, &self.mention_tag))
            .collect();
        if self.since_id.is_none() {
            candidates = self.recent(candidates, now);
        }
        candidates.sort_by_key(Post::numeric_id);
        report.candidates = candidates.len();

        for post in &candidates {
            let outcome = self.handle_post(post).await?;
            report.record(&outcome);
        }

        self.since_id = Some(newest);
        Ok(report)
    }

    /// Posts from the recent window, widening to the fallback window when the
    /// recent one is empty. Posts without a timestamp are kept.
    fn recent(&self, posts: Vec<Post>, now: DateTime<Utc>) -> Vec<Post> {
        let within = |post: &Post, minutes: i64| {
            post.created_at
                .is_none_or(|created| now - created <= Duration::minutes(minutes))
        };
        if posts
            .iter()
            .any(|post| within(post, self.config.recent_window_mins))
        {
            return posts
                .into_iter()
                .filter(|post| within(post, self.config.recent_window_mins))
                .collect();
        }
        tracing::debug!(
            fallback_mins = self.config.fallback_window_mins,
            "no recent mentions, widening window"
        );
        posts
            .into_iter()
            .filter(|post| within(post, self.config.fallback_window_mins))
            .collect()
    }

    #[tracing::instrument(skip_all, fields(post_id = %post.id, author_id = %post.author_id))]
    async fn handle_post(&self, post: &Post) -> Result<HandleOutcome> {
        match self.build_event(post).await? {
            Ok(event) => self.orchestrator.handle(&event, &self.plan()).await,
            Err(rejection) => {
                tracing::debug!(%rejection, "mention skipped");
                Ok(HandleOutcome::Rejected(rejection))
            }
        }
    }

    /// Apply the mention filters and resolve the thread into a trigger.
    async fn build_event(&self, post: &Post) -> Result<std::result::Result<TriggerEvent, Rejection>> {
        if post.in_reply_to_user_id.as_deref() == Some(self.persona_id.as_str()) {
            return Ok(Err(Rejection::ReplyToPersona));
        }
        if post.author_id == self.persona_id {
            return Ok(Err(Rejection::SelfAuthored));
        }
        let words = content_word_count(&post.text);
        if words < self.config.min_words {
            return Ok(Err(Rejection::BelowWordThreshold {
                found: words,
                required: self.config.min_words,
            }));
        }

        let root_id = post.conversation_id.clone().unwrap_or_else(|| post.id.clone());
        let root = if root_id == post.id {
            Some(post.clone())
        } else {
            self.feed.get_post(&root_id).await?
        };
        if root
            .as_ref()
            .is_some_and(|root| root.author_id == self.persona_id)
        {
            return Ok(Err(Rejection::PersonaThread));
        }

        if self.orchestrator.ledger().is_duplicate(&root_id).await? {
            return Ok(Err(Rejection::Duplicate(root_id)));
        }

        let thread_context = self.thread_context(post, &root_id, root).await?;
        let attached_image_refs = self.image_refs(post).await?;

        Ok(Ok(TriggerEvent {
            source: TriggerSource::Mention,
            channel_id: root_id.clone(),
            author_id: post.author_id.clone(),
            author_handle: post
                .author_handle
                .clone()
                .unwrap_or_else(|| post.author_id.clone()),
            text: post.text.clone(),
            thread_context,
            attached_image_refs,
            dedup_key: root_id.clone(),
            modality: Modality::Video,
            reply_to: ReplyTarget {
                channel_id: root_id,
                parent_id: Some(post.id.clone()),
            },
        }))
    }

    /// Texts of the thread before `post`: the root, then replies in id order.
    async fn thread_context(
        &self,
        post: &Post,
        root_id: &str,
        root: Option<Post>,
    ) -> Result<Vec<String>> {
        let mut thread: Vec<Post> = root.into_iter().collect();
        thread.extend(
            self.feed
                .conversation(root_id)
                .await?
                .into_iter()
                .filter(|reply| reply.id != root_id),
        );
        thread.sort_by_key(Post::numeric_id);

        let trigger_id = post.numeric_id();
        Ok(thread
            .into_iter()
            .filter(|earlier| earlier.id != post.id && earlier.numeric_id() < trigger_id)
            .map(|earlier| earlier.text)
            .collect())
    }

    /// Photos on the post, else on the post it replies to.
    async fn image_refs(&self, post: &Post) -> Result<Vec<String>> {
        if !post.image_urls.is_empty() {
            return Ok(post.image_urls.clone());
        }
        let Some(parent_id) = post.reference(ReferenceKind::RepliedTo) else {
            return Ok(Vec::new());
        };
        Ok(self
            .feed
            .get_post(parent_id)
            .await?
            .map(|parent| parent.image_urls)
            .unwrap_or_default())
    }

    /// Poll until `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(mention = %self.mention_tag, "mention watcher started");
        loop {
            let delay = match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    tracing::info!(
                        fetched = report.fetched,
                        candidates = report.candidates,
                        completed = report.completed,
                        failed = report.failed,
                        rejected = report.rejected,
                        since_id = self.since_id.as_deref().unwrap_or_default(),
                        "mention cycle finished"
                    );
                    self.config.cycle_delay.sample()
                }
                Err(error) => {
                    let delay = error_backoff(&error, &self.config.error_backoff);
                    tracing::error!(%error, delay_secs = delay.as_secs(), "mention cycle failed");
                    delay
                }
            };
            if !pause(delay, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("mention watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RecordStatus;
    use crate::pipeline::testing::{Harness, harness, post};
    use crate::platform::ReferencedPost;

    fn watcher(h: &Harness) -> MentionWatcher {
        MentionWatcher::new(h.world.clone(), h.orchestrator.clone(), &h.config).unwrap()
    }

    fn reply(id: &str, author: &str, text: &str, root: &str, parent: &str) -> Post {
        Post {
            conversation_id: Some(root.into()),
            referenced: vec![ReferencedPost {
                kind: ReferenceKind::RepliedTo,
                id: parent.into(),
            }],
            ..post(id, author, text)
        }
    }

    fn at(now: DateTime<Utc>, minutes_ago: i64, post: Post) -> Post {
        Post {
            created_at: Some(now - Duration::minutes(minutes_ago)),
            ..post
        }
    }

    #[tokio::test]
    async fn thread_reply_is_answered_once() {
        let now = Utc::now();
        let root = post("100", "u1", "is btc dead?");
        let mention = reply("101", "u2", "@lea_gpt what do you think?", "100", "100");
        let later = reply("105", "u3", "following", "100", "101");
        let h = harness(|state| {
            state.posts.insert("100".into(), root.clone());
            state
                .conversations
                .insert("100".into(), vec![later.clone(), mention.clone()]);
            state.search_results = vec![at(now, 1, mention.clone())];
        })
        .await;
        let mut watcher = watcher(&h);

        let report = watcher.run_cycle(now).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(watcher.since_id(), Some("101"));

        {
            let state = h.world.state.lock();
            assert_eq!(state.searches[0], ("@lea_gpt -is:retweet".to_string(), None));
            assert_eq!(state.published.len(), 1);
            let published = &state.published[0];
            assert_eq!(published.target.channel_id, "100");
            assert_eq!(published.target.parent_id.as_deref(), Some("101"));
            assert_eq!(published.text, "the moon is close");

            let response = state
                .generate_calls
                .iter()
                .find(|request| request.system.is_some())
                .unwrap();
            assert!(response.prompt.contains("is btc dead? @lea_gpt what do you think?"));
            assert!(!response.prompt.contains("following"));
        }

        let record = h.ledger().get("100").await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);

        let report = watcher.run_cycle(now).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(
            h.world.state.lock().searches[1].1.as_deref(),
            Some("101")
        );
    }

    #[tokio::test]
    async fn second_mention_in_a_thread_is_a_duplicate() {
        let now = Utc::now();
        let h = harness(|state| {
            state.posts.insert("100".into(), post("100", "u1", "root"));
            state.search_results = vec![
                reply("101", "u2", "@lea_gpt first", "100", "100"),
                reply("102", "u3", "@lea_gpt second", "100", "100"),
            ];
        })
        .await;
        let mut watcher = watcher(&h);

        let report = watcher.run_cycle(now).await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.rejected, 1);
        let state = h.world.state.lock();
        assert_eq!(state.published.len(), 1);
        assert_eq!(state.published[0].target.parent_id.as_deref(), Some("101"));
    }

    #[tokio::test]
    async fn filtered_mentions_reach_no_provider() {
        let now = Utc::now();
        let h = harness(|state| {
            state.posts.insert("200".into(), post("200", "999", "persona thread"));
            state.search_results = vec![
                post("301", "999", "@lea_gpt talking to myself"),
                Post {
                    in_reply_to_user_id: Some("999".into()),
                    ..post("302", "u1", "@lea_gpt thanks for the reply")
                },
                post("303", "u1", "@lea_gpt 🚀🚀"),
                reply("304", "u2", "@lea_gpt nice thread", "200", "200"),
                post("305", "u3", "talking about lea_gpt without tagging"),
            ];
        })
        .await;
        let mut watcher = watcher(&h);

        let report = watcher.run_cycle(now).await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(report.candidates, 4);
        assert_eq!(report.rejected, 4);
        assert_eq!(watcher.since_id(), Some("305"));

        let state = h.world.state.lock();
        assert!(state.generate_calls.is_empty());
        assert!(state.published.is_empty());
    }

    #[tokio::test]
    async fn recency_window_widens_when_empty() {
        let now = Utc::now();
        let h = harness(|state| {
            state.search_results = vec![
                at(now, 30, post("401", "u1", "@lea_gpt half an hour ago")),
                at(now, 120, post("402", "u2", "@lea_gpt two hours ago")),
            ];
        })
        .await;
        let mut widened = watcher(&h);

        let report = widened.run_cycle(now).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(h.world.state.lock().published[0].target.parent_id.as_deref(), Some("401"));

        let h = harness(|state| {
            state.search_results = vec![
                at(now, 5, post("501", "u1", "@lea_gpt just now")),
                at(now, 30, post("502", "u2", "@lea_gpt a while ago")),
            ];
        })
        .await;
        let mut fresh = watcher(&h);
        let report = fresh.run_cycle(now).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(h.world.state.lock().published[0].target.parent_id.as_deref(), Some("501"));
    }

    #[tokio::test]
    async fn older_mentions_after_the_cursor_are_still_answered() {
        let now = Utc::now();
        let h = harness(|state| {
            state.search_results = vec![at(now, 1, post("590", "u1", "@lea_gpt gm"))];
        })
        .await;
        let mut watcher = watcher(&h);
        watcher.run_cycle(now).await.unwrap();
        assert_eq!(watcher.since_id(), Some("590"));

        // A long backoff later, one fresh and one stale mention arrive together.
        h.world.state.lock().search_results = vec![
            at(now, 2, post("601", "u2", "@lea_gpt what about eth?")),
            at(now, 14, post("600", "u3", "@lea_gpt and sol?")),
        ];
        let report = watcher.run_cycle(now).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(watcher.since_id(), Some("601"));

        for key in ["600", "601"] {
            let record = h.ledger().get(key).await.unwrap().unwrap();
            assert_eq!(record.status, RecordStatus::Completed);
        }
        let state = h.world.state.lock();
        let answered: Vec<_> = state
            .published
            .iter()
            .filter_map(|published| published.target.parent_id.as_deref())
            .collect();
        assert_eq!(answered, vec!["590", "600", "601"]);
    }

    #[tokio::test]
    async fn images_fall_back_to_the_parent_post() {
        let now = Utc::now();
        let parent = Post {
            image_urls: vec!["https://img/chart.png".into()],
            ..post("600", "u1", "look at this chart")
        };
        let h = harness(|state| {
            state.posts.insert("600".into(), parent.clone());
            state.search_results = vec![reply("601", "u2", "@lea_gpt is this bullish?", "600", "600")];
        })
        .await;
        let mut watcher = watcher(&h);

        watcher.run_cycle(now).await.unwrap();
        let state = h.world.state.lock();
        let vision = state
            .generate_calls
            .iter()
            .filter(|request| !request.images.is_empty())
            .count();
        assert_eq!(vision, 1);
        assert_eq!(state.published.len(), 1);
    }

    #[tokio::test]
    async fn feed_error_keeps_the_cursor() {
        let now = Utc::now();
        let h = harness(|state| state.fail_feed = true).await;
        let mut watcher = watcher(&h);

        assert!(watcher.run_cycle(now).await.is_err());
        assert_eq!(watcher.since_id(), None);
    }

    #[tokio::test]
    async fn watcher_requires_persona_id() {
        let h = harness(|_| {}).await;
        let mut config = h.config.clone();
        config.persona.user_id = None;
        assert!(MentionWatcher::new(h.world.clone(), h.orchestrator.clone(), &config).is_err());
    }
}
