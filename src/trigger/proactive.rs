//! Proactive scanner: reads a roster of accounts and answers one relevant
//! post per cycle without being asked.

use crate::config::{Config, ProactiveConfig};
use crate::error::Result;
use crate::pipeline::{Orchestrator, RunPlan};
use crate::platform::{Post, ReferenceKind, SocialFeed};
use crate::provider::GenerationRequest;
use crate::trigger::{CycleReport, error_backoff, pause};
use crate::{Modality, ReplyTarget, TriggerEvent, TriggerSource};

use chrono::{DateTime, Duration, Utc};
use rand::Rng as _;
use tokio::sync::watch;

use std::sync::Arc;

/// A post that passed every pre-run check, with the roster account it came from.
#[derive(Debug, Clone)]
struct Candidate {
    handle: String,
    post: Post,
}

pub struct ProactiveScanner {
    feed: Arc<dyn SocialFeed>,
    orchestrator: Arc<Orchestrator>,
    config: ProactiveConfig,
    relevance_max_tokens: u32,
}

impl ProactiveScanner {
    pub fn new(feed: Arc<dyn SocialFeed>, orchestrator: Arc<Orchestrator>, config: &Config) -> Self {
        Self {
            feed,
            orchestrator,
            config: config.proactive.clone(),
            relevance_max_tokens: config.llm.relevance_max_tokens,
        }
    }

    fn plan(&self) -> RunPlan {
        RunPlan {
            modality: Modality::Video,
            captions: self.config.captions,
            generation: self.config.generation,
            policy: self.config.per_account.policy(),
            post_caption: true,
        }
    }

    /// Collect candidates from the whole roster and answer one of them.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let since = now - Duration::minutes(self.config.lookback_mins);
        let policy = self.config.per_account.policy();
        let ledger = self.orchestrator.ledger();
        let mut report = CycleReport::default();
        let mut candidates = Vec::new();

        for handle in &self.config.roster {
            let posts = self
                .feed
                .recent_posts_by(handle, since, self.config.max_posts_per_account)
                .await?;
            report.fetched += posts.len();
            if posts.is_empty() {
                continue;
            }

            if ledger
                .is_rate_limited(TriggerSource::Proactive, handle, policy)
                .await?
            {
                tracing::debug!(%handle, "account at its response limit, skipping");
                continue;
            }

            for post in posts {
                if ledger.is_duplicate(&post.id).await? {
                    continue;
                }
                if self.is_relevant(&post).await {
                    candidates.push(Candidate {
                        handle: handle.clone(),
                        post,
                    });
                }
            }
        }

        report.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(report);
        }

        let chosen = candidates.swap_remove(rand::rng().random_range(0..candidates.len()));
        tracing::info!(
            handle = %chosen.handle,
            post_id = %chosen.post.id,
            "picked post to answer"
        );
        let event = self.build_event(chosen).await?;
        let outcome = self.orchestrator.handle(&event, &self.plan()).await?;
        report.record(&outcome);
        Ok(report)
    }

    /// Yes/no topical check. A failed call counts as not relevant.
    async fn is_relevant(&self, post: &Post) -> bool {
        let prompt = match self
            .orchestrator
            .prompts()
            .render_relevance(&self.config.relevance_topics, &post.text)
        {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!(%error, "failed to render relevance prompt");
                return false;
            }
        };

        let request = GenerationRequest::new(prompt, self.relevance_max_tokens);
        match self.orchestrator.providers().text.generate(request).await {
            Ok(answer) => {
                let relevant = answer.to_lowercase().contains("yes");
                tracing::debug!(post_id = %post.id, relevant, "relevance checked");
                relevant
            }
            Err(error) => {
                tracing::warn!(post_id = %post.id, %error, "relevance check failed, skipping post");
                false
            }
        }
    }

    async fn build_event(&self, candidate: Candidate) -> Result<TriggerEvent> {
        let Candidate { handle, post } = candidate;
        let attached_image_refs = self.image_refs(&post).await?;
        let channel_id = post.conversation_id.clone().unwrap_or_else(|| post.id.clone());

        Ok(TriggerEvent {
            source: TriggerSource::Proactive,
            channel_id: channel_id.clone(),
            author_id: handle.clone(),
            author_handle: handle,
            text: post.text,
            thread_context: Vec::new(),
            attached_image_refs,
            dedup_key: post.id.clone(),
            modality: Modality::Video,
            reply_to: ReplyTarget {
                channel_id,
                parent_id: Some(post.id),
            },
        })
    }

    /// Photos on the post, else on the post it quotes.
    async fn image_refs(&self, post: &Post) -> Result<Vec<String>> {
        if !post.image_urls.is_empty() {
            return Ok(post.image_urls.clone());
        }
        let Some(quoted_id) = post.reference(ReferenceKind::Quoted) else {
            return Ok(Vec::new());
        };
        Ok(self
            .feed
            .get_post(quoted_id)
            .await?
            .map(|quoted| quoted.image_urls)
            .unwrap_or_default())
    }

    /// Scan every `cycle_secs` until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(accounts = self.config.roster.len(), "proactive scanner started");
        loop {
            let delay = match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    tracing::info!(
                        fetched = report.fetched,
                        candidates = report.candidates,
                        completed = report.completed,
                        failed = report.failed,
                        "proactive cycle finished"
                    );
                    std::time::Duration::from_secs(self.config.cycle_secs)
                }
                Err(error) => {
                    let delay = error_backoff(&error, &self.config.error_backoff);
                    tracing::error!(%error, delay_secs = delay.as_secs(), "proactive cycle failed");
                    delay
                }
            };
            if !pause(delay, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("proactive scanner stopped");
    }
}
