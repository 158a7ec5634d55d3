//! Chat front-end: answers mentions in allowlisted Telegram groups.
//!
//! A message must mention the bot and carry a mode marker. Each user gets one
//! response per cooldown; accepted runs go through a bounded pool of permits.

use crate::config::{Config, TelegramConfig};
use crate::error::{Rejection, Result};
use crate::ledger::Admission;
use crate::pipeline::{Orchestrator, RunPlan};
use crate::trigger::text::{contains_mention, mode_marker, strip_mode_markers};
use crate::{Modality, ReplyTarget, TriggerEvent, TriggerSource};

use teloxide::prelude::*;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use std::sync::Arc;

const MISSING_MARKER_NOTICE: &str = "Specify '/video/' or '/audio/' to choose the response type.";
const RUN_FAILED_NOTICE: &str = "An error occurred while processing your request.";

/// A chat message reduced to what the listener needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub chat_id: i64,
    pub message_id: i32,
    pub user_id: String,
    pub username: String,
    pub text: String,
}

impl ChatMessage {
    /// `None` for messages without text or without a sender.
    pub fn from_telegram(message: &Message) -> Option<Self> {
        let text = message.text()?;
        let from = message.from.as_ref()?;
        Some(Self {
            chat_id: message.chat.id.0,
            message_id: message.id.0,
            user_id: from.id.0.to_string(),
            username: from
                .username
                .clone()
                .unwrap_or_else(|| from.first_name.clone()),
            text: text.to_string(),
        })
    }

    pub fn dedup_key(&self) -> String {
        format!("tg:{}:{}", self.chat_id, self.message_id)
    }

    fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            channel_id: self.chat_id.to_string(),
            parent_id: Some(self.message_id.to_string()),
        }
    }

    fn is_start_command(&self) -> bool {
        let command = self.text.split_whitespace().next().unwrap_or_default();
        command == "/start" || command.starts_with("/start@")
    }

    fn to_event(&self, modality: Modality) -> TriggerEvent {
        TriggerEvent {
            source: TriggerSource::Chat,
            channel_id: self.chat_id.to_string(),
            author_id: self.user_id.clone(),
            author_handle: self.username.clone(),
            text: strip_mode_markers(&self.text),
            thread_context: Vec::new(),
            attached_image_refs: Vec::new(),
            dedup_key: self.dedup_key(),
            modality,
            reply_to: self.reply_target(),
        }
    }
}

/// What the listener did with one message.
#[derive(Debug)]
pub enum ChatOutcome {
    Ignored(Rejection),
    /// A text notice was sent back instead of a run.
    Notified(String),
    /// A run was accepted and is running on its own task.
    Dispatched(JoinHandle<()>),
}

pub struct ChatListener {
    orchestrator: Arc<Orchestrator>,
    config: TelegramConfig,
    persona_name: String,
    permits: Arc<Semaphore>,
}

impl ChatListener {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &Config) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(config.telegram.max_concurrent_runs.max(1))),
            config: config.telegram.clone(),
            persona_name: config.persona.name.clone(),
        }
    }

    fn plan(&self, modality: Modality) -> RunPlan {
        RunPlan {
            modality,
            captions: self.config.captions,
            generation: self.config.generation,
            policy: self.config.rate_policy(),
            post_caption: false,
        }
    }

    fn greeting(&self) -> String {
        format!(
            "Hello! I am {}. Mention me and choose /video/ or /audio/.",
            self.persona_name
        )
    }

    fn cooldown_notice(&self) -> String {
        format!(
            "Please wait {} min before mentioning me again.",
            self.config.cooldown_secs.div_ceil(60)
        )
    }

    async fn notify(&self, message: &ChatMessage, text: String) -> Result<ChatOutcome> {
        self.orchestrator
            .publisher()
            .notify(&message.reply_target(), &text)
            .await?;
        Ok(ChatOutcome::Notified(text))
    }

    /// Decide what to do with one message and start a run when it qualifies.
    #[tracing::instrument(skip_all, fields(chat_id = message.chat_id, message_id = message.message_id))]
    pub async fn on_message(&self, message: &ChatMessage) -> Result<ChatOutcome> {
        if message.is_start_command() {
            return self.notify(message, self.greeting()).await;
        }
        if !self.config.allowed_chat_ids.contains(&message.chat_id) {
            tracing::debug!("ignoring message from chat outside the allowlist");
            return Ok(ChatOutcome::Ignored(Rejection::DisallowedChannel(
                message.chat_id.to_string(),
            )));
        }
        if !contains_mention(&message.text, &self.config.mention) {
            return Ok(ChatOutcome::Ignored(Rejection::NotAMention));
        }
        let Some(modality) = mode_marker(&message.text) else {
            return self.notify(message, MISSING_MARKER_NOTICE.to_string()).await;
        };

        let event = message.to_event(modality);
        let plan = self.plan(modality);
        match self.orchestrator.admit(&event, plan.policy).await? {
            Admission::Accepted => {}
            Admission::Rejected(Rejection::RateLimited { .. }) => {
                return self.notify(message, self.cooldown_notice()).await;
            }
            Admission::Rejected(rejection) => return Ok(ChatOutcome::Ignored(rejection)),
        }

        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let run = orchestrator.run_admitted(&event, &plan).await;
            if run.is_completed() {
                return;
            }
            if let Err(error) = orchestrator
                .publisher()
                .notify(&event.reply_to, RUN_FAILED_NOTICE)
                .await
            {
                tracing::warn!(dedup_key = %event.dedup_key, %error, "failed to send failure notice");
            }
        });
        Ok(ChatOutcome::Dispatched(handle))
    }

    /// Long-poll Telegram until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, bot: Bot, mut shutdown: watch::Receiver<bool>) {
        let listener = self.clone();
        let handler = Update::filter_message().endpoint(move |message: Message| {
            let listener = listener.clone();
            async move {
                let Some(message) = ChatMessage::from_telegram(&message) else {
                    return respond(());
                };
                if let Err(error) = listener.on_message(&message).await {
                    tracing::error!(%error, chat_id = message.chat_id, "failed to handle chat message");
                }
                respond(())
            }
        });

        let mut dispatcher = Dispatcher::builder(bot, handler)
            .default_handler(|_| async {})
            .build();

        let token = dispatcher.shutdown_token();
        tokio::spawn(async move {
            let _ = shutdown.wait_for(|shutdown| *shutdown).await;
            if let Ok(stopped) = token.shutdown() {
                stopped.await;
            }
        });

        tracing::info!(
            chats = self.config.allowed_chat_ids.len(),
            permits = self.config.max_concurrent_runs,
            "chat listener started"
        );
        dispatcher.dispatch().await;
        tracing::info!("chat listener stopped");
    }
}
