//! Telegram delivery: media replies and plain notices through the Bot API.

use crate::config::TelegramConfig;
use crate::error::{ConfigError, ProviderError, Result};
use crate::platform::Publisher;
use crate::provider::require;
use crate::{MediaFile, MediaKind, ReplyTarget};

use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ReplyParameters};

const PLATFORM: &str = "telegram";

pub struct TelegramPublisher {
    bot: Bot,
}

impl TelegramPublisher {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        let token = require(&config.bot_token, "telegram.bot_token")?;
        Ok(Self::new(Bot::new(token)))
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn chat_id(target: &ReplyTarget) -> Result<ChatId> {
    target
        .channel_id
        .parse::<i64>()
        .map(ChatId)
        .map_err(|error| {
            ConfigError::Invalid(format!("invalid telegram chat id {}: {error}", target.channel_id))
                .into()
        })
}

fn reply_to(target: &ReplyTarget) -> Option<ReplyParameters> {
    target
        .parent_id
        .as_deref()
        .and_then(|id| id.parse::<i32>().ok())
        .map(|id| ReplyParameters::new(MessageId(id)))
}

fn input_file(media: &MediaFile) -> InputFile {
    let file = InputFile::file(media.path.clone());
    match media.path.file_name() {
        Some(name) => file.file_name(name.to_string_lossy().into_owned()),
        None => file,
    }
}

fn send_error(error: teloxide::RequestError) -> crate::Error {
    ProviderError::request(PLATFORM, error).into()
}

impl Publisher for TelegramPublisher {
    fn name(&self) -> &str {
        PLATFORM
    }

    async fn publish(&self, target: &ReplyTarget, media: &MediaFile, text: &str) -> Result<String> {
        let chat_id = chat_id(target)?;
        let reply = reply_to(target);
        let file = input_file(media);

        let sent = match media.kind {
            MediaKind::Audio => {
                let mut request = self.bot.send_audio(chat_id, file);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                if !text.is_empty() {
                    request = request.caption(text);
                }
                request.await.map_err(send_error)?
            }
            MediaKind::Video => {
                let mut request = self.bot.send_video(chat_id, file);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                if !text.is_empty() {
                    request = request.caption(text);
                }
                request.await.map_err(send_error)?
            }
            MediaKind::Image => {
                let mut request = self.bot.send_photo(chat_id, file);
                if let Some(reply) = reply {
                    request = request.reply_parameters(reply);
                }
                if !text.is_empty() {
                    request = request.caption(text);
                }
                request.await.map_err(send_error)?
            }
        };

        tracing::debug!(chat_id = chat_id.0, message_id = sent.id.0, "telegram media sent");
        Ok(sent.id.0.to_string())
    }

    async fn notify(&self, target: &ReplyTarget, text: &str) -> Result<()> {
        let mut request = self.bot.send_message(chat_id(target)?, text);
        if let Some(reply) = reply_to(target) {
            request = request.reply_parameters(reply);
        }
        request.await.map_err(send_error)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.bot.get_me().await.map_err(send_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_target_parsing() {
        let target = ReplyTarget {
            channel_id: "-1002484970203".into(),
            parent_id: Some("42".into()),
        };
        assert_eq!(chat_id(&target).unwrap(), ChatId(-1002484970203));
        assert_eq!(
            reply_to(&target).map(|reply| reply.message_id),
            Some(MessageId(42))
        );

        let bad = ReplyTarget {
            channel_id: "general".into(),
            parent_id: None,
        };
        assert!(chat_id(&bad).is_err());
        assert!(reply_to(&bad).is_none());
    }

    #[test]
    fn missing_token_is_reported() {
        let error = TelegramPublisher::from_config(&TelegramConfig::default())
            .err()
            .unwrap();
        assert!(error.to_string().contains("telegram.bot_token"));
    }
}
