//! Delivery trait with its dynamic dispatch companion, and the read side of
//! social platforms.

use crate::error::{ProviderError, Result};
use crate::{MediaFile, ReplyTarget};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::pin::Pin;

/// Static trait for delivery adapters.
/// Use this for type-safe implementations.
pub trait Publisher: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Deliver a finished response and return the platform's id for it.
    fn publish(
        &self,
        target: &ReplyTarget,
        media: &MediaFile,
        text: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Send a plain text notice (cooldown hints, error messages).
    fn notify(
        &self,
        _target: &ReplyTarget,
        _text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Health check.
    fn health_check(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn PublisherDyn>` for storing different adapters.
pub trait PublisherDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn publish<'a>(
        &'a self,
        target: &'a ReplyTarget,
        media: &'a MediaFile,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn notify<'a>(
        &'a self,
        target: &'a ReplyTarget,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Publisher automatically implements PublisherDyn.
impl<T: Publisher> PublisherDyn for T {
    fn name(&self) -> &str {
        Publisher::name(self)
    }

    fn publish<'a>(
        &'a self,
        target: &'a ReplyTarget,
        media: &'a MediaFile,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(Publisher::publish(self, target, media, text))
    }

    fn notify<'a>(
        &'a self,
        target: &'a ReplyTarget,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Publisher::notify(self, target, text))
    }

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Publisher::health_check(self))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    RepliedTo,
    Quoted,
    Retweeted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedPost {
    pub kind: ReferenceKind,
    pub id: String,
}

/// A social post as seen by the trigger sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub author_handle: Option<String>,
    pub text: String,
    pub conversation_id: Option<String>,
    pub in_reply_to_user_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub referenced: Vec<ReferencedPost>,
    /// Photo URLs attached to the post.
    pub image_urls: Vec<String>,
}

impl Post {
    pub fn reference(&self, kind: ReferenceKind) -> Option<&str> {
        self.referenced
            .iter()
            .find(|reference| reference.kind == kind)
            .map(|reference| reference.id.as_str())
    }

    /// Numeric ordering of post ids; ids that do not parse sort first.
    pub fn numeric_id(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }
}

/// Read access to a social platform.
#[async_trait]
pub trait SocialFeed: Send + Sync + 'static {
    /// Recent posts matching `query`, newer than `since_id` when given.
    async fn search_recent(
        &self,
        query: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError>;

    async fn get_post(&self, id: &str) -> std::result::Result<Option<Post>, ProviderError>;

    /// Every post in a conversation, any order.
    async fn conversation(&self, conversation_id: &str)
    -> std::result::Result<Vec<Post>, ProviderError>;

    /// Original posts (no reposts or replies) by `handle` since `since`.
    async fn recent_posts_by(
        &self,
        handle: &str,
        since: DateTime<Utc>,
        max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError>;
}
