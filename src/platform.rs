//! Delivery and social read adapters (Telegram, X).

pub mod oauth;
pub mod telegram;
pub mod traits;
pub mod twitter;

pub use telegram::TelegramPublisher;
pub use traits::{Post, Publisher, PublisherDyn, ReferenceKind, ReferencedPost, SocialFeed};
pub use twitter::TwitterClient;
