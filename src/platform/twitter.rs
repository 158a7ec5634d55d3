//! X (Twitter) adapter.
//!
//! Reads go through API v2 with the app bearer token. Writes (chunked media
//! upload and reply posts) are signed with OAuth 1.0a user credentials.

use crate::config::TwitterConfig;
use crate::error::{ProviderError, Result};
use crate::pipeline::{PollConfig, PollStatus, poll_until_ready};
use crate::platform::oauth::OAuthCredentials;
use crate::platform::{Post, Publisher, ReferenceKind, ReferencedPost, SocialFeed};
use crate::provider::{read_json, require};
use crate::{MediaFile, MediaKind, ReplyTarget};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use std::collections::HashMap;

const PLATFORM: &str = "twitter";
const TWEET_FIELDS: &str = "author_id,conversation_id,referenced_tweets,created_at,in_reply_to_user_id,attachments";
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub struct TwitterClient {
    http: reqwest::Client,
    bearer_token: String,
    credentials: OAuthCredentials,
    api_base: String,
    upload_base: String,
    media_poll: PollConfig,
}

impl TwitterClient {
    pub fn new(http: reqwest::Client, config: &TwitterConfig) -> Result<Self> {
        Ok(Self {
            http,
            bearer_token: require(&config.bearer_token, "twitter.bearer_token")?,
            credentials: OAuthCredentials::from_config(config)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            media_poll: config.media_poll,
        })
    }

    fn upload_url(&self) -> String {
        format!("{}/1.1/media/upload.json", self.upload_base)
    }

    async fn get_v2(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        read_json(PLATFORM, response).await
    }

    /// Signed form POST to the upload endpoint.
    async fn upload_command(
        &self,
        params: &[(&str, &str)],
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let url = self.upload_url();
        let authorization = self
            .credentials
            .authorization("POST", &url, params)
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .form(params)
            .send()
            .await
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        read_json(PLATFORM, response).await
    }

    async fn append_chunk(
        &self,
        media_id: &str,
        segment_index: usize,
        chunk: Vec<u8>,
    ) -> std::result::Result<(), ProviderError> {
        let url = self.upload_url();
        let authorization = self
            .credentials
            .authorization("POST", &url, &[])
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        let form = reqwest::multipart::Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment_index.to_string())
            .part("media", reqwest::multipart::Part::bytes(chunk));

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .multipart(form)
            .send()
            .await
            .map_err(|error| ProviderError::request(PLATFORM, error))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: PLATFORM,
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    async fn processing_status(
        &self,
        media_id: &str,
    ) -> std::result::Result<PollStatus<()>, ProviderError> {
        let url = self.upload_url();
        let params = [("command", "STATUS"), ("media_id", media_id)];
        let authorization = self
            .credentials
            .authorization("GET", &url, &params)
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .query(&params)
            .send()
            .await
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        let body = read_json(PLATFORM, response).await?;
        Ok(processing_state(&body))
    }

    /// Chunked upload (INIT, APPEND, FINALIZE), then wait for processing.
    #[tracing::instrument(skip_all, fields(path = %media.path.display()))]
    async fn upload_media(&self, media: &MediaFile) -> std::result::Result<String, ProviderError> {
        let (media_type, category) = match media.kind {
            MediaKind::Video => ("video/mp4", "tweet_video"),
            MediaKind::Image => ("image/png", "tweet_image"),
            MediaKind::Audio => {
                return Err(ProviderError::payload(
                    PLATFORM,
                    "audio cannot be attached to a post",
                ));
            }
        };
        let bytes = tokio::fs::read(&media.path).await.map_err(|error| {
            ProviderError::Artifact(format!("failed to read {}: {error}", media.path.display()))
        })?;
        let total_bytes = bytes.len().to_string();

        let init = self
            .upload_command(&[
                ("command", "INIT"),
                ("total_bytes", total_bytes.as_str()),
                ("media_type", media_type),
                ("media_category", category),
            ])
            .await?;
        let media_id = init["media_id_string"]
            .as_str()
            .ok_or_else(|| ProviderError::payload(PLATFORM, "INIT response has no media_id_string"))?
            .to_string();

        for (segment_index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            self.append_chunk(&media_id, segment_index, chunk.to_vec())
                .await?;
        }

        let finalized = self
            .upload_command(&[("command", "FINALIZE"), ("media_id", media_id.as_str())])
            .await?;

        if let PollStatus::Failed(reason) = processing_state(&finalized) {
            return Err(ProviderError::JobFailed {
                job: "media processing".into(),
                reason,
            });
        }
        if finalized.get("processing_info").is_some() {
            poll_until_ready("media processing", self.media_poll, |_| {
                self.processing_status(&media_id)
            })
            .await?;
        }

        tracing::debug!(%media_id, bytes = bytes.len(), "media uploaded");
        Ok(media_id)
    }

    async fn create_post(
        &self,
        text: &str,
        in_reply_to: Option<&str>,
        media_id: &str,
    ) -> std::result::Result<String, ProviderError> {
        let url = format!("{}/2/tweets", self.api_base);
        let authorization = self
            .credentials
            .authorization("POST", &url, &[])
            .map_err(|error| ProviderError::request(PLATFORM, error))?;
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&post_body(text, in_reply_to, media_id))
            .send()
            .await
            .map_err(|error| ProviderError::request(PLATFORM, error))?;

        let body = read_json(PLATFORM, response).await?;
        body["data"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::payload(PLATFORM, "create response has no data.id"))
    }

    async fn user_id(&self, handle: &str) -> std::result::Result<String, ProviderError> {
        let handle = handle.trim_start_matches('@');
        let body = self
            .get_v2(&format!("/2/users/by/username/{handle}"), &[])
            .await?;
        body["data"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::payload(PLATFORM, format!("unknown account @{handle}")))
    }
}

fn post_body(text: &str, in_reply_to: Option<&str>, media_id: &str) -> serde_json::Value {
    let mut body = serde_json::json!({
        "text": text,
        "media": {"media_ids": [media_id]},
    });
    if let Some(parent) = in_reply_to {
        body["reply"] = serde_json::json!({"in_reply_to_tweet_id": parent});
    }
    body
}

fn processing_state(body: &serde_json::Value) -> PollStatus<()> {
    let info = &body["processing_info"];
    match info["state"].as_str() {
        None | Some("succeeded") => PollStatus::Ready(()),
        Some("failed") => PollStatus::Failed(
            info["error"]["message"]
                .as_str()
                .unwrap_or("media processing failed")
                .to_string(),
        ),
        Some(_) => PollStatus::Pending,
    }
}

fn query_fields() -> Vec<(&'static str, String)> {
    vec![
        ("tweet.fields", TWEET_FIELDS.to_string()),
        ("expansions", "attachments.media_keys,author_id".to_string()),
        ("media.fields", "url,type".to_string()),
        ("user.fields", "username".to_string()),
    ]
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    media: Vec<MediaData>,
    #[serde(default)]
    users: Vec<UserData>,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    media_key: String,
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    text: String,
    author_id: Option<String>,
    conversation_id: Option<String>,
    in_reply_to_user_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    referenced_tweets: Vec<TweetReference>,
    attachments: Option<Attachments>,
}

#[derive(Debug, Deserialize)]
struct TweetReference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TweetPage {
    #[serde(default)]
    data: Vec<TweetData>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Debug, Deserialize)]
struct TweetLookup {
    data: Option<TweetData>,
    #[serde(default)]
    includes: Includes,
}

fn reference_kind(kind: &str) -> Option<ReferenceKind> {
    match kind {
        "replied_to" => Some(ReferenceKind::RepliedTo),
        "quoted" => Some(ReferenceKind::Quoted),
        "retweeted" => Some(ReferenceKind::Retweeted),
        _ => None,
    }
}

fn to_post(tweet: TweetData, includes: &Includes) -> Post {
    let photos: HashMap<&str, &str> = includes
        .media
        .iter()
        .filter(|media| media.kind == "photo")
        .filter_map(|media| Some((media.media_key.as_str(), media.url.as_deref()?)))
        .collect();
    let image_urls = tweet
        .attachments
        .unwrap_or_default()
        .media_keys
        .iter()
        .filter_map(|key| photos.get(key.as_str()).map(|url| url.to_string()))
        .collect();
    let author_handle = tweet.author_id.as_deref().and_then(|author_id| {
        includes
            .users
            .iter()
            .find(|user| user.id == author_id)
            .map(|user| user.username.clone())
    });

    Post {
        id: tweet.id,
        author_id: tweet.author_id.unwrap_or_default(),
        author_handle,
        text: tweet.text,
        conversation_id: tweet.conversation_id,
        in_reply_to_user_id: tweet.in_reply_to_user_id,
        created_at: tweet.created_at,
        referenced: tweet
            .referenced_tweets
            .into_iter()
            .filter_map(|reference| {
                Some(ReferencedPost {
                    kind: reference_kind(&reference.kind)?,
                    id: reference.id,
                })
            })
            .collect(),
        image_urls,
    }
}

fn parse_page(body: serde_json::Value) -> std::result::Result<Vec<Post>, ProviderError> {
    let page: TweetPage = serde_json::from_value(body)
        .map_err(|error| ProviderError::payload(PLATFORM, format!("malformed tweet page: {error}")))?;
    let includes = page.includes;
    Ok(page
        .data
        .into_iter()
        .map(|tweet| to_post(tweet, &includes))
        .collect())
}

#[async_trait]
impl SocialFeed for TwitterClient {
    async fn search_recent(
        &self,
        query: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        let mut params = query_fields();
        params.push(("query", query.to_string()));
        params.push(("max_results", max_results.clamp(10, 100).to_string()));
        if let Some(since_id) = since_id {
            params.push(("since_id", since_id.to_string()));
        }
        let body = self.get_v2("/2/tweets/search/recent", &params).await?;
        parse_page(body)
    }

    async fn get_post(&self, id: &str) -> std::result::Result<Option<Post>, ProviderError> {
        let body = match self.get_v2(&format!("/2/tweets/{id}"), &query_fields()).await {
            Ok(body) => body,
            Err(ProviderError::Status { status: 404, .. }) => return Ok(None),
            Err(error) => return Err(error),
        };
        let lookup: TweetLookup = serde_json::from_value(body)
            .map_err(|error| ProviderError::payload(PLATFORM, format!("malformed tweet: {error}")))?;
        let includes = lookup.includes;
        Ok(lookup.data.map(|tweet| to_post(tweet, &includes)))
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        self.search_recent(&format!("conversation_id:{conversation_id}"), None, 100)
            .await
    }

    async fn recent_posts_by(
        &self,
        handle: &str,
        since: DateTime<Utc>,
        max_results: u32,
    ) -> std::result::Result<Vec<Post>, ProviderError> {
        let user_id = self.user_id(handle).await?;
        let mut params = query_fields();
        params.push(("exclude", "retweets,replies".to_string()));
        params.push(("start_time", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        params.push(("max_results", max_results.clamp(5, 100).to_string()));

        let body = self
            .get_v2(&format!("/2/users/{user_id}/tweets"), &params)
            .await?;
        let mut posts = parse_page(body)?;
        for post in &mut posts {
            if post.author_handle.is_none() {
                post.author_handle = Some(handle.trim_start_matches('@').to_string());
            }
        }
        Ok(posts)
    }
}

impl Publisher for TwitterClient {
    fn name(&self) -> &str {
        PLATFORM
    }

    async fn publish(&self, target: &ReplyTarget, media: &MediaFile, text: &str) -> Result<String> {
        let media_id = self.upload_media(media).await?;
        let post_id = self
            .create_post(text, target.parent_id.as_deref(), &media_id)
            .await?;
        tracing::info!(%post_id, %media_id, "reply posted");
        Ok(post_id)
    }
}
