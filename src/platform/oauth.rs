//! OAuth 1.0a request signing (HMAC-SHA1) for X user-context writes.

use crate::config::TwitterConfig;
use crate::error::Result;
use crate::provider::require;

use anyhow::Context as _;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng as _;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: String,
    pub token_secret: String,
}

impl OAuthCredentials {
    pub fn from_config(config: &TwitterConfig) -> Result<Self> {
        Ok(Self {
            consumer_key: require(&config.api_key, "twitter.api_key")?,
            consumer_secret: require(&config.api_secret, "twitter.api_secret")?,
            token: require(&config.access_token, "twitter.access_token")?,
            token_secret: require(&config.access_token_secret, "twitter.access_token_secret")?,
        })
    }

    /// `Authorization` header value for a request.
    ///
    /// `params` are the query and form parameters that take part in the
    /// signature. JSON and multipart bodies do not.
    pub fn authorization(&self, method: &str, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let nonce: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_with(method, url, params, &nonce, &timestamp)
    }

    pub fn authorization_with(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String> {
        let mut oauth_params = vec![
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp),
            ("oauth_token", self.token.as_str()),
            ("oauth_version", "1.0"),
        ];

        let mut signed: Vec<(&str, &str)> = oauth_params.clone();
        signed.extend_from_slice(params);
        let signature = self.sign(method, url, &signed)?;
        oauth_params.push(("oauth_signature", &signature));
        oauth_params.sort();

        let header = oauth_params
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", encode(key), encode(value)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {header}"))
    }

    fn sign(&self, method: &str, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let mut encoded: Vec<(String, String)> = params
            .iter()
            .map(|(key, value)| (encode(key), encode(value)))
            .collect();
        encoded.sort();
        let parameter_string = encoded
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        let base = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            encode(url),
            encode(&parameter_string)
        );
        let key = format!(
            "{}&{}",
            encode(&self.consumer_secret),
            encode(&self.token_secret)
        );

        let mut mac = HmacSha1::new_from_slice(key.as_bytes())
            .context("failed to initialise HMAC-SHA1")?;
        mac.update(base.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// RFC 3986 percent-encoding: everything except `A-Z a-z 0-9 - . _ ~`.
fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn documented_credentials() -> OAuthCredentials {
        OAuthCredentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".into(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".into(),
            token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".into(),
            token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".into(),
        }
    }

    #[test]
    fn signature_matches_published_example() {
        let header = documented_credentials()
            .authorization_with(
                "POST",
                "https://api.twitter.com/1.1/statuses/update.json",
                &[
                    ("include_entities", "true"),
                    ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
                ],
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
                "1318622958",
            )
            .unwrap();

        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
    }

    #[test]
    fn fresh_nonce_per_request() {
        let credentials = documented_credentials();
        let first = credentials.authorization("GET", "https://api.x.com/2/users/me", &[]).unwrap();
        let second = credentials.authorization("GET", "https://api.x.com/2/users/me", &[]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn encoding_is_rfc3986() {
        assert_eq!(encode("a b+c~d*"), "a%20b%2Bc~d%2A");
    }
}
