use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::USER_AGENT;
use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::config::ChatwootConfig;
use crate::error::UpstreamError;
use crate::retry::{retry_with_backoff, RetryPolicy, Sleeper};

const SERVICE: &str = "chatwoot";

/// Desktop Chrome UA attached to reply posts only.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    content: &'a str,
    message_type: &'static str,
}

/// Posts agent replies into Chatwoot conversations.
pub struct ChatwootClient {
    client: reqwest::Client,
    base_url: Url,
    config: ChatwootConfig,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ChatwootClient {
    pub fn new(
        config: ChatwootConfig,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build Chatwoot HTTP client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid Chatwoot base URL: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Chatwoot base URL cannot carry a path: {}", config.base_url);
        }
        Ok(Self {
            client,
            base_url,
            config,
            policy,
            sleeper,
        })
    }

    /// Each ID is percent-encoded as a single path segment.
    pub fn messages_url(&self, account_id: &str, conversation_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "api",
                "v1",
                "accounts",
                account_id,
                "conversations",
                conversation_id,
                "messages",
            ]);
        }
        url
    }

    /// Post `content` as an outgoing message, retrying on 429 and timeouts.
    pub async fn post_message(
        &self,
        account_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), UpstreamError> {
        let url = self.messages_url(account_id, conversation_id);
        let url = &url;
        retry_with_backoff(&self.policy, self.sleeper.as_ref(), || {
            self.send_once(url, content)
        })
        .await
    }

    async fn send_once(&self, url: &Url, content: &str) -> Result<(), UpstreamError> {
        debug!("Posting reply to {}", url);

        let mut request = self
            .client
            .post(url.clone())
            .header("api_access_token", &self.config.api_access_token)
            .json(&OutgoingMessage {
                content,
                message_type: "outgoing",
            });
        if self.config.browser_user_agent {
            request = request.header(USER_AGENT, &self.config.user_agent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(SERVICE, response).await);
        }
        Ok(())
    }
}
