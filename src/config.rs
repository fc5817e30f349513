use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::chatwoot::BROWSER_USER_AGENT;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chatwoot: ChatwootConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// When set, sent as a system turn ahead of the customer's message.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_llm_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatwootConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_access_token: String,
    /// Send a desktop browser User-Agent on reply posts so Cloudflare-style
    /// bot filters in front of the instance let the call through.
    #[serde(default = "default_true")]
    pub browser_user_agent: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
            request_timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl Default for ChatwootConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_access_token: String::new(),
            browser_user_agent: default_true(),
            user_agent: default_user_agent(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then let the process environment
    /// override individual keys.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Overlay environment variables. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_SYSTEM_PROMPT") {
            self.llm.system_prompt = Some(v);
        }
        if let Some(v) = get("CHATWOOT_URL") {
            self.chatwoot.base_url = v;
        }
        if let Some(v) = get("CHATWOOT_TOKEN") {
            self.chatwoot.api_access_token = v;
        }
        if let Some(v) = get("LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
    }

    fn normalize(&mut self) {
        trim_trailing_slash(&mut self.llm.base_url);
        trim_trailing_slash(&mut self.chatwoot.base_url);
        if self
            .llm
            .system_prompt
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            self.llm.system_prompt = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("llm.api_key (OPENAI_API_KEY)", &self.llm.api_key),
            ("llm.base_url (OPENAI_BASE_URL)", &self.llm.base_url),
            ("chatwoot.base_url (CHATWOOT_URL)", &self.chatwoot.base_url),
            (
                "chatwoot.api_access_token (CHATWOOT_TOKEN)",
                &self.chatwoot.api_access_token,
            ),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Missing required configuration: {}", missing.join(", "));
        }
        if self.llm.max_tokens == 0 {
            anyhow::bail!("llm.max_tokens must be greater than zero");
        }
        Ok(())
    }
}

fn trim_trailing_slash(url: &mut String) {
    while url.ends_with('/') {
        url.pop();
    }
}
