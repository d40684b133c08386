//! Provider registry for C4.
//!
//! Each variant wraps a `reqwest::Client` pointed at its vendor endpoint.
//! Availability is a key presence check, not a live probe — probing on
//! every `generate()` call would itself burn quota.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTag {
    Hyperclova,
    Chatgpt,
    Claude,
    Grok,
    Gemini,
}

impl ModelTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTag::Hyperclova => "hyperclova",
            ModelTag::Chatgpt => "chatgpt",
            ModelTag::Claude => "claude",
            ModelTag::Grok => "grok",
            ModelTag::Gemini => "gemini",
        }
    }

    pub fn parse(tag: &str) -> ModelTag {
        match tag {
            "chatgpt" => ModelTag::Chatgpt,
            "claude" => ModelTag::Claude,
            "grok" => ModelTag::Grok,
            "gemini" => ModelTag::Gemini,
            _ => ModelTag::Hyperclova,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn tag(&self) -> ModelTag;
    fn is_available(&self) -> bool;
    async fn generate(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String>;
}

struct HttpProvider {
    tag: ModelTag,
    api_key: Option<String>,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpProvider {
    fn new(tag: ModelTag, api_key: Option<String>, endpoint: &str) -> Self {
        Self { tag, api_key, endpoint: endpoint.to_string(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn tag(&self) -> ModelTag {
        self.tag
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String> {
        let Some(key) = &self.api_key else {
            return Err(Error::Provider {
                provider: self.tag.as_str().to_string(),
                message: "no API key configured".into(),
            });
        };

        let body = json!({
            "model": self.tag.as_str(),
            "prompt": prompt,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_err(self.tag, e))?;

        if !response.status().is_success() {
            return Err(Error::Provider {
                provider: self.tag.as_str().to_string(),
                message: format!("http {}", response.status()),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest_err(self.tag, e))?;
        payload["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Provider {
                provider: self.tag.as_str().to_string(),
                message: "response missing `text` field".into(),
            })
    }
}

fn classify_reqwest_err(tag: ModelTag, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(Duration::from_secs(0))
    } else {
        Error::Provider { provider: tag.as_str().to_string(), message: e.to_string() }
    }
}

pub fn build_registry(
    hyperclova_key: Option<String>,
    openai_key: Option<String>,
    claude_key: Option<String>,
    grok_key: Option<String>,
    gemini_key: Option<String>,
) -> Vec<Box<dyn LlmProvider>> {
    vec![
        Box::new(HttpProvider::new(
            ModelTag::Hyperclova,
            hyperclova_key,
            "https://clovastudio.stream.ntruss.com/v1/completions",
        )),
        Box::new(HttpProvider::new(
            ModelTag::Chatgpt,
            openai_key,
            "https://api.openai.com/v1/completions",
        )),
        Box::new(HttpProvider::new(
            ModelTag::Claude,
            claude_key,
            "https://api.anthropic.com/v1/complete",
        )),
        Box::new(HttpProvider::new(ModelTag::Grok, grok_key, "https://api.x.ai/v1/completions")),
        Box::new(HttpProvider::new(
            ModelTag::Gemini,
            gemini_key,
            "https://generativelanguage.googleapis.com/v1/models/gemini:generateContent",
        )),
    ]
}
