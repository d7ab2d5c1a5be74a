//! Minimal chat-completions client shared by report generation and the
//! suggestion source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::LlmError;

pub const DEFAULT_API_URL: &str = "https://ai.megallm.io/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama3.3-70b-instruct";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// `[llm]` table of `triage.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmSection {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl LlmConfig {
    pub fn apply(&mut self, section: LlmSection) {
        if section.api_key.is_some() {
            self.api_key = section.api_key;
        }
        if let Some(url) = section.api_url {
            self.api_url = url;
        }
        if let Some(model) = section.model {
            self.model = model;
        }
        if let Some(secs) = section.timeout_secs {
            self.timeout_secs = secs;
        }
    }

    /// Enabled only when a non-empty key is configured.
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Sampling parameters for one call.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct ChatClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, http }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send one system + user exchange and return the assistant text.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        sampling: Sampling,
    ) -> Result<String, LlmError> {
        let Some(key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Err(LlmError::Disabled);
        };

        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        };

        let resp = self
            .http
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", key))
            .json(&request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(LlmError::Status {
                status: resp.status().as_u16(),
            });
        }
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Malformed("response has no choices".to_string()))
    }
}
