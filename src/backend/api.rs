//! Claude API backend
//!
//! One request to the Messages endpoint per prompt: fixed system preamble
//! naming the working directory, the prompt as the only user message.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{Backend, BackendError, BackendKind};
use crate::config::Config;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: usize = 4096;

/// Message in conversation
#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// API request
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    system: String,
    messages: Vec<Message<'a>>,
}

/// API response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

#[derive(Clone)]
pub struct ApiBackend {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl ApiBackend {
    pub fn new(api_key: &str, api_url: &str, model: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            api_url: api_url.to_string(),
            model: model.to_string(),
        }
    }

    /// Create from config
    pub fn from_config(config: &Config, api_key: &str) -> Self {
        Self::new(api_key, &config.api_url, &config.model, config.call_timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// System preamble for a working directory
pub fn system_prompt(working_dir: &Path) -> String {
    format!(
        "You are a helpful coding assistant working in the directory: {}\n\n\
        When making changes:\n\
        1. Explain what you're doing\n\
        2. Show files that will be modified\n\
        3. Run relevant tests\n\
        4. Provide clear summaries\n\n\
        Format your response to be clear and actionable.",
        working_dir.display()
    )
}

#[async_trait]
impl Backend for ApiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn invoke(&self, prompt: &str, working_dir: &Path) -> Result<String, BackendError> {
        let request = MessageRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: system_prompt(working_dir),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        debug!("Calling Claude API: model={}, prompt_len={}", self.model, prompt.len());

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }

        let result: MessageResponse = response.json().await?;

        if let Some(usage) = &result.usage {
            info!(
                "Claude response: model={}, in={}, out={}",
                self.model, usage.input_tokens, usage.output_tokens
            );
        }

        result
            .content
            .into_iter()
            .find_map(|b| if b.r#type == "text" { b.text } else { None })
            .ok_or(BackendError::EmptyResponse)
    }
}
