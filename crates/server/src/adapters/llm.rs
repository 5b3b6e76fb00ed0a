use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use setter_agent::LlmClient;
use setter_core::config::{LlmConfig, LlmProvider};
use setter_core::ports::CollaboratorError;
use tracing::warn;

use super::{classify_send_error, decode_json, endpoint, expect_success};

const SERVICE: &str = "llm";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const MAX_TOKENS: u32 = 150;
const TEMPERATURE: f32 = 0.7;

/// OpenAI-compatible `/chat/completions` client. Ollama serves the same API.
pub struct ChatCompletionClient {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionClient {
    pub fn new(client: Client, config: &LlmConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.provider {
                LlmProvider::OpenAi => OPENAI_BASE_URL,
                LlmProvider::Ollama => OLLAMA_BASE_URL,
            }
            .to_string()
        });
        Self {
            client,
            url: endpoint(&base_url, "chat/completions"),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        }
    }

    async fn request_once(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage { role: "user", content: prompt }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        let response =
            request.send().await.map_err(|error| classify_send_error(SERVICE, error))?;
        let response = expect_success(SERVICE, response).await?;
        let reply: ChatResponse = decode_json(SERVICE, response).await?;
        first_reply(reply).ok_or_else(|| {
            CollaboratorError::Rejected("llm response carried no message content".to_string())
        })
    }
}

fn first_reply(response: ChatResponse) -> Option<String> {
    response.choices.into_iter().next().and_then(|choice| choice.message.content)
}

#[async_trait]
impl LlmClient for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.request_once(prompt).await {
                Ok(reply) => return Ok(reply),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "llm.retry",
                        attempt,
                        error = %error,
                        "retrying model request"
                    );
                }
                Err(error) => return Err(anyhow!(error)),
            }
        }
    }
}
