//! OpenAI-compatible chat-completions client (Groq by default).
//!
//! One [`LanguageModel::complete`] call is one HTTP attempt. Failures are
//! classified into [`LanguageModelError`] variants so the answer composer
//! can tell retryable conditions (timeout, 429, 5xx, connection errors)
//! from permanent ones (other 4xx, malformed responses, missing API key).
//!
//! [`LanguageModel::complete_stream`] sends `"stream": true` and reads the
//! server-sent events incrementally: each `data:` line carries a JSON chunk
//! whose `choices[0].delta.content` is forwarded, and `data: [DONE]` ends
//! the stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use policy_qa_core::error::LanguageModelError;
use policy_qa_core::llm::{ChatMessage, Completion, LanguageModel};

use crate::config::LlmConfig;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ResponseMessage>,
}

enum SseEvent {
    Chunk(StreamChunk),
    Done,
}

/// Parse one SSE line. Blank lines, comments and non-`data` fields yield
/// `None`.
fn parse_sse_line(line: &str) -> Result<Option<SseEvent>, LanguageModelError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    serde_json::from_str(data)
        .map(|chunk| Some(SseEvent::Chunk(chunk)))
        .map_err(|e| LanguageModelError::InvalidResponse(format!("bad stream chunk: {}", e)))
}

pub struct ChatCompletionsClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    /// `api_key` is resolved by the caller; `None` makes every call fail
    /// with [`LanguageModelError::NotConfigured`].
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

/// Build the chat client for `config`, resolving the API key from
/// `llm.api_key_env`. A missing key is not an error here; it surfaces as
/// [`LanguageModelError::NotConfigured`] on the first call.
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    Ok(Arc::new(ChatCompletionsClient::new(config, config.api_key())?))
}

impl ChatCompletionsClient {
    /// POST the request and map non-success statuses to errors.
    async fn send(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, LanguageModelError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            LanguageModelError::NotConfigured("no API key for the language model".to_string())
        })?;

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => LanguageModelError::RateLimited(body),
                408 => LanguageModelError::Timeout,
                s if status.is_server_error() => LanguageModelError::Server { status: s, body },
                s => LanguageModelError::Client { status: s, body },
            });
        }
        Ok(response)
    }
}

fn classify_transport(e: reqwest::Error) -> LanguageModelError {
    if e.is_timeout() {
        LanguageModelError::Timeout
    } else {
        LanguageModelError::Network(e.to_string())
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LanguageModelError> {
        let response = self.send(messages, false).await?;
        let bytes = response.bytes().await.map_err(classify_transport)?;
        let parsed: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| LanguageModelError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| LanguageModelError::InvalidResponse("no completion text".to_string()))?;

        Ok(Completion {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Completion, LanguageModelError> {
        let mut response = self.send(messages, true).await?;

        let mut text = String::new();
        let mut model: Option<String> = None;
        let mut pending: Vec<u8> = Vec::new();
        let mut done = false;

        while !done {
            let Some(bytes) = response.chunk().await.map_err(classify_transport)? else {
                break;
            };
            pending.extend_from_slice(&bytes);
            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    Some(SseEvent::Chunk(chunk)) => {
                        if model.is_none() {
                            model = chunk.model;
                        }
                        let delta = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta)
                            .and_then(|d| d.content)
                            .unwrap_or_default();
                        if !delta.is_empty() {
                            on_delta(&delta);
                            text.push_str(&delta);
                        }
                    }
                    Some(SseEvent::Done) => {
                        done = true;
                        break;
                    }
                    None => {}
                }
            }
        }

        if text.trim().is_empty() {
            return Err(LanguageModelError::InvalidResponse(
                "stream carried no completion text".to_string(),
            ));
        }
        Ok(Completion {
            text,
            model: model.unwrap_or_else(|| self.model.clone()),
        })
    }
}
