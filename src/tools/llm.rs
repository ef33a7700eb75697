use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rig::completion::{CompletionError, Prompt, PromptError};
use rig::prelude::*;
use rig::providers::openai;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::models::ChatTurn;
use crate::text::TokenEstimator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
    pub prompt: String,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Conversation folded into one prompt for single-turn agents.
    pub fn transcript(&self) -> String {
        if self.history.is_empty() {
            return self.prompt.clone();
        }
        let earlier = self
            .history
            .iter()
            .map(|turn| {
                format!(
                    "User: {}\nAssistant: {}",
                    turn.prompt,
                    turn.response.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "Earlier conversation:\n{}\n\nCurrent request:\n{}",
            earlier, self.prompt
        )
    }

    /// Chat-completions `messages` array.
    pub fn messages(&self) -> Vec<Value> {
        let mut messages = Vec::with_capacity(self.history.len() * 2 + 2);
        if let Some(system) = &self.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for turn in &self.history {
            messages.push(json!({ "role": "user", "content": turn.prompt }));
            messages.push(json!({
                "role": "assistant",
                "content": turn.response.as_deref().unwrap_or_default()
            }));
        }
        messages.push(json!({ "role": "user", "content": self.prompt }));
        messages
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Usage(TokenUsage),
}

pub type DeltaStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

/// Seam between the research tasks and whichever model serves them.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream, ProviderError>;
}

/// OpenAI-compatible model: rig agents for one-shot completions, raw
/// chat-completions SSE for streamed answers.
pub struct OpenAiModel {
    client: openai::Client,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    estimator: TokenEstimator,
}

impl OpenAiModel {
    pub fn new(config: &LlmConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("OpenAI API key"));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client: openai::Client::from_url(&config.api_key, &config.base_url),
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            estimator: TokenEstimator::default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    #[instrument(skip(self, request), fields(json = request.json))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let mut builder = self.client.agent(model);
        if let Some(system) = &request.system {
            builder = builder.preamble(system);
        }
        if request.json {
            builder = builder
                .additional_params(json!({ "response_format": { "type": "json_object" } }));
        }
        let agent = builder.build();

        let transcript = request.transcript();
        let content = agent
            .prompt(transcript.as_str())
            .await
            .map_err(prompt_error)?;

        let input = self.estimator.estimate(&transcript)
            + request
                .system
                .as_deref()
                .map(|s| self.estimator.estimate(s))
                .unwrap_or_default();
        let usage = TokenUsage {
            input_tokens: input as u64,
            output_tokens: self.estimator.estimate(&content) as u64,
        };
        debug!("Completion returned {} characters", content.len());
        Ok(Completion { content, usage })
    }

    #[instrument(skip(self, request))]
    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = json!({
            "model": model,
            "messages": request.messages(),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(sse_deltas(response.bytes_stream()))
    }
}

/// rig reports provider rejections as text only, so the status is inferred
/// from the error body: throttling and server trouble stay retryable,
/// anything else is treated as a client error.
fn prompt_error(err: PromptError) -> ProviderError {
    match err {
        PromptError::CompletionError(CompletionError::HttpError(err)) => err.into(),
        PromptError::CompletionError(CompletionError::JsonError(err)) => {
            ProviderError::Parse(err.to_string())
        }
        PromptError::CompletionError(CompletionError::ResponseError(body)) => {
            ProviderError::Parse(body)
        }
        PromptError::CompletionError(CompletionError::ProviderError(body)) => {
            ProviderError::Status {
                code: rejection_status(&body),
                body,
            }
        }
        other => ProviderError::Status {
            code: 400,
            body: other.to_string(),
        },
    }
}

fn rejection_status(body: &str) -> u16 {
    let body = body.to_ascii_lowercase();
    if body.contains("rate limit") || body.contains("rate_limit") {
        429
    } else if ["server_error", "overloaded", "bad gateway", "unavailable", "internal error"]
        .iter()
        .any(|marker| body.contains(marker))
    {
        503
    } else {
        400
    }
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Collects `data:` payloads from server-sent-event bytes.
#[derive(Debug, Default)]
struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn parse_chunk(payload: &str) -> Vec<StreamDelta> {
    let chunk: ChunkPayload = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => {
            warn!("Skipping malformed stream chunk: {}", err);
            return Vec::new();
        }
    };

    let mut deltas: Vec<StreamDelta> = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(StreamDelta::Text)
        .collect();
    if let Some(usage) = chunk.usage {
        deltas.push(StreamDelta::Usage(TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }
    deltas
}

/// Turns a chat-completions SSE byte stream into text and usage deltas.
pub fn sse_deltas<S, B, E>(bytes: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (bytes.boxed(), SseBuffer::default(), VecDeque::new(), false);
    stream::unfold(
        state,
        |(mut bytes, mut buffer, mut queue, mut finished)| async move {
            loop {
                if let Some(item) = queue.pop_front() {
                    return Some((item, (bytes, buffer, queue, finished)));
                }
                if finished {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for payload in buffer.push(chunk.as_ref()) {
                            if payload == "[DONE]" {
                                finished = true;
                                break;
                            }
                            queue.extend(parse_chunk(&payload).into_iter().map(Ok));
                        }
                    }
                    Some(Err(err)) => {
                        queue.push_back(Err(ProviderError::Transport(err.to_string())));
                        finished = true;
                    }
                    None => finished = true,
                }
            }
        },
    )
    .boxed()
}
