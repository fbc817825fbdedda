use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sse_stream::SseStream;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use datapilot_core::config::LlmConfig;
use datapilot_core::{Message, Role, ToolCall, ToolDescriptor};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("could not build http client: {0}")]
    Client(String),
    #[error("llm request failed: {0}")]
    Transport(String),
    #[error("llm endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("llm response contained no choices")]
    EmptyResponse,
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Client(_) | Self::Decode(_) | Self::EmptyResponse => false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One chat completion. `tools` empty means the model is called without tool binding.
    async fn complete(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError>;

    /// Same as [`LlmClient::complete`], forwarding text deltas to `on_token` as
    /// they arrive. Clients without streaming report the whole text once.
    async fn complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<LlmReply, LlmError> {
        let reply = self.complete(messages, tools).await?;
        if !reply.content.is_empty() {
            on_token(&reply.content);
        }
        Ok(reply)
    }
}

/// Chat-completions client for OpenAI, DeepSeek and Ollama's OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Client(error.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.resolved_base_url().trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let request = self.client.post(&self.endpoint).json(body);
        match &self.api_key {
            Some(api_key) => request.bearer_auth(api_key.expose_secret()),
            None => request,
        }
    }

    fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    async fn backoff(&self, attempt: u32, error: &LlmError) {
        let delay = Duration::from_millis(250 * 2u64.pow(attempt));
        warn!(
            event_name = "agent.llm.retry",
            attempt = attempt + 1,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying llm request"
        );
        tokio::time::sleep(delay).await;
    }

    async fn send_once(&self, body: &Value) -> Result<LlmReply, LlmError> {
        let response =
            self.request(body).send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&text, 500) });
        }

        debug!(
            event_name = "agent.llm.response",
            model = %self.model,
            bytes = text.len(),
            "llm response received"
        );
        parse_reply(&text)
    }

    async fn stream_once(&self, body: &Value, on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync)) -> Result<LlmReply, LlmError> {
        let response =
            self.request(body).send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&text, 500) });
        }

        let event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .is_some_and(|value| value.as_bytes().starts_with(b"text/event-stream"));
        if !event_stream {
            // Some compatible servers ignore `stream` and answer in one piece.
            let text = response.text().await.map_err(|error| LlmError::Transport(error.to_string()))?;
            let reply = parse_reply(&text)?;
            if !reply.content.is_empty() {
                on_token(&reply.content);
            }
            return Ok(reply);
        }

        let mut events = std::pin::pin!(SseStream::from_bytes_stream(response.bytes_stream()));
        let mut reply = StreamedReply::default();
        let mut chunks = 0usize;
        while let Some(event) = events.next().await {
            let event = event.map_err(|error| LlmError::Transport(error.to_string()))?;
            let Some(data) = event.data else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break;
            }
            chunks += 1;
            if let Some(text) = reply.push(&data)? {
                on_token(&text);
            }
        }

        debug!(event_name = "agent.llm.streamed", model = %self.model, chunks, "llm stream finished");
        reply.finish()
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmReply, LlmError> {
        let body = request_body(&self.model, self.temperature, messages, tools);
        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(reply) => return Ok(reply),
                Err(error) if self.should_retry(&error, attempt) => {
                    self.backoff(attempt, &error).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// A request is only retried while nothing has been forwarded yet.
    async fn complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<LlmReply, LlmError> {
        let mut body = request_body(&self.model, self.temperature, messages, tools);
        body["stream"] = Value::Bool(true);

        let forwarded = AtomicBool::new(false);
        let forward = |text: &str| {
            forwarded.store(true, Ordering::Relaxed);
            on_token(text);
        };

        let mut attempt = 0;
        loop {
            match self.stream_once(&body, &forward).await {
                Ok(reply) => return Ok(reply),
                Err(error) if !forwarded.load(Ordering::Relaxed) && self.should_retry(&error, attempt) => {
                    self.backoff(attempt, &error).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

pub(crate) fn request_body(
    model: &str,
    temperature: f32,
    messages: &[Message],
    tools: &[ToolDescriptor],
) -> Value {
    let mut body = json!({
        "model": model,
        "temperature": temperature,
        "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.to_json_schema(),
                        }
                    })
                })
                .collect(),
        );
    }
    body
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        Role::System => json!({ "role": "system", "content": message.text() }),
        Role::User => json!({ "role": "user", "content": message.text() }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.text(),
        }),
        Role::Assistant if message.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": message.text() })
        }
        Role::Assistant => {
            let text = message.text();
            json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                "tool_calls": message.tool_calls.iter().map(|call| json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": Value::Object(call.arguments.clone()).to_string(),
                    }
                })).collect::<Vec<_>>(),
            })
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

pub(crate) fn parse_reply(raw: &str) -> Result<LlmReply, LlmError> {
    let response: WireResponse =
        serde_json::from_str(raw).map_err(|error| LlmError::Decode(error.to_string()))?;
    let choice = response.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            arguments: decode_arguments(&call.function.name, &call.function.arguments),
            id: call.id,
            name: call.function.name,
        })
        .collect();

    Ok(LlmReply { content: choice.message.content.unwrap_or_default(), tool_calls })
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates `stream: true` chunks into one reply. Tool call fragments are
/// keyed by their `index` and their argument strings concatenated.
#[derive(Default)]
pub(crate) struct StreamedReply {
    content: String,
    calls: Vec<PartialCall>,
    saw_choice: bool,
}

impl StreamedReply {
    /// Folds one `data:` payload in and returns its text delta, if any.
    pub(crate) fn push(&mut self, data: &str) -> Result<Option<String>, LlmError> {
        let chunk: WireChunk =
            serde_json::from_str(data).map_err(|error| LlmError::Decode(error.to_string()))?;

        let mut text: Option<String> = None;
        for choice in chunk.choices {
            self.saw_choice = true;
            if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                self.content.push_str(&content);
                text.get_or_insert_with(String::new).push_str(&content);
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let index = delta.index.unwrap_or_else(|| {
                    if delta.id.is_some() {
                        self.calls.len()
                    } else {
                        self.calls.len().saturating_sub(1)
                    }
                });
                if self.calls.len() <= index {
                    self.calls.resize_with(index + 1, PartialCall::default);
                }
                let call = &mut self.calls[index];
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = delta.function {
                    call.name.push_str(function.name.as_deref().unwrap_or_default());
                    call.arguments.push_str(function.arguments.as_deref().unwrap_or_default());
                }
            }
        }
        Ok(text)
    }

    pub(crate) fn finish(self) -> Result<LlmReply, LlmError> {
        if !self.saw_choice {
            return Err(LlmError::EmptyResponse);
        }
        let tool_calls = self
            .calls
            .into_iter()
            .enumerate()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| ToolCall {
                arguments: decode_arguments(&call.name, &call.arguments),
                id: if call.id.is_empty() { format!("call_{index}") } else { call.id },
                name: call.name,
            })
            .collect();
        Ok(LlmReply { content: self.content, tool_calls })
    }
}

/// Arguments arrive JSON-encoded inside a string. Anything that is not an
/// object becomes an empty map so argument checks report what is missing.
fn decode_arguments(tool: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(arguments)) => arguments,
        _ => {
            warn!(event_name = "agent.llm.bad_arguments", tool, "tool call arguments are not a json object");
            Map::new()
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
