//! # Provider Clients
//!
//! ## Responsibility
//! Speak the provider wire protocols: OpenAI-compatible chat completions
//! (dashscope, volcengine, deepseek, moonshot) and the Anthropic messages
//! API, plus an echo client for demos and tests. Streaming responses are
//! decoded into a uniform event stream of text deltas terminated by exactly
//! one usage event.
//!
//! ## Guarantees
//! - `stream_chat` yields zero or more `Delta` events and then exactly one
//!   `Usage` event on success; a transport error ends the stream instead
//! - HTTP failures are classified into the closed error taxonomy before they
//!   leave this module; raw response bodies never travel in error values
//! - Malformed stream payloads are skipped, not fatal
//!
//! ## NOT Responsible For
//! - Choosing which model or provider to call (that belongs to `registry`)
//! - Rate limiting (that belongs to `limiter`)
//! - Retrying failed calls (that belongs to the aggregator)

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::{OrchestratorConfig, ProviderConfig, ProviderKind};
use crate::error::{classify_http, classify_transport, ProviderError};
use crate::sse::{SseFrame, SseParser};
use crate::OrchestratorError;

/// Wire version sent to Anthropic endpoints.
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Request / response types
// ============================================================================

/// A single chat call, already resolved to a physical model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Physical model identifier to send on the wire.
    pub model: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// User prompt.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// Non-streaming chat result.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Full response text.
    pub text: String,
    /// Token accounting reported by the provider.
    pub usage: Usage,
}

/// Token usage for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed.
    pub input_tokens: u32,
    /// Completion tokens produced.
    pub output_tokens: u32,
}

/// One event of a streaming chat response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of response text, in arrival order.
    Delta(String),
    /// Final token accounting. Always the last event of a successful stream.
    Usage(Usage),
}

/// Boxed stream of chat events.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// A chat-capable model provider.
///
/// Implementations are cheap to share behind `Arc` and safe to call
/// concurrently.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name as referenced by bindings and limits.
    fn name(&self) -> &str;

    /// One-shot chat completion.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ProviderError`] on transport failure or a
    /// non-success HTTP status.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streaming chat completion.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ProviderError`] if the call cannot be
    /// established; errors after that arrive through the stream.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, ProviderError>;
}

// ============================================================================
// Wire dialects
// ============================================================================

/// Converts one SSE payload into stream events.
///
/// Returning `true` ends the stream once already-queued events drain.
trait WireDialect: Send {
    fn convert(&mut self, payload: &str, out: &mut VecDeque<StreamEvent>) -> bool;
}

// ── OpenAI-compatible chat completions ───────────────────────────────────

#[derive(Debug, Serialize)]
struct OaWireRequest<'a> {
    model: &'a str,
    messages: Vec<OaWireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OaStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OaWireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OaStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OaChatResponse {
    #[serde(default)]
    choices: Vec<OaChoice>,
    usage: Option<OaUsage>,
}

#[derive(Debug, Deserialize)]
struct OaChoice {
    message: OaMessage,
}

#[derive(Debug, Deserialize)]
struct OaMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaStreamChunk {
    #[serde(default)]
    choices: Vec<OaStreamChoice>,
    usage: Option<OaUsage>,
}

#[derive(Debug, Deserialize)]
struct OaStreamChoice {
    delta: OaDelta,
}

#[derive(Debug, Deserialize, Default)]
struct OaDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OaUsage> for Usage {
    fn from(wire: OaUsage) -> Self {
        Self {
            input_tokens: wire.prompt_tokens,
            output_tokens: wire.completion_tokens,
        }
    }
}

fn oa_wire_request(request: &ChatRequest, stream: bool) -> OaWireRequest<'_> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(OaWireMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(OaWireMessage {
        role: "user",
        content: &request.prompt,
    });

    OaWireRequest {
        model: &request.model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream,
        stream_options: stream.then_some(OaStreamOptions {
            include_usage: true,
        }),
    }
}

struct OaDialect {
    provider: String,
}

impl WireDialect for OaDialect {
    fn convert(&mut self, payload: &str, out: &mut VecDeque<StreamEvent>) -> bool {
        let chunk: OaStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(
                    target: "orchestrator::client",
                    provider = %self.provider,
                    payload_len = payload.len(),
                    %err,
                    "skipping malformed stream payload"
                );
                return false;
            }
        };

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    out.push_back(StreamEvent::Delta(text));
                }
            }
        }
        if let Some(usage) = chunk.usage {
            out.push_back(StreamEvent::Usage(usage.into()));
        }
        false
    }
}

// ── Anthropic messages API ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicWireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [OaWireMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicMessageMeta },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicTextDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { usage: AnthropicUsage },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageMeta {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicTextDelta {
    #[serde(default)]
    text: Option<String>,
}

struct AnthropicDialect {
    provider: String,
    input_tokens: u32,
}

impl WireDialect for AnthropicDialect {
    fn convert(&mut self, payload: &str, out: &mut VecDeque<StreamEvent>) -> bool {
        let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(
                    target: "orchestrator::client",
                    provider = %self.provider,
                    payload_len = payload.len(),
                    %err,
                    "skipping malformed stream payload"
                );
                return false;
            }
        };

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                false
            }
            AnthropicStreamEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text {
                    if !text.is_empty() {
                        out.push_back(StreamEvent::Delta(text));
                    }
                }
                false
            }
            AnthropicStreamEvent::MessageDelta { usage } => {
                out.push_back(StreamEvent::Usage(Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: usage.output_tokens,
                }));
                false
            }
            AnthropicStreamEvent::MessageStop => true,
            AnthropicStreamEvent::Other => false,
        }
    }
}

// ============================================================================
// SSE stream driver
// ============================================================================

type BodyStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

struct SseDriver {
    provider: String,
    body: BodyStream,
    parser: SseParser,
    dialect: Box<dyn WireDialect>,
    queue: VecDeque<StreamEvent>,
    closing: bool,
    failed: bool,
    usage_emitted: bool,
}

impl SseDriver {
    fn absorb(&mut self, frames: Vec<SseFrame>) {
        for frame in frames {
            match frame {
                SseFrame::Done => self.closing = true,
                SseFrame::Data(payload) => {
                    if self.dialect.convert(&payload, &mut self.queue) {
                        self.closing = true;
                    }
                }
            }
        }
    }
}

/// Turn a raw SSE body into the uniform event stream.
///
/// Guarantees the terminating usage event: a stream that ends cleanly
/// without reporting usage gets a zeroed one synthesized, so consumers can
/// always treat usage as the end-of-stream marker.
fn drive_sse(provider: String, body: BodyStream, dialect: Box<dyn WireDialect>) -> DeltaStream {
    let driver = SseDriver {
        provider,
        body,
        parser: SseParser::new(),
        dialect,
        queue: VecDeque::new(),
        closing: false,
        failed: false,
        usage_emitted: false,
    };

    Box::pin(futures::stream::unfold(driver, |mut driver| async move {
        loop {
            if let Some(event) = driver.queue.pop_front() {
                if matches!(event, StreamEvent::Usage(_)) {
                    if driver.usage_emitted {
                        continue;
                    }
                    driver.usage_emitted = true;
                }
                return Some((Ok(event), driver));
            }

            if driver.closing {
                if driver.failed || driver.usage_emitted {
                    return None;
                }
                driver.usage_emitted = true;
                return Some((Ok(StreamEvent::Usage(Usage::default())), driver));
            }

            match driver.body.next().await {
                Some(Ok(chunk)) => {
                    let frames = driver.parser.feed(&chunk);
                    driver.absorb(frames);
                }
                Some(Err(err)) => {
                    driver.closing = true;
                    driver.failed = true;
                    let classified = classify_transport(&driver.provider, &err);
                    return Some((Err(classified), driver));
                }
                None => {
                    driver.closing = true;
                    let frames = driver.parser.finish();
                    driver.absorb(frames);
                }
            }
        }
    }))
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

/// Client for OpenAI-compatible chat completion endpoints.
///
/// Dashscope, volcengine (Ark), deepseek, and moonshot all speak this
/// dialect; only the base URL and credentials differ.
///
/// ## Example
///
/// ```no_run
/// use candidate_orchestrator::client::OpenAiCompatClient;
///
/// let client = OpenAiCompatClient::new(
///     "dashscope",
///     "https://dashscope.aliyuncs.com/compatible-mode/v1",
///     Some("sk-...".to_string()),
/// );
/// ```
pub struct OpenAiCompatClient {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatClient {
    /// Create a client for an OpenAI-compatible endpoint.
    ///
    /// `api_key` may be `None` for unauthenticated local endpoints.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the per-request timeout. Covers the full exchange, including
    /// stream consumption.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from a provider config entry, reading the API key from the
    /// configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::ConfigError` if `base_url` is missing or
    /// the key environment variable is set in config but absent from the
    /// environment.
    pub fn from_config(provider: &ProviderConfig) -> Result<Self, OrchestratorError> {
        let base_url = provider.base_url.clone().ok_or_else(|| {
            OrchestratorError::ConfigError(format!("provider {}: base_url missing", provider.name))
        })?;
        let api_key = read_api_key(provider)?;
        Ok(
            Self::new(&provider.name, base_url, api_key)
                .with_timeout(Duration::from_secs(provider.timeout_s)),
        )
    }

    fn request(&self, wire: &OaWireRequest<'_>) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let mut builder = self.http.post(url).timeout(self.timeout).json(wire);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let wire = oa_wire_request(request, false);
        let response = self
            .request(&wire)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(&self.name, status.as_u16(), &body));
        }

        let parsed: OaChatResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed.usage.map(Usage::from).unwrap_or_default();

        Ok(ChatResponse { text, usage })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let wire = oa_wire_request(request, true);
        let response = self
            .request(&wire)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(&self.name, status.as_u16(), &body));
        }

        Ok(drive_sse(
            self.name.clone(),
            Box::pin(response.bytes_stream()),
            Box::new(OaDialect {
                provider: self.name.clone(),
            }),
        ))
    }
}

// ============================================================================
// Anthropic client
// ============================================================================

/// Client for the Anthropic messages API.
pub struct AnthropicClient {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl AnthropicClient {
    /// Create a client for an Anthropic-style endpoint.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from a provider config entry.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::ConfigError` if `base_url` is missing or
    /// the configured key environment variable is unset.
    pub fn from_config(provider: &ProviderConfig) -> Result<Self, OrchestratorError> {
        let base_url = provider.base_url.clone().ok_or_else(|| {
            OrchestratorError::ConfigError(format!("provider {}: base_url missing", provider.name))
        })?;
        let api_key = read_api_key(provider)?;
        Ok(
            Self::new(&provider.name, base_url, api_key)
                .with_timeout(Duration::from_secs(provider.timeout_s)),
        )
    }

    fn request(&self, wire: &AnthropicWireRequest<'_>) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut builder = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(wire);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    fn wire_request<'a>(&self, request: &'a ChatRequest, stream: bool) -> AnthropicWireRequest<'a> {
        AnthropicWireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: [OaWireMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream,
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let wire = self.wire_request(request, false);
        let response = self
            .request(&wire)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(&self.name, status.as_u16(), &body));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let text = parsed
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        let usage = Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };

        Ok(ChatResponse { text, usage })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let wire = self.wire_request(request, true);
        let response = self
            .request(&wire)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(&self.name, status.as_u16(), &body));
        }

        Ok(drive_sse(
            self.name.clone(),
            Box::pin(response.bytes_stream()),
            Box::new(AnthropicDialect {
                provider: self.name.clone(),
                input_tokens: 0,
            }),
        ))
    }
}

fn read_api_key(provider: &ProviderConfig) -> Result<Option<String>, OrchestratorError> {
    match &provider.api_key_env {
        None => Ok(None),
        Some(env_name) => std::env::var(env_name)
            .map(Some)
            .map_err(|_| OrchestratorError::ConfigError(format!("{env_name} not set"))),
    }
}

// ============================================================================
// Echo client (demos and tests)
// ============================================================================

/// Fake provider that fabricates a numbered candidate list.
///
/// Lines embed the physical model name, so fan-outs over several models
/// produce distinct candidates. Useful for pipeline smoke tests without
/// network or credentials.
pub struct EchoClient {
    lines: u32,
    delay: Duration,
}

impl EchoClient {
    /// Echo client producing `lines` candidates per call.
    pub fn new(lines: u32) -> Self {
        Self {
            lines,
            delay: Duration::ZERO,
        }
    }

    /// Add a per-chunk delay to simulate streaming latency.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Duration::from_millis(delay_ms);
        self
    }

    fn fabricate(&self, request: &ChatRequest) -> String {
        (1..=self.lines)
            .map(|i| format!("{i}. {} idea {i}\n", request.model))
            .collect()
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl ProviderClient for EchoClient {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        tokio::time::sleep(self.delay).await;
        let text = self.fabricate(request);
        let output_tokens = text.split_whitespace().count() as u32;
        Ok(ChatResponse {
            text,
            usage: Usage {
                input_tokens: request.prompt.split_whitespace().count() as u32,
                output_tokens,
            },
        })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let text = self.fabricate(request);
        let usage = Usage {
            input_tokens: request.prompt.split_whitespace().count() as u32,
            output_tokens: text.split_whitespace().count() as u32,
        };

        let mut events: Vec<Result<StreamEvent, ProviderError>> = text
            .split_inclusive('\n')
            .map(|line| Ok(StreamEvent::Delta(line.to_string())))
            .collect();
        events.push(Ok(StreamEvent::Usage(usage)));

        let delay = self.delay;
        Ok(Box::pin(futures::stream::iter(events).then(
            move |event| async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                event
            },
        )))
    }
}

// ============================================================================
// Provider set
// ============================================================================

/// All configured provider clients, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderSet {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderSet {
    /// Build every configured provider.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::ConfigError` if any provider is missing
    /// its base URL or API key environment variable.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let mut set = Self::default();
        for provider in &config.providers {
            let client: Arc<dyn ProviderClient> = match provider.kind {
                ProviderKind::OpenaiCompat => {
                    Arc::new(OpenAiCompatClient::from_config(provider)?)
                }
                ProviderKind::Anthropic => Arc::new(AnthropicClient::from_config(provider)?),
                ProviderKind::Echo => Arc::new(EchoClient::default()),
            };
            set.insert(&provider.name, client);
        }
        Ok(set)
    }

    /// Register a client under a provider name.
    ///
    /// Tests and demos use this to inject scripted providers.
    pub fn insert(&mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(name.into(), client);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(name).cloned()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("providers", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "qwen-plus".into(),
            system: Some("You generate candidates.".into()),
            prompt: "List parts of a car".into(),
            temperature: 0.7,
            max_tokens: 500,
        }
    }

    // -- wire request shapes ---------------------------------------------

    #[test]
    fn test_oa_request_includes_stream_options_only_when_streaming() {
        let req = request();
        let streaming = serde_json::to_value(oa_wire_request(&req, true)).expect("test: json");
        assert_eq!(streaming["stream"], true);
        assert_eq!(streaming["stream_options"]["include_usage"], true);

        let oneshot = serde_json::to_value(oa_wire_request(&req, false)).expect("test: json");
        assert_eq!(oneshot["stream"], false);
        assert!(oneshot.get("stream_options").is_none());
    }

    #[test]
    fn test_oa_request_system_message_precedes_user() {
        let req = request();
        let value = serde_json::to_value(oa_wire_request(&req, false)).expect("test: json");
        let messages = value["messages"].as_array().expect("test: messages array");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn test_anthropic_request_omits_system_when_none() {
        let mut req = request();
        req.system = None;
        let client = AnthropicClient::new("anthropic", "https://example.invalid", None);
        let value = serde_json::to_value(client.wire_request(&req, false)).expect("test: json");
        assert!(value.get("system").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    // -- OpenAI-compatible dialect ---------------------------------------

    fn oa_dialect() -> OaDialect {
        OaDialect {
            provider: "dashscope".into(),
        }
    }

    #[test]
    fn test_oa_dialect_extracts_delta_text() {
        let mut dialect = oa_dialect();
        let mut out = VecDeque::new();
        let done = dialect.convert(
            r#"{"choices":[{"delta":{"content":"hello"}}]}"#,
            &mut out,
        );
        assert!(!done);
        assert_eq!(out.pop_front(), Some(StreamEvent::Delta("hello".into())));
    }

    #[test]
    fn test_oa_dialect_usage_only_chunk() {
        let mut dialect = oa_dialect();
        let mut out = VecDeque::new();
        dialect.convert(
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":7}}"#,
            &mut out,
        );
        assert_eq!(
            out.pop_front(),
            Some(StreamEvent::Usage(Usage {
                input_tokens: 3,
                output_tokens: 7,
            }))
        );
    }

    #[test]
    fn test_oa_dialect_skips_malformed_payload() {
        let mut dialect = oa_dialect();
        let mut out = VecDeque::new();
        let done = dialect.convert("{not json", &mut out);
        assert!(!done);
        assert!(out.is_empty());
    }

    #[test]
    fn test_oa_dialect_empty_delta_produces_nothing() {
        let mut dialect = oa_dialect();
        let mut out = VecDeque::new();
        dialect.convert(r#"{"choices":[{"delta":{}}]}"#, &mut out);
        dialect.convert(r#"{"choices":[{"delta":{"content":""}}]}"#, &mut out);
        assert!(out.is_empty());
    }

    // -- Anthropic dialect -----------------------------------------------

    fn anthropic_dialect() -> AnthropicDialect {
        AnthropicDialect {
            provider: "anthropic".into(),
            input_tokens: 0,
        }
    }

    #[test]
    fn test_anthropic_dialect_combines_usage_across_events() {
        let mut dialect = anthropic_dialect();
        let mut out = VecDeque::new();

        dialect.convert(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":11,"output_tokens":0}}}"#,
            &mut out,
        );
        dialect.convert(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"1. wheel"}}"#,
            &mut out,
        );
        dialect.convert(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
            &mut out,
        );

        assert_eq!(out.pop_front(), Some(StreamEvent::Delta("1. wheel".into())));
        assert_eq!(
            out.pop_front(),
            Some(StreamEvent::Usage(Usage {
                input_tokens: 11,
                output_tokens: 9,
            }))
        );
    }

    #[test]
    fn test_anthropic_dialect_message_stop_ends_stream() {
        let mut dialect = anthropic_dialect();
        let mut out = VecDeque::new();
        let done = dialect.convert(r#"{"type":"message_stop"}"#, &mut out);
        assert!(done);
        assert!(out.is_empty());
    }

    #[test]
    fn test_anthropic_dialect_ignores_ping_events() {
        let mut dialect = anthropic_dialect();
        let mut out = VecDeque::new();
        let done = dialect.convert(r#"{"type":"ping"}"#, &mut out);
        assert!(!done);
        assert!(out.is_empty());
    }

    // -- SSE driver ------------------------------------------------------

    fn body_of(chunks: Vec<&str>) -> BodyStream {
        let owned: Vec<Result<bytes::Bytes, reqwest::Error>> = chunks
            .into_iter()
            .map(|c| Ok(bytes::Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        Box::pin(futures::stream::iter(owned))
    }

    #[tokio::test]
    async fn test_drive_sse_yields_deltas_then_usage() {
        let body = body_of(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"1. a\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        ]);
        let stream = drive_sse("dashscope".into(), body, Box::new(oa_dialect()));
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], Ok(StreamEvent::Delta(text)) if text == "1. a"),
            "got {events:?}"
        );
        assert!(matches!(
            &events[1],
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 2,
                output_tokens: 4,
            }))
        ));
    }

    #[tokio::test]
    async fn test_drive_sse_synthesizes_usage_when_provider_omits_it() {
        let body = body_of(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        let stream = drive_sse("dashscope".into(), body, Box::new(oa_dialect()));
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            Ok(StreamEvent::Usage(usage)) if *usage == Usage::default()
        ));
    }

    #[tokio::test]
    async fn test_drive_sse_handles_chunks_split_mid_event() {
        let body = body_of(vec![
            "data: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"split\"}}]}\n\ndata: [DONE]\n\n",
        ]);
        let stream = drive_sse("dashscope".into(), body, Box::new(oa_dialect()));
        let events: Vec<_> = stream.collect().await;
        assert!(
            matches!(&events[0], Ok(StreamEvent::Delta(text)) if text == "split"),
            "got {events:?}"
        );
    }

    // -- echo client -----------------------------------------------------

    #[tokio::test]
    async fn test_echo_stream_yields_lines_then_usage() {
        let client = EchoClient::new(3);
        let stream = client
            .stream_chat(&request())
            .await
            .expect("test: echo stream");
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 4, "3 deltas + usage");
        assert!(matches!(
            events.last(),
            Some(Ok(StreamEvent::Usage(_)))
        ));
        assert!(
            matches!(&events[0], Ok(StreamEvent::Delta(text)) if text.starts_with("1. qwen-plus")),
        );
    }

    #[tokio::test]
    async fn test_echo_chat_fabricates_numbered_list() {
        let client = EchoClient::new(4);
        let response = client.chat(&request()).await.expect("test: echo chat");
        let lines: Vec<&str> = response.text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("4. "));
        assert!(response.usage.output_tokens > 0);
    }

    // -- provider set ----------------------------------------------------

    #[test]
    fn test_provider_set_insert_and_get() {
        let mut set = ProviderSet::default();
        set.insert("echo", Arc::new(EchoClient::default()));
        assert!(set.get("echo").is_some());
        assert!(set.get("dashscope").is_none());
    }
}
