//! Agentic question answering over scanned technical documents.
//!
//! `pagelens` answers natural-language questions about scanned documents by
//! iteratively assembling context for an LLM, letting the model request page
//! images at full or zoomed resolution, and feeding the results back until it
//! produces a final answer. The core abstraction is the
//! [`Orchestrator`](agent::orchestrator::Orchestrator) — a bounded loop that
//! negotiates a budget-fitting prompt, sends it to the model, parses the
//! response for image/zoom/document requests, resolves them against the
//! retrieval index and the page cache, and repeats until the model answers.
//!
//! # Getting started
//!
//! ```ignore
//! use pagelens::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let api_key = std::env::var("OPENROUTER_KEY").unwrap();
//!     let model = ModelClient::new(api_key)?;
//!
//!     let index = DocumentIndex::build(&document_text, 1600);
//!     let fetcher = std::sync::Arc::new(DirectoryFetcher::new("pages/"));
//!     let cache = PageCache::new(scratch_dir, fetcher)?;
//!
//!     let config = RunConfig::new("anthropic/claude-sonnet-4");
//!     let store = NoopStore;
//!     let mut ctx = RunContext::new();
//!
//!     let outcome = Orchestrator::new(&model, &index, &cache, &store, config)
//!         .with_event_handler(&LoggingHandler)
//!         .run("Where does the ventilation riser terminate?", &mut ctx)
//!         .await?;
//!
//!     println!("{}", outcome.answer.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`index`] | Retrieval index: image catalog + text chunks + substring scorer |
//! | [`cache`] | Disk-backed page image cache, preview scaling, zoom crops |
//! | [`protocol`] | Tool-call parser for raw model output |
//! | [`context`] | Context-budget negotiator with mode fallback |
//! | [`agent`] | Orchestrator loop, run context, events, config |
//! | [`store`] | Transcript and object storage collaborator traits |
//! | [`api`] | Retry policy and error classification for the model endpoint |
//!
//! # Design principles
//!
//! 1. **The context window is the scarcest resource.** Every prompt is
//!    assembled by the negotiator, which shrinks history deterministically
//!    and falls back between operating modes before giving up.
//!
//! 2. **An id is fetched from its source at most once per process.** The page
//!    cache is append-only; zoom crops always compute against the locally
//!    cached full-resolution raster.
//!
//! 3. **Observability over magic.** The loop reports every delivered image,
//!    rejected zoom, and token count through the
//!    [`EventHandler`](agent::events::EventHandler) trait.
//!
//! 4. **Cancellation is cooperative and prompt.** A
//!    [`CancelToken`](agent::run_context::CancelToken) is polled before every
//!    blocking call; partial results already on disk stay valid.

pub mod agent;
pub mod api;
pub mod cache;
pub mod context;
pub mod index;
pub mod prelude;
pub mod protocol;
pub mod store;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// An inline image reference inside a multimodal content part.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageUrl {
    /// Typically a `data:image/png;base64,…` URL.
    pub url: String,
}

/// One part of a multimodal message (OpenAI content-parts format).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message content: plain text for the common case, content parts when
/// inline image data is attached.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Total characters of text content (image parts contribute zero).
    pub fn text_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }

    /// Number of inline images attached.
    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// A user message carrying text plus inline images.
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(
            image_urls
                .into_iter()
                .map(|url| ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                }),
        );
        Self {
            role: MessageRole::User,
            content: MessageContent::Parts(parts),
        }
    }
}

// ── Request / response types ───────────────────────────────────────

/// Chat completion request body. Only the fields this crate uses; unused
/// optional fields are omitted from serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from a model completion call.
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Model endpoint seam ────────────────────────────────────────────

/// Boxed future returned by [`ModelEndpoint::complete`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ChatCompletion, String>> + Send + 'a>>;

/// The external model endpoint the orchestrator talks to.
///
/// The production implementation is [`ModelClient`]; tests script responses
/// with a stub. Uses a boxed future so the trait is dyn-compatible.
pub trait ModelEndpoint: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> ModelFuture<'_>;
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
///
/// Applies a hard request timeout and retries transient failures with
/// exponential backoff before surfacing an error to the loop.
pub struct ModelClient {
    client: reqwest::Client,
    api_key: String,
    retry: api::retry::RetryConfig,
}

impl ModelClient {
    /// Create a new client with the given API key and a 120 s timeout.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("pagelens/0.2")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            retry: api::retry::RetryConfig::with_retries(2),
        })
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: api::retry::RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Send a single chat completion request (no retry).
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        let msg_count = body.messages.len();
        let image_count: usize = body.messages.iter().map(|m| m.content.image_count()).sum();
        debug!(
            "LLM request: model={}, messages={}, images={}, max_tokens={}",
            body.model.as_deref().unwrap_or("(none)"),
            msg_count,
            image_count,
            body.max_tokens,
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        match parsed.choices.and_then(|c| c.into_iter().next()) {
            Some(c) => Ok(ChatCompletion {
                content: c.message.content,
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            }),
            None => Ok(ChatCompletion {
                content: None,
                usage: parsed.usage,
                finish_reason: None,
            }),
        }
    }

    /// Send a chat completion request, retrying transient failures.
    ///
    /// Context-length-exceeded errors are never retried here — the loop
    /// handles them by renegotiating the prompt.
    pub async fn chat_with_retry(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        let mut attempt = 0u32;
        loop {
            match self.chat(body).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    if api::retry::is_context_overflow_error(&e)
                        || !api::retry::is_transient_error(&e)
                        || attempt >= self.retry.max_retries
                    {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Transient model error (attempt {}): {e}. Retrying in {delay:?}.",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl ModelEndpoint for ModelClient {
    fn complete(&self, request: &ChatRequest) -> ModelFuture<'_> {
        // The request body is cheap relative to the network round trip;
        // cloning keeps the trait free of caller lifetimes.
        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        Box::pin(async move { self.chat_with_retry(&body).await })
    }
}

// ── Inline image encoding ──────────────────────────────────────────

/// Read an image file and encode it as a base64 data URL for inline
/// transmission to the model endpoint.
pub fn encode_image_data_url(path: &Path) -> Result<String, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("failed to read image {}: {e}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}
