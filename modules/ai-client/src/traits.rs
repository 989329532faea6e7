use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AiError;
use crate::stream::StreamingSession;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One typed part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message body: either plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// All text carried by this message, parts joined by newlines.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Image URLs attached to this message.
    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Requests and Results
// =============================================================================

/// Provider-agnostic completion request: model id, messages, sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub provider_sort: Option<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            provider_sort: None,
        }
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn provider_sort(mut self, sort: impl Into<String>) -> Self {
        self.provider_sort = Some(sort.into());
        self
    }
}

/// Result of a blocking completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub reasoning: String,
    pub generation_id: Option<String>,
}

/// Running totals handed to the chunk callback after every delta.
#[derive(Debug, Clone, Copy)]
pub struct StreamProgress<'a> {
    pub content: &'a str,
    pub reasoning: &'a str,
    pub delta: &'a str,
}

pub type ChunkCallback = Box<dyn FnMut(StreamProgress<'_>) + Send>;

/// How a stream that produced a result came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The `[DONE]` marker arrived.
    Done,
    /// The server closed the connection.
    Closed,
    /// Several consecutive empty chunks arrived.
    EmptyChunks,
    /// No chunk arrived within the inactivity window.
    Idle,
    /// The session was cancelled through its abort handle.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCompletion {
    pub content: String,
    pub reasoning: String,
    pub generation_id: Option<String>,
    pub end: StreamEnd,
}

impl StreamCompletion {
    pub fn timed_out(&self) -> bool {
        self.end == StreamEnd::Idle
    }

    pub fn aborted(&self) -> bool {
        self.end == StreamEnd::Aborted
    }
}

/// The single terminal outcome of a streaming session.
pub type StreamOutcome = Result<StreamCompletion, AiError>;

/// Usage and cost details reported for a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    #[serde(default)]
    pub tokens_completion: Option<u64>,
    #[serde(default)]
    pub native_tokens_reasoning: Option<u64>,
    #[serde(default)]
    pub latency: Option<f64>,
    #[serde(default)]
    pub num_media_prompt: Option<u64>,
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub provider_name: Option<String>,
}

// =============================================================================
// CompletionClient Trait
// =============================================================================

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Issue a request and wait for the whole response.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AiError>;

    /// Start a streaming request. `on_chunk` sees running totals after every
    /// delta; the session yields exactly one terminal outcome.
    fn stream(&self, request: &CompletionRequest, on_chunk: ChunkCallback) -> StreamingSession;

    /// Look up usage details for a finished generation.
    async fn generation(&self, generation_id: &str) -> Result<GenerationMetadata, AiError>;
}
