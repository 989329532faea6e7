mod client;
pub(crate) mod types;

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AiError;
use crate::stream::{StreamLimits, StreamingSession};
use crate::traits::{
    ChunkCallback, Completion, CompletionClient, CompletionRequest, GenerationMetadata,
};

use client::OpenRouterClient;
use types::{ChatRequest, ChatResponse};

// =============================================================================
// OpenRouter Client
// =============================================================================

#[derive(Clone)]
pub struct OpenRouter {
    api_key: String,
    app_name: Option<String>,
    site_url: Option<String>,
    base_url: Option<String>,
    request_timeout: Duration,
    stream_limits: StreamLimits,
}

impl OpenRouter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            app_name: None,
            site_url: None,
            base_url: None,
            request_timeout: Duration::from_secs(30),
            stream_limits: StreamLimits::default(),
        }
    }

    pub fn from_env() -> Result<Self, AiError> {
        let api_key = std::env::var("OPENROUTER_API_KEY").map_err(|_| {
            AiError::Config("OPENROUTER_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn with_site_url(mut self, url: impl Into<String>) -> Self {
        self.site_url = Some(url.into());
        self
    }

    /// Point at an OpenRouter-compatible endpoint other than the public one.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Overall timeout for blocking requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stream_limits(mut self, limits: StreamLimits) -> Self {
        self.stream_limits = limits;
        self
    }

    pub(crate) fn client(&self) -> OpenRouterClient {
        let mut client = OpenRouterClient::new(&self.api_key);
        if let Some(ref name) = self.app_name {
            client = client.with_app_name(name);
        }
        if let Some(ref url) = self.site_url {
            client = client.with_site_url(url);
        }
        if let Some(ref url) = self.base_url {
            client = client.with_base_url(url);
        }
        client
    }
}

/// Reduce a blocking response to content and reasoning. An empty body is an
/// error, tagged as a safety filter when the provider says so.
pub(crate) fn completion_from_response(response: ChatResponse) -> Result<Completion, AiError> {
    let generation_id = response.id;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(AiError::EmptyResponse)?;

    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        if choice.native_finish_reason.as_deref() == Some("SAFETY") {
            return Err(AiError::SafetyFilter);
        }
        return Err(AiError::EmptyResponse);
    }

    Ok(Completion {
        content,
        reasoning: choice.message.reasoning.unwrap_or_default(),
        generation_id,
    })
}

// =============================================================================
// CompletionClient Implementation
// =============================================================================

#[async_trait]
impl CompletionClient for OpenRouter {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AiError> {
        let wire = ChatRequest::from_request(request, false);
        let response = self.client().chat(&wire, self.request_timeout).await?;
        let completion = completion_from_response(response)?;
        debug!(
            model = %request.model,
            content_len = completion.content.len(),
            "OpenRouter completion received"
        );
        Ok(completion)
    }

    fn stream(&self, request: &CompletionRequest, on_chunk: ChunkCallback) -> StreamingSession {
        let wire = ChatRequest::from_request(request, true);
        let client = self.client();
        StreamingSession::spawn(
            async move { client.chat_stream(&wire).await },
            on_chunk,
            self.stream_limits,
        )
    }

    async fn generation(&self, generation_id: &str) -> Result<GenerationMetadata, AiError> {
        self.client().generation(generation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Message;

    fn response(json: serde_json::Value) -> ChatResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_openrouter_new() {
        let or = OpenRouter::new("or-test");
        assert_eq!(or.api_key, "or-test");
        assert_eq!(or.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_openrouter_with_app_name() {
        let or = OpenRouter::new("or-test")
            .with_app_name("TweetFilter-AI")
            .with_site_url("https://greasyfork.org/en/scripts/532459-tweetfilter-ai");
        assert_eq!(or.app_name.as_deref(), Some("TweetFilter-AI"));
        assert!(or.site_url.is_some());
    }

    #[test]
    fn completion_returns_content_and_reasoning() {
        let completion = completion_from_response(response(serde_json::json!({
            "id": "gen-9",
            "choices": [{"message": {"content": "SCORE_8", "reasoning": "short"}}]
        })))
        .unwrap();
        assert_eq!(completion.content, "SCORE_8");
        assert_eq!(completion.reasoning, "short");
        assert_eq!(completion.generation_id.as_deref(), Some("gen-9"));
    }

    #[test]
    fn empty_content_with_safety_finish_is_tagged() {
        let err = completion_from_response(response(serde_json::json!({
            "choices": [{"message": {"content": ""}, "native_finish_reason": "SAFETY"}]
        })))
        .unwrap_err();
        assert!(matches!(err, AiError::SafetyFilter));
    }

    #[test]
    fn empty_content_without_safety_is_plain_empty() {
        let err = completion_from_response(response(serde_json::json!({
            "choices": [{"message": {"content": null}, "native_finish_reason": "STOP"}]
        })))
        .unwrap_err();
        assert!(matches!(err, AiError::EmptyResponse));
    }

    #[test]
    fn wire_request_carries_provider_and_stream_flag() {
        let request = CompletionRequest::new("google/gemini-flash")
            .message(Message::user("hi"))
            .temperature(0.5)
            .top_p(0.9)
            .provider_sort("throughput");

        let streaming = serde_json::to_value(ChatRequest::from_request(&request, true)).unwrap();
        assert_eq!(streaming["stream"], true);
        assert_eq!(streaming["provider"]["sort"], "throughput");
        assert_eq!(streaming["provider"]["allow_fallbacks"], true);
        assert!(streaming.get("max_tokens").is_none());

        let blocking = serde_json::to_value(ChatRequest::from_request(&request, false)).unwrap();
        assert!(blocking.get("stream").is_none());
    }

    #[tokio::test]
    async fn missing_key_is_a_configuration_error() {
        let or = OpenRouter::new("");
        let err = or
            .complete(&CompletionRequest::new("m").message(Message::user("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_key_fails_stream_without_network() {
        let or = OpenRouter::new("  ");
        let session = or.stream(
            &CompletionRequest::new("m").message(Message::user("x")),
            Box::new(|_| {}),
        );
        assert!(matches!(session.finish().await, Err(AiError::Config(_))));
    }
}
