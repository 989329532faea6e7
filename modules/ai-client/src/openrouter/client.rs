use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use super::types::*;
use crate::error::AiError;
use crate::traits::GenerationMetadata;

pub(crate) const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Clone)]
pub(crate) struct OpenRouterClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    app_name: Option<String>,
    site_url: Option<String>,
}

impl OpenRouterClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: OPENROUTER_API_URL.to_string(),
            app_name: None,
            site_url: None,
        }
    }

    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app_name = Some(name.to_string());
        self
    }

    pub fn with_site_url(mut self, url: &str) -> Self {
        self.site_url = Some(url.to_string());
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, AiError> {
        if self.api_key.trim().is_empty() {
            return Err(AiError::Config("OpenRouter API key is not set".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| AiError::Config(format!("invalid API key header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(ref url) = self.site_url {
            if let Ok(val) = HeaderValue::from_str(url) {
                headers.insert("HTTP-Referer", val);
            }
        }

        if let Some(ref name) = self.app_name {
            if let Ok(val) = HeaderValue::from_str(name) {
                headers.insert("X-Title", val);
            }
        }

        Ok(headers)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(AiError::Api { status, body })
    }

    pub async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, AiError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "OpenRouter chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let response = Self::check(response).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Open a streaming chat request and hand back the raw body stream.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, AiError>>, AiError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "OpenRouter streaming request");

        let mut headers = self.headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let response = Self::check(response).await?;
        Ok(response.bytes_stream().map_err(AiError::from).boxed())
    }

    pub async fn generation(&self, id: &str) -> Result<GenerationMetadata, AiError> {
        let url = format!("{}/generation", self.base_url);

        let response = self
            .http
            .get(&url)
            .headers(self.headers()?)
            .query(&[("id", id)])
            .send()
            .await?;

        let response = Self::check(response).await?;
        let text = response.text().await?;
        let parsed: GenerationResponse = serde_json::from_str(&text)?;
        Ok(parsed.data)
    }
}
