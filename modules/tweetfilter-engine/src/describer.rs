use std::sync::Arc;

use ai_client::{CompletionClient, CompletionRequest, ContentPart, Message};
use async_trait::async_trait;
use tracing::{debug, warn};

const DESCRIBE_PROMPT: &str = "Describe what you see in this image in a concise way, \
focusing on the main elements and any text visible. Keep the description under 100 words.";

/// Turns media URLs into text the rating model can read.
#[async_trait]
pub trait MediaDescriber: Send + Sync {
    async fn describe(&self, urls: &[String]) -> String;
}

/// Used when image descriptions are turned off.
pub struct DisabledDescriber;

#[async_trait]
impl MediaDescriber for DisabledDescriber {
    async fn describe(&self, _urls: &[String]) -> String {
        "[Image descriptions disabled]".to_string()
    }
}

/// Asks a vision-capable model for one description per image.
pub struct CompletionDescriber {
    client: Arc<dyn CompletionClient>,
    model: String,
    temperature: f32,
    top_p: f32,
}

impl CompletionDescriber {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.5,
            top_p: 0.9,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }
}

#[async_trait]
impl MediaDescriber for CompletionDescriber {
    async fn describe(&self, urls: &[String]) -> String {
        let mut lines = Vec::with_capacity(urls.len());
        for (i, url) in urls.iter().enumerate() {
            let request = CompletionRequest::new(&self.model)
                .message(Message::user_parts(vec![
                    ContentPart::text(DESCRIBE_PROMPT),
                    ContentPart::image(url),
                ]))
                .temperature(self.temperature)
                .top_p(self.top_p);

            let description = match self.client.complete(&request).await {
                Ok(completion) => completion.content.trim().to_string(),
                Err(e) => {
                    warn!(url = %url, error = %e, "Image description failed");
                    "[Error getting image description]".to_string()
                }
            };
            lines.push(format!("[IMAGE {}]: {}", i + 1, description));
        }
        debug!(images = urls.len(), "Described media");
        lines.join("\n")
    }
}
