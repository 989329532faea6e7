use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("SAFETY FILTER: the provider blocked this response under its content policy")]
    SafetyFilter,

    #[error("Empty response from completion service")]
    EmptyResponse,
}

impl AiError {
    /// Configuration problems cannot be fixed by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AiError::Config(_))
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::Timeout(e.to_string())
        } else {
            AiError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(e: serde_json::Error) -> Self {
        AiError::Parse(e.to_string())
    }
}
