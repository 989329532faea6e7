use ai_client::AiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TweetFilterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Media extraction failed for item {item_id}")]
    MediaExtraction { item_id: String },

    #[error("Item {item_id} is no longer rendered")]
    ItemNotRendered { item_id: String },

    #[error("Score error: {0}")]
    Score(#[from] ScoreError),

    #[error("Completion error: {0}")]
    Completion(#[from] AiError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl TweetFilterError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TweetFilterError::Config(_) => false,
            TweetFilterError::Completion(e) => e.is_retryable(),
            _ => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoreError {
    #[error("no score marker in response")]
    Missing,

    #[error("unparsable score: {0:?}")]
    Unparsable(String),

    #[error("score {0} is outside 0..=10")]
    OutOfRange(u64),
}
