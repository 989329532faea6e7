pub mod error;
pub mod openrouter;
pub mod stream;
pub mod traits;

pub use error::AiError;
pub use openrouter::OpenRouter;
pub use stream::{AbortHandle, SseDecoder, SseEvent, StreamLimits, StreamingSession};
pub use traits::{
    ChunkCallback, Completion, CompletionClient, CompletionRequest, ContentPart,
    GenerationMetadata, Message, MessageContent, MessageRole, StreamCompletion, StreamEnd,
    StreamOutcome, StreamProgress,
};
