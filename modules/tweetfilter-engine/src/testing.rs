// Test mocks for the rating pipeline.
//
// Three mocks matching the trait boundaries the engine consumes:
// - MockCompletionClient (CompletionClient): scripted replies, synthetic SSE streams
// - MockFeedView (FeedView): mutable rendered cells, anchor and markers
// - CountingDescriber (MediaDescriber): counts calls, optional delay
//
// Plus helpers for building a fast test config and waiting on item states.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ai_client::{
    AiError, ChunkCallback, Completion, CompletionClient, CompletionRequest, GenerationMetadata,
    StreamLimits, StreamingSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use tweetfilter_common::config::TimingConfig;
use tweetfilter_common::{Config, Item, ItemId, RatingState};

use crate::describer::MediaDescriber;
use crate::scheduler::RatingScheduler;
use crate::view::{Cell, FeedView};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// MockCompletionClient
// ---------------------------------------------------------------------------

/// Generation id carried by every scripted reply.
pub const MOCK_GENERATION_ID: &str = "gen-mock";

#[derive(Debug, Clone)]
enum Reply {
    Chunks(Vec<String>),
    Stall(Vec<String>),
    Error(AiError),
}

/// Completion client that plays back scripted replies in order, for both
/// blocking and streaming calls. An exhausted script yields a network error
/// unless a default reply is set.
/// Builder pattern: `.reply_text()`, `.stream_text()`, `.stall_after()`, `.reply_error()`.
pub struct MockCompletionClient {
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Option<Reply>,
    requests: Mutex<Vec<CompletionRequest>>,
    generation: Mutex<Option<GenerationMetadata>>,
    generation_calls: AtomicUsize,
    latency: Duration,
    limits: StreamLimits,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: None,
            requests: Mutex::new(Vec::new()),
            generation: Mutex::new(None),
            generation_calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
            limits: StreamLimits::default(),
        }
    }

    /// A reply delivered whole, or as a single chunk when streamed.
    pub fn reply_text(self, text: &str) -> Self {
        self.push(Reply::Chunks(vec![text.to_string()]))
    }

    /// A streamed reply split into the given chunks, then `[DONE]`.
    pub fn stream_text(self, chunks: &[&str]) -> Self {
        self.push(Reply::Chunks(chunks.iter().map(|c| c.to_string()).collect()))
    }

    /// A stream that sends the given chunks and then goes silent.
    pub fn stall_after(self, chunks: &[&str]) -> Self {
        self.push(Reply::Stall(chunks.iter().map(|c| c.to_string()).collect()))
    }

    pub fn reply_error(self, error: AiError) -> Self {
        self.push(Reply::Error(error))
    }

    /// Played whenever the script runs out.
    pub fn default_text(mut self, text: &str) -> Self {
        self.default_reply = Some(Reply::Chunks(vec![text.to_string()]));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_limits(mut self, limits: StreamLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_generation(self, metadata: GenerationMetadata) -> Self {
        *lock(&self.generation) = Some(metadata);
        self
    }

    fn push(self, reply: Reply) -> Self {
        lock(&self.replies).push_back(reply);
        self
    }

    fn next_reply(&self, request: &CompletionRequest) -> Reply {
        lock(&self.requests).push(request.clone());
        lock(&self.replies)
            .pop_front()
            .or_else(|| self.default_reply.clone())
            .unwrap_or_else(|| Reply::Error(AiError::Network("no scripted reply".to_string())))
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn generation_calls(&self) -> usize {
        self.generation_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

/// One SSE frame carrying a content delta.
pub fn sse_frame(content: &str) -> String {
    let payload = serde_json::json!({
        "id": MOCK_GENERATION_ID,
        "choices": [{ "delta": { "content": content } }]
    });
    format!("data: {payload}\n\n")
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, AiError> {
        let reply = self.next_reply(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match reply {
            Reply::Chunks(chunks) | Reply::Stall(chunks) => Ok(Completion {
                content: chunks.concat(),
                reasoning: String::new(),
                generation_id: Some(MOCK_GENERATION_ID.to_string()),
            }),
            Reply::Error(e) => Err(e),
        }
    }

    fn stream(&self, request: &CompletionRequest, on_chunk: ChunkCallback) -> StreamingSession {
        let reply = self.next_reply(request);
        let latency = self.latency;

        let connect = async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let frames = |chunks: Vec<String>| {
                chunks
                    .iter()
                    .map(|c| Ok(Bytes::from(sse_frame(c))))
                    .collect::<Vec<Result<Bytes, AiError>>>()
            };
            let body: BoxStream<'static, Result<Bytes, AiError>> = match reply {
                Reply::Chunks(chunks) => {
                    let mut frames = frames(chunks);
                    frames.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
                    stream::iter(frames).boxed()
                }
                Reply::Stall(chunks) => stream::iter(frames(chunks))
                    .chain(stream::pending())
                    .boxed(),
                Reply::Error(e) => return Err(e),
            };
            Ok(body)
        };
        StreamingSession::spawn(connect, on_chunk, self.limits)
    }

    async fn generation(&self, _generation_id: &str) -> Result<GenerationMetadata, AiError> {
        self.generation_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.generation)
            .clone()
            .ok_or_else(|| AiError::Api {
                status: 404,
                body: "generation not found".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MockFeedView
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ViewState {
    cells: Vec<Cell>,
    next_top: f64,
    conversation: Option<String>,
    anchor: Option<ItemId>,
    fallbacks: HashMap<ItemId, String>,
    marker: bool,
    lookups: HashMap<ItemId, usize>,
}

/// In-memory rendered feed. Cells are stacked top to bottom in the order
/// they are added.
/// Builder pattern: `.with_item()`, `.with_separator()`, `.in_conversation()`.
pub struct MockFeedView {
    state: Mutex<ViewState>,
}

impl MockFeedView {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ViewState::default()),
        }
    }

    pub fn with_item(self, item: Item) -> Self {
        self.push_item(item);
        self
    }

    pub fn with_separator(self) -> Self {
        {
            let mut state = lock(&self.state);
            let top = state.next_top;
            state.cells.push(Cell::separator(top));
            state.next_top += 10.0;
        }
        self
    }

    /// Show a conversation page. `anchor` is the item its address names.
    pub fn in_conversation(self, key: &str, anchor: Option<&str>) -> Self {
        {
            let mut state = lock(&self.state);
            state.conversation = Some(key.to_string());
            state.anchor = anchor.map(str::to_string);
        }
        self
    }

    pub fn push_item(&self, item: Item) {
        let mut state = lock(&self.state);
        let top = state.next_top;
        state.cells.push(Cell::item(top, item));
        state.next_top += 10.0;
    }

    pub fn remove_item(&self, id: &str) {
        lock(&self.state)
            .cells
            .retain(|c| c.item.as_ref().map(|i| i.id.as_str()) != Some(id));
    }

    /// How many times `item(id)` was asked for.
    pub fn lookups(&self, id: &str) -> usize {
        lock(&self.state).lookups.get(id).copied().unwrap_or(0)
    }
}

impl Default for MockFeedView {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedView for MockFeedView {
    fn visible_items(&self) -> Vec<Item> {
        lock(&self.state)
            .cells
            .iter()
            .filter_map(|c| c.item.clone())
            .collect()
    }

    fn item(&self, id: &str) -> Option<Item> {
        let mut state = lock(&self.state);
        *state.lookups.entry(id.to_string()).or_default() += 1;
        state
            .cells
            .iter()
            .filter_map(|c| c.item.as_ref())
            .find(|i| i.id == id)
            .cloned()
    }

    fn cells(&self) -> Vec<Cell> {
        lock(&self.state).cells.clone()
    }

    fn conversation(&self) -> Option<String> {
        lock(&self.state).conversation.clone()
    }

    fn anchor_id(&self) -> Option<ItemId> {
        lock(&self.state).anchor.clone()
    }

    fn context_fallback(&self, id: &str) -> Option<String> {
        lock(&self.state).fallbacks.get(id).cloned()
    }

    fn set_context_fallback(&self, id: &str, context: &str) {
        lock(&self.state)
            .fallbacks
            .insert(id.to_string(), context.to_string());
    }

    fn mapping_marker(&self) -> bool {
        lock(&self.state).marker
    }

    fn set_mapping_marker(&self, in_progress: bool) {
        lock(&self.state).marker = in_progress;
    }
}

// ---------------------------------------------------------------------------
// CountingDescriber
// ---------------------------------------------------------------------------

/// Describes every URL as `[IMAGE i]: image of <url>` after an optional delay.
pub struct CountingDescriber {
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingDescriber {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for CountingDescriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDescriber for CountingDescriber {
    async fn describe(&self, urls: &[String]) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        urls.iter()
            .enumerate()
            .map(|(i, url)| format!("[IMAGE {}]: image of {url}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Defaults with short timers and an API key.
pub fn test_config() -> Config {
    Config {
        api_key: Some("test-key".to_string()),
        timing: TimingConfig {
            processing_delay_ms: 10,
            api_call_spacing_ms: 5,
            max_retries: 3,
            backoff_base_ms: 10,
            request_timeout_ms: 1_000,
            stream_timeout_ms: 5_000,
            inactivity_timeout_ms: 500,
            mapping_timeout_ms: 1_000,
            mapping_cooldown_ms: 10_000,
            sweep_interval_ms: 200,
            cache_flush_ms: 50,
            stuck_after_ms: 2_000,
        },
        ..Config::default()
    }
}

/// Stream limits matching [`test_config`].
pub fn test_limits() -> StreamLimits {
    StreamLimits {
        overall: Duration::from_millis(5_000),
        inactivity: Duration::from_millis(500),
        max_empty_chunks: 3,
    }
}

/// Poll until the item reaches `state`. Meant for paused-time tests, where
/// each sleep lets the runtime advance the clock.
pub async fn wait_for_state(scheduler: &RatingScheduler, id: &str, state: RatingState) -> bool {
    for _ in 0..2_000 {
        if scheduler.state(id) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
