//! Per-item rating lifecycle.
//!
//! The scheduler decides whether an item needs work, debounces it, resolves
//! its context, calls the completion service under a process-wide rate
//! limit, retries with quadratic backoff and records the outcome in the
//! cache and in the item's state. A periodic sweep picks up anything that
//! fell through.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ai_client::{
    AbortHandle, ChunkCallback, CompletionClient, CompletionRequest, StreamProgress,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use tweetfilter_common::{
    CacheUpdate, Config, Item, ItemId, RatingEvent, RatingState, Score, TweetFilterError,
};

use crate::cache::RatingCache;
use crate::context::{ContextOptions, ContextResolver};
use crate::describer::{DisabledDescriber, MediaDescriber};
use crate::prompt;
use crate::rate_limit::RateLimiter;
use crate::relationships::RelationshipTable;
use crate::thread_mapper::{MappingOutcome, ThreadMapper};
use crate::view::FeedView;

/// Delays before each generation metadata lookup, in milliseconds.
const METADATA_RETRY_DELAYS_MS: [u64; 5] = [1000, 500, 2000, 4000, 8000];

const EVENT_CAPACITY: usize = 256;

/// Long-lived collaborators the scheduler is built from.
#[derive(Clone, TypedBuilder)]
pub struct SchedulerDeps {
    pub config: Arc<Config>,
    pub cache: RatingCache,
    pub relationships: RelationshipTable,
    pub view: Arc<dyn FeedView>,
    pub client: Arc<dyn CompletionClient>,
    #[builder(default = Arc::new(DisabledDescriber))]
    pub describer: Arc<dyn MediaDescriber>,
}

/// What the scheduler currently believes about one item.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub state: RatingState,
    pub score: Option<Score>,
    pub description: String,
    pub reasoning: String,
    pub updated: Instant,
    /// An error that retrying cannot fix.
    pub terminal: bool,
}

/// How `schedule` disposed of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// A stream for this item is already running.
    StreamActive,
    /// Accepted without a call: ad or blacklisted author.
    Accepted(RatingState),
    /// Known state re-rendered, nothing else to do.
    Rerendered(RatingState),
    WaitingForMapping,
    FromCache(RatingState),
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub visible: usize,
    pub rescheduled: usize,
    pub evicted: usize,
}

struct ActiveStream {
    session_id: u64,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct ItemTable {
    records: HashMap<ItemId, ItemRecord>,
    processing: HashSet<ItemId>,
    streams: HashMap<ItemId, ActiveStream>,
}

/// Content of one finished call.
struct RatedText {
    content: String,
    reasoning: String,
    generation_id: Option<String>,
}

#[derive(Clone)]
pub struct RatingScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: Arc<Config>,
    cache: RatingCache,
    view: Arc<dyn FeedView>,
    client: Arc<dyn CompletionClient>,
    mapper: Arc<ThreadMapper>,
    resolver: ContextResolver,
    limiter: RateLimiter,
    table: Mutex<ItemTable>,
    events: broadcast::Sender<RatingEvent>,
    next_session: AtomicU64,
}

impl RatingScheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        let SchedulerDeps {
            config,
            cache,
            relationships,
            view,
            client,
            describer,
        } = deps;
        let timing = &config.timing;

        let mapper = Arc::new(ThreadMapper::new(
            cache.clone(),
            relationships.clone(),
            timing.mapping_timeout(),
            timing.mapping_cooldown(),
        ));
        let resolver = ContextResolver::new(
            cache.clone(),
            relationships,
            mapper.clone(),
            view.clone(),
            describer,
            ContextOptions {
                describe_images: config.rating.describe_images,
                model_supports_images: config.model.supports_images,
                max_depth: config.rating.max_thread_depth,
                ancestor_timeout: timing.request_timeout(),
            },
        );
        let limiter = RateLimiter::new(timing.api_call_spacing());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                cache,
                view,
                client,
                mapper,
                resolver,
                limiter,
                table: Mutex::new(ItemTable::default()),
                events,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, ItemTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RatingEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, id: &str) -> Option<RatingState> {
        self.table().records.get(id).map(|r| r.state)
    }

    pub fn record(&self, id: &str) -> Option<ItemRecord> {
        self.table().records.get(id).cloned()
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.table().streams.contains_key(id)
    }

    pub fn cache(&self) -> &RatingCache {
        &self.inner.cache
    }

    pub fn cache_count(&self) -> usize {
        self.inner.cache.count()
    }

    pub fn mapper(&self) -> &ThreadMapper {
        &self.inner.mapper
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Move an item to `state` if the transition is allowed and announce it.
    fn set_state(
        &self,
        id: &str,
        state: RatingState,
        score: Option<Score>,
        description: &str,
        reasoning: &str,
    ) -> bool {
        let event = {
            let mut table = self.table();
            let current = table.records.get(id).map(|r| r.state);
            if let Some(current) = current {
                if !current.can_transition_to(state) {
                    drop(table);
                    warn!(item_id = %id, from = %current, to = %state, "Rejected state transition");
                    return false;
                }
            }
            table.records.insert(
                id.to_string(),
                ItemRecord {
                    state,
                    score,
                    description: description.to_string(),
                    reasoning: reasoning.to_string(),
                    updated: Instant::now(),
                    terminal: false,
                },
            );
            RatingEvent {
                item_id: id.to_string(),
                status: state,
                score,
                description: description.to_string(),
                reasoning: reasoning.to_string(),
            }
        };
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
        true
    }

    fn rerender(&self, id: &str) -> Option<RatingState> {
        let record = self.record(id)?;
        let _ = self.inner.events.send(RatingEvent {
            item_id: id.to_string(),
            status: record.state,
            score: record.score,
            description: record.description,
            reasoning: record.reasoning,
        });
        Some(record.state)
    }

    fn set_terminal_error(&self, id: &str, message: &str) {
        if self.set_state(id, RatingState::Error, None, message, "") {
            if let Some(record) = self.table().records.get_mut(id) {
                record.terminal = true;
            }
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Decide what an encountered item needs and start it.
    pub fn schedule(&self, item: &Item) -> Scheduled {
        let id = item.id.as_str();

        let (record, processing) = {
            let table = self.table();
            if table.streams.contains_key(id) {
                return Scheduled::StreamActive;
            }
            (table.records.get(id).cloned(), table.processing.contains(id))
        };

        if item.is_ad {
            self.set_state(id, RatingState::Blacklisted, Some(Score::AD), "Advertisement", "");
            return Scheduled::Accepted(RatingState::Blacklisted);
        }
        if self.inner.config.rating.is_blacklisted(&item.author) {
            self.set_state(
                id,
                RatingState::Blacklisted,
                Some(Score::TRUSTED),
                "Blacklisted author",
                "",
            );
            return Scheduled::Accepted(RatingState::Blacklisted);
        }

        if let Some(record) = &record {
            let settled = record.state.is_final() || record.terminal;
            if settled || (record.state.is_interim() && processing) {
                self.rerender(id);
                return Scheduled::Rerendered(record.state);
            }
        }

        if self
            .inner
            .mapper
            .wait_if_pending(self.inner.view.as_ref(), id)
        {
            self.set_state(
                id,
                RatingState::Pending,
                None,
                "Waiting for thread context...",
                "",
            );
            self.ensure_mapping();
            return Scheduled::WaitingForMapping;
        }

        if self.apply_cached_rating(item) {
            return Scheduled::FromCache(self.state(id).unwrap_or(RatingState::Rated));
        }

        self.set_state(id, RatingState::Pending, None, "Rating...", "");
        self.table().processing.insert(id.to_string());

        let this = self.clone();
        let item_id = id.to_string();
        let delay = self.inner.config.timing.processing_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.process(&item_id, false).await;
        });
        Scheduled::Queued
    }

    /// Put a finished cached rating on the item. Returns whether one existed.
    pub fn apply_cached_rating(&self, item: &Item) -> bool {
        let Some(entry) = self.inner.cache.get_final(&item.id) else {
            return false;
        };
        let state = if entry.from_storage {
            RatingState::Cached
        } else {
            RatingState::Rated
        };
        debug!(item_id = %item.id, state = %state, "Applying cached rating");
        self.set_state(
            &item.id,
            state,
            entry.score,
            &entry.description,
            &entry.reasoning,
        )
    }

    /// Rate an item on request, even with auto-rating off. Items that already
    /// hold a rating are left alone.
    pub fn rate_now(&self, item: &Item) -> Scheduled {
        {
            let mut table = self.table();
            if table.streams.contains_key(&item.id) {
                return Scheduled::StreamActive;
            }
            if let Some(record) = table.records.get(&item.id) {
                if record.state.is_final() && record.state != RatingState::Manual {
                    let state = record.state;
                    drop(table);
                    self.rerender(&item.id);
                    return Scheduled::Rerendered(state);
                }
            }
            table.processing.insert(item.id.clone());
        }
        self.set_state(&item.id, RatingState::Pending, None, "Rating...", "");

        let this = self.clone();
        let item_id = item.id.clone();
        tokio::spawn(async move {
            this.process(&item_id, true).await;
        });
        Scheduled::Queued
    }

    /// Cancel the item's stream. Its provisional cache entry goes with it and
    /// the item is rated again on its next encounter.
    pub fn abort_stream(&self, id: &str) -> bool {
        let active = {
            let mut table = self.table();
            table.records.remove(id);
            table.streams.remove(id)
        };
        let Some(active) = active else {
            return false;
        };
        if let Some(abort) = active.abort {
            abort.abort();
        }
        self.inner.cache.discard_unfinished(id);
        info!(item_id = %id, "Stream aborted");
        true
    }

    /// Drop everything known about an item that left the feed.
    pub fn forget(&self, id: &str) {
        let active = {
            let mut table = self.table();
            table.records.remove(id);
            table.processing.remove(id);
            table.streams.remove(id)
        };
        if let Some(abort) = active.and_then(|a| a.abort) {
            abort.abort();
            self.inner.cache.discard_unfinished(id);
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    async fn process(&self, id: &str, forced: bool) {
        self.process_item(id, forced).await;
        let mut table = self.table();
        // A stream still registered here belongs to a newer session.
        if !table.streams.contains_key(id) {
            table.processing.remove(id);
        }
    }

    async fn process_item(&self, id: &str, forced: bool) {
        let config = &self.inner.config;
        if !config.rating.auto_rate && !forced {
            self.set_state(id, RatingState::Manual, None, "Auto-rating disabled", "");
            return;
        }

        let max_attempts = config.timing.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let Some(item) = self.inner.view.item(id) else {
                debug!(item_id = %id, "Item left the feed before rating");
                self.forget(id);
                return;
            };
            if !forced && self.apply_cached_rating(&item) {
                return;
            }

            match self.attempt(&item).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(item_id = %id, "Rating abandoned after stream abort");
                    return;
                }
                Err(TweetFilterError::ItemNotRendered { .. }) => {
                    self.forget(id);
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    error!(item_id = %id, error = %e, "Rating failed, not retrying");
                    self.set_terminal_error(id, &e.to_string());
                    return;
                }
                Err(e) => {
                    if let TweetFilterError::MediaExtraction { .. } = e {
                        self.inner.cache.delete(id);
                    }
                    warn!(item_id = %id, attempt, max_attempts, error = %e, "Rating attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(config.timing.backoff(attempt)).await;
            }
        }

        error!(item_id = %id, attempts = max_attempts, "Rating attempts exhausted");
        self.set_state(
            id,
            RatingState::Error,
            Some(Score::FALLBACK),
            &format!("Rating failed after {max_attempts} attempts: {last_error}"),
            "",
        );
    }

    /// One try: resolve, call, score. `Ok(false)` means the stream was
    /// cancelled and nothing should follow.
    async fn attempt(&self, item: &Item) -> Result<bool, TweetFilterError> {
        let config = &self.inner.config;
        let context = self.inner.resolver.resolve(&item.id).await?;

        let mut media = item.all_media();
        if let Some(thread) = self.inner.mapper.thread_context(&item.id) {
            for url in thread.thread_media_urls {
                if !media.contains(&url) {
                    media.push(url);
                }
            }
        }
        let request = prompt::build_request(
            &config.model,
            &config.rating.instructions,
            &item.id,
            &context,
            &media,
        );

        self.inner.limiter.acquire().await;
        let started = Instant::now();
        let rated = if config.rating.streaming {
            match self.rate_streaming(&item.id, &request).await? {
                Some(rated) => rated,
                None => return Ok(false),
            }
        } else {
            let completion = self.inner.client.complete(&request).await?;
            RatedText {
                content: completion.content,
                reasoning: completion.reasoning,
                generation_id: completion.generation_id,
            }
        };

        let score = prompt::extract_score(&rated.content)?;
        let description = prompt::extract_description(&rated.content);
        let questions = prompt::extract_follow_up_questions(&rated.content);

        self.inner.cache.set_immediate(
            &item.id,
            CacheUpdate::new()
                .score(score)
                .description(description.clone())
                .reasoning(rated.reasoning.clone())
                .questions(questions)
                .streaming(false),
        );
        self.set_state(
            &item.id,
            RatingState::Rated,
            Some(score),
            &description,
            &rated.reasoning,
        );
        info!(
            item_id = %item.id,
            score = score.value(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rating finalized"
        );

        if let Some(generation_id) = rated.generation_id {
            self.spawn_metadata_fetch(&item.id, generation_id);
        }
        Ok(true)
    }

    async fn rate_streaming(
        &self,
        id: &str,
        request: &CompletionRequest,
    ) -> Result<Option<RatedText>, TweetFilterError> {
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        let previous = self.table().streams.insert(
            id.to_string(),
            ActiveStream {
                session_id,
                abort: None,
            },
        );
        if let Some(abort) = previous.and_then(|p| p.abort) {
            debug!(item_id = %id, "Aborting superseded stream");
            abort.abort();
        }

        let this = self.clone();
        let item_id = id.to_string();
        let on_chunk: ChunkCallback = Box::new(move |progress: StreamProgress<'_>| {
            this.on_chunk(&item_id, session_id, progress);
        });
        let session = self.inner.client.stream(request, on_chunk);

        let registered = match self.table().streams.get_mut(id) {
            Some(active) if active.session_id == session_id => {
                active.abort = Some(session.abort_handle());
                true
            }
            _ => false,
        };
        if !registered {
            session.abort();
        }

        let outcome = session.finish().await;

        let superseded = {
            let mut table = self.table();
            match table.streams.get(id) {
                Some(active) if active.session_id == session_id => {
                    table.streams.remove(id);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };

        let completion = outcome?;
        if completion.aborted() {
            if !superseded {
                self.inner.cache.discard_unfinished(id);
            }
            return Ok(None);
        }
        if completion.timed_out() {
            warn!(
                item_id = %id,
                content_len = completion.content.len(),
                "Stream stalled, using partial content"
            );
        }
        Ok(Some(RatedText {
            content: completion.content,
            reasoning: completion.reasoning,
            generation_id: completion.generation_id,
        }))
    }

    fn on_chunk(&self, id: &str, session_id: u64, progress: StreamProgress<'_>) {
        let current = self
            .table()
            .streams
            .get(id)
            .map(|active| active.session_id == session_id)
            .unwrap_or(false);
        if !current {
            return;
        }

        let score = prompt::partial_score(progress.content);
        let description = prompt::extract_description(progress.content);
        let mut update = CacheUpdate::new()
            .description(description.clone())
            .reasoning(progress.reasoning)
            .streaming(true);
        if let Some(score) = score {
            update = update.score(score);
        }
        self.inner.cache.set(id, update);
        self.set_state(
            id,
            RatingState::Streaming,
            score,
            &description,
            progress.reasoning,
        );
    }

    fn spawn_metadata_fetch(&self, id: &str, generation_id: String) {
        let client = self.inner.client.clone();
        let cache = self.inner.cache.clone();
        let item_id = id.to_string();

        tokio::spawn(async move {
            for (attempt, delay) in METADATA_RETRY_DELAYS_MS.iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
                let metadata = match client.generation(&generation_id).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!(item_id = %item_id, attempt, error = %e, "Generation metadata not ready");
                        continue;
                    }
                };
                if cache.get_final(&item_id).is_none() {
                    return;
                }

                let mut update = CacheUpdate::new();
                if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(&metadata) {
                    for (key, value) in fields.into_iter().filter(|(_, v)| !v.is_null()) {
                        update = update.metadata(key, value);
                    }
                }
                cache.set(&item_id, update);
                debug!(item_id = %item_id, "Stored generation metadata");
                return;
            }
            warn!(item_id = %item_id, generation_id = %generation_id, "Gave up on generation metadata");
        });
    }

    // =========================================================================
    // Mapping and reconciliation
    // =========================================================================

    fn ensure_mapping(&self) {
        if self.inner.mapper.is_running() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.map_conversation().await;
        });
    }

    /// Run a mapping pass and reschedule the items it releases.
    pub async fn map_conversation(&self) -> MappingOutcome {
        let outcome = self.inner.mapper.map(self.inner.view.as_ref()).await;
        for id in outcome.released() {
            match self.inner.view.item(id) {
                Some(item) => {
                    self.schedule(&item);
                }
                None => self.forget(id),
            }
        }
        outcome
    }

    /// Reschedule visible items whose state is missing, retryable or stuck,
    /// and drop records for items no longer on screen.
    pub fn sweep(&self) -> SweepStats {
        let visible = self.inner.view.visible_items();
        let visible_ids: HashSet<&str> = visible.iter().map(|i| i.id.as_str()).collect();
        let stuck_after = self.inner.config.timing.stuck_after();

        let (due, evicted) = {
            let mut table = self.table();
            let ItemTable {
                records,
                processing,
                streams,
            } = &mut *table;

            let before = records.len();
            records.retain(|id, _| {
                visible_ids.contains(id.as_str())
                    || processing.contains(id)
                    || streams.contains_key(id)
            });
            let evicted = before - records.len();

            let due: Vec<&Item> = visible
                .iter()
                .filter(|item| {
                    let id = item.id.as_str();
                    if processing.contains(id) || streams.contains_key(id) {
                        return false;
                    }
                    match records.get(id) {
                        None => true,
                        Some(record) if record.terminal || record.state.is_final() => false,
                        Some(record) => record.updated.elapsed() >= stuck_after,
                    }
                })
                .collect();
            (due, evicted)
        };

        for item in &due {
            debug!(item_id = %item.id, "Sweep rescheduling item");
            self.schedule(item);
        }

        let stats = SweepStats {
            visible: visible.len(),
            rescheduled: due.len(),
            evicted,
        };
        if stats.rescheduled > 0 || stats.evicted > 0 {
            debug!(
                visible = stats.visible,
                rescheduled = stats.rescheduled,
                evicted = stats.evicted,
                "Sweep complete"
            );
        }
        stats
    }

    /// One round of background upkeep.
    pub async fn tick(&self) -> SweepStats {
        if self.inner.mapper.is_pending(self.inner.view.as_ref()) {
            self.map_conversation().await;
        }
        self.sweep()
    }

    /// Tick on the sweep interval until `shutdown` resolves, then cancel
    /// streams and persist the cache.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.inner.config.timing.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            interval_ms = self.inner.config.timing.sweep_interval_ms,
            "Rating scheduler running"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        self.shutdown();
    }

    /// Cancel every stream and write the cache out.
    pub fn shutdown(&self) {
        let ids: Vec<ItemId> = self.table().streams.keys().cloned().collect();
        for id in &ids {
            self.abort_stream(id);
        }
        if let Err(e) = self.inner.cache.flush() {
            warn!(error = %e, "Failed to persist rating cache on shutdown");
        }
        info!(aborted = ids.len(), cached = self.cache_count(), "Rating scheduler stopped");
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod scheduler_tests;
