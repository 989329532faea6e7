//! Reply hierarchy for the conversation currently on screen.
//!
//! A pass reads the rendered cells, orders them top to bottom and links each
//! item to the one above it. Separators break the chain: the next item
//! replies to the anchor (the item named by the address) when one is known,
//! otherwise it starts a new root.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use tweetfilter_common::{now_millis, CacheUpdate, ItemId, ThreadContext, ThreadRelationship};

use crate::cache::RatingCache;
use crate::relationships::RelationshipTable;
use crate::view::{Cell, FeedView};

/// One item's position as decided by a mapping pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedItem {
    pub id: ItemId,
    pub handle: String,
    pub reply_to_id: Option<ItemId>,
    pub to_handle: Option<String>,
    pub is_root: bool,
    /// Media from earlier items in the same thread.
    pub thread_media_urls: Vec<String>,
}

/// The anchor item, when it can be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub id: ItemId,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAConversation,
    InProgress,
    CoolingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    Mapped { items: usize, released: Vec<ItemId> },
    Failed { released: Vec<ItemId> },
    Skipped(SkipReason),
}

impl MappingOutcome {
    /// Items that were waiting on this pass and may now be processed.
    pub fn released(&self) -> &[ItemId] {
        match self {
            MappingOutcome::Mapped { released, .. } | MappingOutcome::Failed { released } => {
                released
            }
            MappingOutcome::Skipped(_) => &[],
        }
    }
}

enum Previous<'a> {
    Start,
    Separator,
    Item(&'a MappedItem),
}

/// Derive reply links from rendered cells.
pub fn map_cells(cells: &[Cell], anchor: Option<&Anchor>) -> Vec<MappedItem> {
    let mut ordered: Vec<&Cell> = cells.iter().collect();
    ordered.sort_by(|a, b| a.top.total_cmp(&b.top));

    let mut mapped: Vec<MappedItem> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut previous_is_separator = false;

    for cell in ordered {
        let Some(item) = &cell.item else {
            previous_is_separator = true;
            continue;
        };
        if !seen.insert(item.id.as_str()) {
            continue;
        }

        let previous = match (mapped.last(), previous_is_separator) {
            (None, _) => Previous::Start,
            (Some(_), true) => Previous::Separator,
            (Some(last), false) => Previous::Item(last),
        };
        previous_is_separator = false;

        let (reply_to_id, to_handle) = match previous {
            Previous::Start => (None, None),
            Previous::Separator => match anchor {
                Some(anchor) if anchor.id != item.id => {
                    (Some(anchor.id.clone()), anchor.handle.clone())
                }
                _ => (None, None),
            },
            Previous::Item(last) => (Some(last.id.clone()), Some(last.handle.clone())),
        };

        mapped.push(MappedItem {
            id: item.id.clone(),
            handle: item.author.clone(),
            is_root: reply_to_id.is_none(),
            reply_to_id,
            to_handle,
            thread_media_urls: Vec::new(),
        });
    }

    attach_thread_media(&mut mapped, cells);
    mapped
}

/// Give each item the media of the items above it in its thread.
fn attach_thread_media(mapped: &mut [MappedItem], cells: &[Cell]) {
    let media: HashMap<&str, &[String]> = cells
        .iter()
        .filter_map(|c| c.item.as_ref())
        .map(|i| (i.id.as_str(), i.media_urls.as_slice()))
        .collect();

    let mut by_id: HashMap<ItemId, Vec<String>> = HashMap::new();
    for entry in mapped.iter_mut() {
        let mut inherited = entry
            .reply_to_id
            .as_ref()
            .and_then(|parent| by_id.get(parent).cloned())
            .unwrap_or_default();
        entry.thread_media_urls = inherited.clone();

        for url in media.get(entry.id.as_str()).copied().unwrap_or_default() {
            if !inherited.contains(url) {
                inherited.push(url.clone());
            }
        }
        by_id.insert(entry.id.clone(), inherited);
    }
}

#[derive(Default)]
struct MapperState {
    in_progress: bool,
    /// Conversation the latest pass ran on. Navigating away and back maps
    /// the conversation again.
    attempted: Option<String>,
    last_success: Option<(String, Instant)>,
    waiting: HashSet<ItemId>,
    mapping: HashMap<ItemId, MappedItem>,
}

pub struct ThreadMapper {
    cache: RatingCache,
    relationships: RelationshipTable,
    timeout: Duration,
    cooldown: Duration,
    state: Mutex<MapperState>,
}

impl ThreadMapper {
    pub fn new(
        cache: RatingCache,
        relationships: RelationshipTable,
        timeout: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            cache,
            relationships,
            timeout,
            cooldown,
            state: Mutex::new(MapperState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A pass is running, or the shown conversation has never been mapped.
    pub fn is_pending(&self, view: &dyn FeedView) -> bool {
        let Some(conversation) = view.conversation() else {
            return false;
        };
        let state = self.lock();
        state.in_progress || state.attempted.as_deref() != Some(conversation.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.lock().in_progress
    }

    /// Park an item until the next pass finishes.
    pub fn wait(&self, id: &str) {
        self.lock().waiting.insert(id.to_string());
    }

    /// Park an item only while a pass is running or due, checked under the
    /// same lock that releases waiters. Returns whether it was parked.
    pub fn wait_if_pending(&self, view: &dyn FeedView, id: &str) -> bool {
        let Some(conversation) = view.conversation() else {
            return false;
        };
        let mut state = self.lock();
        if state.in_progress || state.attempted.as_deref() != Some(conversation.as_str()) {
            state.waiting.insert(id.to_string());
            true
        } else {
            false
        }
    }

    /// Thread position from the latest pass, falling back to the shared table.
    pub fn thread_context(&self, id: &str) -> Option<ThreadContext> {
        if let Some(mapped) = self.lock().mapping.get(id) {
            return Some(ThreadContext {
                reply_to: mapped.to_handle.clone(),
                reply_to_id: mapped.reply_to_id.clone(),
                is_root: mapped.is_root,
                thread_media_urls: mapped.thread_media_urls.clone(),
            });
        }
        self.relationships.get(id).map(|r| ThreadContext {
            reply_to: r.to_handle,
            reply_to_id: r.reply_to_id,
            is_root: r.is_root,
            thread_media_urls: Vec::new(),
        })
    }

    /// Run one guarded pass over the view.
    pub async fn map(&self, view: &dyn FeedView) -> MappingOutcome {
        let Some(conversation) = view.conversation() else {
            return MappingOutcome::Skipped(SkipReason::NotAConversation);
        };

        {
            let mut state = self.lock();
            if state.in_progress || view.mapping_marker() {
                return MappingOutcome::Skipped(SkipReason::InProgress);
            }
            if let Some((last, at)) = &state.last_success {
                if *last == conversation && at.elapsed() < self.cooldown {
                    return MappingOutcome::Skipped(SkipReason::CoolingDown);
                }
            }
            state.in_progress = true;
        }
        view.set_mapping_marker(true);

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.pass(view)).await;

        view.set_mapping_marker(false);
        let mut state = self.lock();
        state.in_progress = false;
        state.attempted = Some(conversation.clone());
        let released: Vec<ItemId> = state.waiting.drain().collect();

        match result {
            Ok(mapped) => {
                let items = mapped.len();
                state.mapping = mapped.into_iter().map(|m| (m.id.clone(), m)).collect();
                state.last_success = Some((conversation.clone(), Instant::now()));
                drop(state);
                info!(
                    conversation = %conversation,
                    items,
                    released = released.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Thread mapping complete"
                );
                MappingOutcome::Mapped { items, released }
            }
            Err(_) => {
                drop(state);
                warn!(
                    conversation = %conversation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Thread mapping timed out, keeping previous mapping"
                );
                MappingOutcome::Failed { released }
            }
        }
    }

    async fn pass(&self, view: &dyn FeedView) -> Vec<MappedItem> {
        let cells = view.cells();
        let anchor = view.anchor_id().and_then(|id| self.resolve_anchor(&id, &cells));
        if anchor.is_none() {
            debug!("No resolvable anchor, separators start new roots");
        }

        // Let the render settle between reading and writing.
        tokio::task::yield_now().await;

        let mapped = map_cells(&cells, anchor.as_ref());
        self.record(&mapped);
        mapped
    }

    /// An anchor counts only if it is on screen or already known.
    fn resolve_anchor(&self, id: &str, cells: &[Cell]) -> Option<Anchor> {
        if let Some(item) = cells.iter().filter_map(|c| c.item.as_ref()).find(|i| i.id == id) {
            return Some(Anchor {
                id: id.to_string(),
                handle: Some(item.author.clone()),
            });
        }
        if let Some(rel) = self.relationships.get(id) {
            return Some(Anchor {
                id: id.to_string(),
                handle: Some(rel.from_handle),
            });
        }
        self.cache.has(id).then(|| Anchor {
            id: id.to_string(),
            handle: None,
        })
    }

    fn record(&self, mapped: &[MappedItem]) {
        let now = now_millis();
        self.relationships.upsert_many(mapped.iter().map(|m| {
            (
                m.id.clone(),
                ThreadRelationship {
                    reply_to_id: m.reply_to_id.clone(),
                    from_handle: m.handle.clone(),
                    to_handle: m.to_handle.clone(),
                    is_root: m.is_root,
                    timestamp: now,
                },
            )
        }));
        if let Err(e) = self.relationships.persist() {
            warn!(error = %e, "Failed to persist thread relationships");
        }

        for m in mapped {
            if self.cache.has(&m.id) {
                self.cache.set(
                    &m.id,
                    CacheUpdate::new().thread_context(ThreadContext {
                        reply_to: m.to_handle.clone(),
                        reply_to_id: m.reply_to_id.clone(),
                        is_root: m.is_root,
                        thread_media_urls: m.thread_media_urls.clone(),
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "thread_mapper_tests.rs"]
mod thread_mapper_tests;
