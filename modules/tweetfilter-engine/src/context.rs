//! Full textual context for one item: its own text and media, quoted item,
//! engagement, earlier thread media, and the context of its ancestors.
//!
//! Resolutions are shared per item id. A second caller for an id that is
//! already being resolved awaits the same future instead of starting over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, warn};

use tweetfilter_common::{CacheUpdate, Item, ItemId, TweetFilterError};

use crate::cache::RatingCache;
use crate::describer::MediaDescriber;
use crate::relationships::RelationshipTable;
use crate::thread_mapper::ThreadMapper;
use crate::view::FeedView;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("media extraction failed for item {0}")]
    MediaExtraction(ItemId),

    #[error("item {0} is not rendered")]
    NotRendered(ItemId),

    #[error("context resolution for item {0} was interrupted")]
    Interrupted(ItemId),
}

impl From<ContextError> for TweetFilterError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::MediaExtraction(item_id) => TweetFilterError::MediaExtraction { item_id },
            ContextError::NotRendered(item_id) => TweetFilterError::ItemNotRendered { item_id },
            ContextError::Interrupted(item_id) => TweetFilterError::Anyhow(anyhow::anyhow!(
                "context resolution for item {item_id} was interrupted"
            )),
        }
    }
}

type Resolution = Shared<BoxFuture<'static, Result<String, ContextError>>>;

#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub describe_images: bool,
    pub model_supports_images: bool,
    pub max_depth: usize,
    /// Give up on one ancestor after this long and use a placeholder.
    pub ancestor_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            describe_images: false,
            model_supports_images: false,
            max_depth: 10,
            ancestor_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct ContextResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    cache: RatingCache,
    relationships: RelationshipTable,
    mapper: Arc<ThreadMapper>,
    view: Arc<dyn FeedView>,
    describer: Arc<dyn MediaDescriber>,
    options: ContextOptions,
    in_flight: Mutex<HashMap<ItemId, Resolution>>,
}

impl ContextResolver {
    pub fn new(
        cache: RatingCache,
        relationships: RelationshipTable,
        mapper: Arc<ThreadMapper>,
        view: Arc<dyn FeedView>,
        describer: Arc<dyn MediaDescriber>,
        options: ContextOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                cache,
                relationships,
                mapper,
                view,
                describer,
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<ItemId, Resolution>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Number of resolutions currently running.
    pub fn pending(&self) -> usize {
        self.in_flight().len()
    }

    pub async fn resolve(&self, id: &str) -> Result<String, ContextError> {
        self.shared(id.to_string(), Vec::new()).await
    }

    /// Join the running resolution for `id`, or start one. `path` holds the
    /// descendants that led here.
    ///
    /// The work runs on its own task so it settles and leaves the in-flight
    /// map even when every waiter has given up on it.
    fn shared(&self, id: ItemId, path: Vec<ItemId>) -> Resolution {
        let mut in_flight = self.in_flight();
        if let Some(running) = in_flight.get(&id) {
            debug!(item_id = %id, "Joining in-flight context resolution");
            return running.clone();
        }

        let this = self.clone();
        let key = id.clone();
        let task = tokio::spawn(async move {
            let result = this.build(&key, path).await;
            this.in_flight().remove(&key);
            result
        });

        let this = self.clone();
        let key = id.clone();
        let resolution = async move {
            task.await.unwrap_or_else(|e| {
                warn!(item_id = %key, error = %e, "Context resolution task failed");
                this.in_flight().remove(&key);
                Err(ContextError::Interrupted(key))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(id, resolution.clone());
        resolution
    }

    async fn build(&self, id: &str, path: Vec<ItemId>) -> Result<String, ContextError> {
        let inner = &self.inner;
        let item = inner
            .view
            .item(id)
            .ok_or_else(|| ContextError::NotRendered(id.to_string()))?;

        let needs_media = inner.options.describe_images || inner.options.model_supports_images;
        if needs_media && item.media_expected && item.all_media().is_empty() {
            warn!(item_id = %id, "Media shown but none extracted");
            return Err(ContextError::MediaExtraction(id.to_string()));
        }

        let own = self.own_context(&item).await;
        let full = match self.ancestor_context(&item, path).await {
            Some(ancestors) => format!("{ancestors}\n[REPLY]\n{own}"),
            None => own,
        };

        let mut update = CacheUpdate::new()
            .full_context(full.clone())
            .individual_text(item.text.clone());
        if inner.cache.get(id).and_then(|e| e.score).is_none() {
            update = update.streaming(true);
        }
        inner.cache.set(id, update);
        inner.view.set_context_fallback(id, &full);

        Ok(full)
    }

    async fn own_context(&self, item: &Item) -> String {
        let inner = &self.inner;
        let describe = inner.options.describe_images;
        let mut out = format!("[TWEET {}]\n@{}:\n{}", item.id, item.author, item.text);

        let quoted_media: &[String] = item
            .quoted
            .as_ref()
            .map(|q| q.media_urls.as_slice())
            .unwrap_or_default();
        let own_media: Vec<String> = item
            .media_urls
            .iter()
            .filter(|url| !quoted_media.contains(url))
            .cloned()
            .collect();

        if !own_media.is_empty() {
            if describe {
                let description = inner.describer.describe(&own_media).await;
                out.push_str(&format!("\n[MEDIA_DESCRIPTION]:\n{description}"));
            }
            out.push_str(&format!("\n[MEDIA_URLS]:\n{}", own_media.join(", ")));
        }

        if let Some(stats) = item.engagement.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("\n[ENGAGEMENT_STATS]:\n{stats}"));
        }

        let all_media = item.all_media();
        let thread_media: Vec<String> = inner
            .mapper
            .thread_context(&item.id)
            .map(|c| c.thread_media_urls)
            .unwrap_or_default()
            .into_iter()
            .filter(|url| !all_media.contains(url))
            .collect();
        if !thread_media.is_empty() {
            out.push_str(&format!("\n[THREAD_MEDIA_URLS]:\n{}", thread_media.join(", ")));
        }

        if let Some(quoted) = &item.quoted {
            if !quoted.text.is_empty() || !quoted.media_urls.is_empty() {
                match &quoted.id {
                    Some(qid) => out.push_str(&format!("\n[QUOTED_TWEET {qid}]:")),
                    None => out.push_str("\n[QUOTED_TWEET]:"),
                }
                out.push_str(&format!("\n@{}:\n{}", quoted.handle, quoted.text));

                if !quoted.media_urls.is_empty() {
                    if describe {
                        let description = inner.describer.describe(&quoted.media_urls).await;
                        out.push_str(&format!("\n[QUOTED_TWEET_MEDIA_DESCRIPTION]:\n{description}"));
                    }
                    out.push_str(&format!(
                        "\n[QUOTED_TWEET_MEDIA_URLS]:\n{}",
                        quoted.media_urls.join(", ")
                    ));
                }
            }
        }

        out
    }

    /// Context of the item's parent, which already carries everything above
    /// it. `None` for roots and unmapped items.
    async fn ancestor_context(&self, item: &Item, path: Vec<ItemId>) -> Option<String> {
        let inner = &self.inner;
        let thread = inner.mapper.thread_context(&item.id)?;
        let parent = thread.reply_to_id?;
        let parent_handle = thread.reply_to.unwrap_or_else(|| "unknown".to_string());

        let chain = inner
            .relationships
            .reply_chain(&item.id, inner.options.max_depth);
        let cyclic = chain.cycle || parent == item.id || path.contains(&parent);
        if cyclic || path.len() >= inner.options.max_depth {
            debug!(item_id = %item.id, parent = %parent, cyclic, "Ancestor out of reach");
            return Some(unavailable(&parent, &parent_handle));
        }

        if let Some(context) = inner.cache.get(&parent).and_then(|e| e.full_context) {
            return Some(context);
        }
        if let Some(context) = inner.view.context_fallback(&parent) {
            return Some(context);
        }
        if inner.view.item(&parent).is_none() {
            return Some(unavailable(&parent, &parent_handle));
        }

        let mut next_path = path;
        next_path.push(item.id.clone());
        let resolution = self.shared(parent.clone(), next_path);
        match tokio::time::timeout(inner.options.ancestor_timeout, resolution).await {
            Ok(Ok(context)) => Some(context),
            Ok(Err(e)) => {
                debug!(parent = %parent, error = %e, "Ancestor resolution failed");
                Some(unavailable(&parent, &parent_handle))
            }
            Err(_) => {
                warn!(parent = %parent, "Ancestor resolution timed out");
                Some(unavailable(&parent, &parent_handle))
            }
        }
    }
}

fn unavailable(id: &str, handle: &str) -> String {
    format!("[REPLY TO TWEET {id}]\n@{handle}:\n[CONTEXT UNAVAILABLE]")
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
