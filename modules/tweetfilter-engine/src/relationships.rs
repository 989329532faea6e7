use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use tweetfilter_common::{ItemId, KeyValueStore, ThreadRelationship, TweetFilterError};

pub const RELATIONSHIPS_KEY: &str = "threadRelationships";

/// Above this many entries the table is trimmed on persist.
pub const MAX_RELATIONSHIPS: usize = 1000;
/// Entries kept after trimming, newest first.
pub const RETAINED_RELATIONSHIPS: usize = 500;

/// Ancestors of an item, nearest parent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyChain {
    pub ancestors: Vec<ItemId>,
    /// The walk revisited an item.
    pub cycle: bool,
}

/// Process-wide reply-to table shared by the mapper and the resolver.
#[derive(Clone)]
pub struct RelationshipTable {
    entries: Arc<Mutex<HashMap<ItemId, ThreadRelationship>>>,
    store: Arc<dyn KeyValueStore>,
}

impl RelationshipTable {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let table = Self::new(store);
        let raw = table.store.get_or(RELATIONSHIPS_KEY, "{}");
        match serde_json::from_str::<HashMap<ItemId, ThreadRelationship>>(&raw) {
            Ok(parsed) => *table.lock() = parsed,
            Err(e) => warn!(error = %e, "Stored thread relationships are unreadable"),
        }
        table
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, ThreadRelationship>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<ThreadRelationship> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Merge relationships in. A newer entry replaces an older one, but a
    /// known reply target handle is not forgotten when the newer entry
    /// points at the same parent without one.
    pub fn upsert_many(&self, relationships: impl IntoIterator<Item = (ItemId, ThreadRelationship)>) {
        let mut entries = self.lock();
        for (id, mut incoming) in relationships {
            if let Some(existing) = entries.get(&id) {
                if incoming.to_handle.is_none() && incoming.reply_to_id == existing.reply_to_id {
                    incoming.to_handle = existing.to_handle.clone();
                }
            }
            entries.insert(id, incoming);
        }
    }

    /// Trim if oversized, then write the table to the store.
    pub fn persist(&self) -> Result<(), TweetFilterError> {
        let serialized = {
            let mut entries = self.lock();
            evict_oldest(&mut entries);
            serde_json::to_string(&*entries).map_err(|e| TweetFilterError::Storage(e.to_string()))?
        };
        self.store.set(RELATIONSHIPS_KEY, &serialized)
    }

    /// Walk reply links upward from `id`, at most `max_depth` steps.
    pub fn reply_chain(&self, id: &str, max_depth: usize) -> ReplyChain {
        let entries = self.lock();
        let mut chain = ReplyChain::default();
        let mut seen: HashSet<&str> = HashSet::from([id]);
        let mut current = entries.get(id).and_then(|r| r.reply_to_id.as_deref());

        while let Some(parent) = current {
            if chain.ancestors.len() >= max_depth {
                break;
            }
            if !seen.insert(parent) {
                chain.cycle = true;
                break;
            }
            chain.ancestors.push(parent.to_string());
            current = entries.get(parent).and_then(|r| r.reply_to_id.as_deref());
        }
        chain
    }
}

fn evict_oldest(entries: &mut HashMap<ItemId, ThreadRelationship>) {
    if entries.len() <= MAX_RELATIONSHIPS {
        return;
    }
    let before = entries.len();
    let mut by_age: Vec<(ItemId, i64)> = entries
        .iter()
        .map(|(id, r)| (id.clone(), r.timestamp))
        .collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, _) in by_age.into_iter().skip(RETAINED_RELATIONSHIPS) {
        entries.remove(&id);
    }
    debug!(before, after = entries.len(), "Evicted old thread relationships");
}
