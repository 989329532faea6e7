use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;

pub type ItemId = String;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedItem {
    #[serde(default)]
    pub id: Option<ItemId>,
    pub handle: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

/// A feed post as scraped from the rendered feed. Re-scraped on every
/// encounter; never mutated after capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub author: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// The markup shows media even if none could be extracted yet.
    #[serde(default)]
    pub media_expected: bool,
    #[serde(default)]
    pub quoted: Option<QuotedItem>,
    #[serde(default)]
    pub engagement: Option<String>,
    #[serde(default)]
    pub is_ad: bool,
}

impl Item {
    pub fn new(id: impl Into<String>, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            text: text.into(),
            media_urls: Vec::new(),
            media_expected: false,
            quoted: None,
            engagement: None,
            is_ad: false,
        }
    }

    pub fn with_media(mut self, urls: Vec<String>) -> Self {
        self.media_expected = self.media_expected || !urls.is_empty();
        self.media_urls = urls;
        self
    }

    pub fn expecting_media(mut self) -> Self {
        self.media_expected = true;
        self
    }

    pub fn with_quoted(mut self, quoted: QuotedItem) -> Self {
        self.quoted = Some(quoted);
        self
    }

    pub fn with_engagement(mut self, stats: impl Into<String>) -> Self {
        self.engagement = Some(stats.into());
        self
    }

    pub fn as_ad(mut self) -> Self {
        self.is_ad = true;
        self
    }

    /// Media on the item itself plus any on its quoted item.
    pub fn all_media(&self) -> Vec<String> {
        let mut urls = self.media_urls.clone();
        if let Some(quoted) = &self.quoted {
            for url in &quoted.media_urls {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }
}

// ---------------------------------------------------------------------------
// Thread relationships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRelationship {
    pub reply_to_id: Option<ItemId>,
    pub from_handle: String,
    pub to_handle: Option<String>,
    pub is_root: bool,
    pub timestamp: i64,
}

/// Thread position mirrored onto a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadContext {
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<ItemId>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub thread_media_urls: Vec<String>,
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// An integer rating on the closed range 0..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 10;

    /// Assigned when every attempt failed to produce a usable score.
    pub const FALLBACK: Score = Score(5);
    /// Assigned to blacklisted authors without asking the model.
    pub const TRUSTED: Score = Score(10);
    /// Assigned to advertisements.
    pub const AD: Score = Score(0);

    pub fn new(value: u64) -> Result<Self, ScoreError> {
        if value > u64::from(Self::MAX) {
            return Err(ScoreError::OutOfRange(value));
        }
        Ok(Score(value as u8))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u64> for Score {
    type Error = ScoreError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> u8 {
        score.0
    }
}

impl FromStr for Score {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u64 = s
            .trim()
            .parse()
            .map_err(|_| ScoreError::Unparsable(s.to_string()))?;
        Score::new(value)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Cache entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub individual_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_context: Option<ThreadContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(default)]
    pub streaming: bool,
    /// Set when the entry came from persistent storage rather than this run.
    #[serde(skip)]
    pub from_storage: bool,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CacheEntry {
    /// Streaming with no score yet: never a usable result.
    pub fn is_provisional(&self) -> bool {
        self.streaming && self.score.is_none()
    }

    /// Not streaming but never scored: left behind by an interrupted run.
    pub fn is_interrupted(&self) -> bool {
        !self.streaming && self.score.is_none()
    }

    /// A finished rating that can stand in for a network call.
    pub fn is_final(&self) -> bool {
        !self.streaming && self.score.is_some()
    }

    /// Fold `update` into this entry, leaving untouched fields alone.
    pub fn merge(&mut self, update: CacheUpdate, now: i64) {
        if let Some(score) = update.score {
            self.score = Some(score);
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(reasoning) = update.reasoning {
            self.reasoning = reasoning;
        }
        if let Some(full_context) = update.full_context {
            self.full_context = Some(full_context);
        }
        if let Some(text) = update.individual_text {
            let longer = match &self.individual_text {
                Some(existing) => text.len() > existing.len(),
                None => true,
            };
            if longer {
                self.individual_text = Some(text);
            }
        }
        if let Some(thread_context) = update.thread_context {
            self.thread_context = Some(thread_context);
        }
        if let Some(questions) = update.questions {
            self.questions = questions;
        }
        if let Some(streaming) = update.streaming {
            self.streaming = streaming;
        }
        self.metadata.extend(update.metadata);
        self.timestamp = update.timestamp.unwrap_or(now);
    }
}

/// A partial cache write. Only the fields that are set are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheUpdate {
    pub score: Option<Score>,
    pub description: Option<String>,
    pub reasoning: Option<String>,
    pub full_context: Option<String>,
    pub individual_text: Option<String>,
    pub thread_context: Option<ThreadContext>,
    pub questions: Option<Vec<String>>,
    pub streaming: Option<bool>,
    pub timestamp: Option<i64>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CacheUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(mut self, score: Score) -> Self {
        self.score = Some(score);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn full_context(mut self, context: impl Into<String>) -> Self {
        self.full_context = Some(context.into());
        self
    }

    pub fn individual_text(mut self, text: impl Into<String>) -> Self {
        self.individual_text = Some(text.into());
        self
    }

    pub fn thread_context(mut self, context: ThreadContext) -> Self {
        self.thread_context = Some(context);
        self
    }

    pub fn questions(mut self, questions: Vec<String>) -> Self {
        self.questions = Some(questions);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub deleted: usize,
    pub remaining: usize,
}

// ---------------------------------------------------------------------------
// Rating state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingState {
    Pending,
    Streaming,
    Rated,
    Cached,
    Blacklisted,
    Manual,
    Error,
}

impl RatingState {
    /// No further automatic processing.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RatingState::Rated | RatingState::Cached | RatingState::Blacklisted | RatingState::Manual
        )
    }

    /// Work is in flight or about to be.
    pub fn is_interim(self) -> bool {
        matches!(self, RatingState::Pending | RatingState::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatingState::Pending => "pending",
            RatingState::Streaming => "streaming",
            RatingState::Rated => "rated",
            RatingState::Cached => "cached",
            RatingState::Blacklisted => "blacklisted",
            RatingState::Manual => "manual",
            RatingState::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: RatingState) -> bool {
        use RatingState::*;
        match self {
            Pending | Error => true,
            Streaming => next != Manual,
            Manual => matches!(next, Pending | Manual | Rated | Cached | Blacklisted),
            Rated | Cached => matches!(next, Rated | Cached | Blacklisted),
            Blacklisted => next == Blacklisted,
        }
    }
}

impl fmt::Display for RatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast whenever an item's rendered state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingEvent {
    pub item_id: ItemId,
    pub status: RatingState,
    pub score: Option<Score>,
    pub description: String,
    pub reasoning: String,
}
