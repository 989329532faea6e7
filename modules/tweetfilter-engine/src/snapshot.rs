//! A feed view backed by a JSON snapshot of the rendered column.
//!
//! ```json
//! { "address": "https://x.com/alice/status/1",
//!   "cells": [ { "top": 0, "node": { "permalink": "/alice/status/1", "handles": ["@alice"], "text": "hi" } },
//!              { "top": 120 } ] }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tweetfilter_common::{Item, ItemId, QuotedItem};

use crate::view::{status_id, Cell, FeedView, MarkupScraper};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub cells: Vec<SnapshotCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCell {
    pub top: f64,
    #[serde(default)]
    pub node: Option<SnapshotNode>,
}

/// Whatever the scraper could read off one rendered post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotNode {
    pub permalink: Option<String>,
    pub handles: Vec<String>,
    pub text: String,
    pub media: Vec<String>,
    /// The markup shows a media container, whether or not URLs were found.
    pub media_present: bool,
    pub ad: bool,
    pub quoted: Option<QuotedItem>,
    pub engagement: Option<String>,
}

pub struct SnapshotScraper;

impl MarkupScraper for SnapshotScraper {
    type Node = SnapshotNode;

    fn id(&self, node: &SnapshotNode) -> Option<ItemId> {
        node.permalink.as_deref().and_then(status_id)
    }

    fn handles(&self, node: &SnapshotNode) -> Vec<String> {
        node.handles.clone()
    }

    fn text(&self, node: &SnapshotNode) -> String {
        node.text.clone()
    }

    fn media_urls(&self, node: &SnapshotNode) -> Vec<String> {
        node.media.clone()
    }

    fn is_ad(&self, node: &SnapshotNode) -> bool {
        node.ad
    }

    fn media_present(&self, node: &SnapshotNode) -> bool {
        node.media_present || !node.media.is_empty()
    }

    fn quoted(&self, node: &SnapshotNode) -> Option<QuotedItem> {
        node.quoted.clone()
    }

    fn engagement(&self, node: &SnapshotNode) -> Option<String> {
        node.engagement.clone()
    }
}

impl FeedSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse feed snapshot")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid snapshot: {}", path.display()))
    }

    /// Scrape every cell. Nodes without an id or author become separators.
    pub fn scrape(&self, scraper: &SnapshotScraper) -> Vec<Cell> {
        self.cells
            .iter()
            .map(|cell| Cell {
                top: cell.top,
                item: cell.node.as_ref().and_then(|node| scraper.capture(node)),
            })
            .collect()
    }
}

#[derive(Default)]
struct ViewState {
    address: String,
    cells: Vec<Cell>,
    fallbacks: HashMap<ItemId, String>,
    marker: bool,
}

pub struct SnapshotView {
    path: Option<PathBuf>,
    scraper: SnapshotScraper,
    state: Mutex<ViewState>,
}

impl SnapshotView {
    pub fn new(snapshot: &FeedSnapshot) -> Self {
        let view = Self {
            path: None,
            scraper: SnapshotScraper,
            state: Mutex::new(ViewState::default()),
        };
        view.replace(snapshot);
        view
    }

    /// Open a snapshot file that [`reload`](Self::reload) will re-read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = FeedSnapshot::read(&path)?;
        let mut view = Self::new(&snapshot);
        view.path = Some(path);
        Ok(view)
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in a new render. Navigating to another address drops what was
    /// stashed on the old page.
    pub fn replace(&self, snapshot: &FeedSnapshot) {
        let cells = snapshot.scrape(&self.scraper);
        let mut state = self.lock();
        if state.address != snapshot.address {
            debug!(from = %state.address, to = %snapshot.address, "View navigated");
            state.fallbacks.clear();
            state.marker = false;
            state.address = snapshot.address.clone();
        }
        let rendered = cells.iter().filter(|c| c.item.is_some()).count();
        state.cells = cells;
        drop(state);
        debug!(cells = snapshot.cells.len(), rendered, "Snapshot applied");
    }

    /// Re-read the snapshot file, if there is one.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = FeedSnapshot::read(path)?;
        self.replace(&snapshot);
        Ok(())
    }

    pub fn address(&self) -> String {
        self.lock().address.clone()
    }

    pub fn log_summary(&self) {
        let state = self.lock();
        info!(
            address = %state.address,
            items = state.cells.iter().filter(|c| c.item.is_some()).count(),
            separators = state.cells.iter().filter(|c| c.item.is_none()).count(),
            "Feed snapshot loaded"
        );
    }
}

impl FeedView for SnapshotView {
    fn visible_items(&self) -> Vec<Item> {
        self.lock()
            .cells
            .iter()
            .filter_map(|c| c.item.clone())
            .collect()
    }

    fn item(&self, id: &str) -> Option<Item> {
        self.lock()
            .cells
            .iter()
            .filter_map(|c| c.item.as_ref())
            .find(|i| i.id == id)
            .cloned()
    }

    fn cells(&self) -> Vec<Cell> {
        self.lock().cells.clone()
    }

    fn conversation(&self) -> Option<String> {
        status_id(&self.lock().address).map(|id| format!("status/{id}"))
    }

    fn anchor_id(&self) -> Option<ItemId> {
        status_id(&self.lock().address)
    }

    fn context_fallback(&self, id: &str) -> Option<String> {
        self.lock().fallbacks.get(id).cloned()
    }

    fn set_context_fallback(&self, id: &str, context: &str) {
        self.lock()
            .fallbacks
            .insert(id.to_string(), context.to_string());
    }

    fn mapping_marker(&self) -> bool {
        self.lock().marker
    }

    fn set_mapping_marker(&self, in_progress: bool) {
        self.lock().marker = in_progress;
    }
}
