//! Seams between the pipeline and the rendered feed it watches.

use std::sync::LazyLock;

use regex::Regex;

use tweetfilter_common::{Item, ItemId, QuotedItem};

/// One cell of the rendered column. A cell that does not yield an item is a
/// separator between conversation segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub top: f64,
    pub item: Option<Item>,
}

impl Cell {
    pub fn item(top: f64, item: Item) -> Self {
        Self {
            top,
            item: Some(item),
        }
    }

    pub fn separator(top: f64) -> Self {
        Self { top, item: None }
    }
}

/// The live rendered feed. Every call is synchronous and reflects what is on
/// screen at that moment.
pub trait FeedView: Send + Sync {
    /// Items currently rendered, in any order.
    fn visible_items(&self) -> Vec<Item>;

    /// Re-scrape one item if it is still rendered.
    fn item(&self, id: &str) -> Option<Item>;

    /// Cells of the current conversation column, in any order.
    fn cells(&self) -> Vec<Cell>;

    /// Identity of the conversation being shown, when the view is one.
    fn conversation(&self) -> Option<String>;

    /// Item named by the view's address.
    fn anchor_id(&self) -> Option<ItemId>;

    /// Resolved context stashed on a rendered element.
    fn context_fallback(&self, id: &str) -> Option<String>;

    fn set_context_fallback(&self, id: &str, context: &str);

    /// Marker on the conversation saying a mapping pass is running.
    fn mapping_marker(&self) -> bool;

    fn set_mapping_marker(&self, in_progress: bool);
}

/// Pulls item fields out of one markup node.
pub trait MarkupScraper: Send + Sync {
    type Node;

    fn id(&self, node: &Self::Node) -> Option<ItemId>;

    /// Primary author first, then the quoted author if any.
    fn handles(&self, node: &Self::Node) -> Vec<String>;

    fn text(&self, node: &Self::Node) -> String;

    fn media_urls(&self, node: &Self::Node) -> Vec<String>;

    fn is_ad(&self, node: &Self::Node) -> bool;

    fn media_present(&self, node: &Self::Node) -> bool {
        !self.media_urls(node).is_empty()
    }

    fn quoted(&self, _node: &Self::Node) -> Option<QuotedItem> {
        None
    }

    fn engagement(&self, _node: &Self::Node) -> Option<String> {
        None
    }

    /// Capture an item, or `None` when the node has no id or author and so
    /// counts as a separator.
    fn capture(&self, node: &Self::Node) -> Option<Item> {
        let id = self.id(node)?;
        let handles = self.handles(node);
        let author = handles.first()?.trim_start_matches('@').to_string();

        let mut quoted = self.quoted(node);
        if let (Some(q), Some(handle)) = (quoted.as_mut(), handles.get(1)) {
            if q.handle.is_empty() {
                q.handle = handle.trim_start_matches('@').to_string();
            }
        }

        Some(Item {
            id,
            author,
            text: self.text(node),
            media_urls: self.media_urls(node),
            media_expected: self.media_present(node),
            quoted,
            engagement: self.engagement(node),
            is_ad: self.is_ad(node),
        })
    }
}

static STATUS_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/status/(\d+)").unwrap());

/// Item id embedded in a post permalink or view address.
pub fn status_id(address: &str) -> Option<ItemId> {
    STATUS_ID
        .captures(address)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_id_reads_permalinks() {
        assert_eq!(
            status_id("https://x.com/alice/status/42").as_deref(),
            Some("42")
        );
        assert_eq!(status_id("/bob/status/7/photo/1").as_deref(), Some("7"));
        assert_eq!(status_id("https://x.com/home"), None);
    }

    struct PairScraper;

    impl MarkupScraper for PairScraper {
        type Node = (Option<&'static str>, Vec<&'static str>);

        fn id(&self, node: &Self::Node) -> Option<ItemId> {
            node.0.map(str::to_string)
        }

        fn handles(&self, node: &Self::Node) -> Vec<String> {
            node.1.iter().map(|h| h.to_string()).collect()
        }

        fn text(&self, _node: &Self::Node) -> String {
            "body".to_string()
        }

        fn media_urls(&self, _node: &Self::Node) -> Vec<String> {
            Vec::new()
        }

        fn is_ad(&self, _node: &Self::Node) -> bool {
            false
        }
    }

    #[test]
    fn capture_needs_both_id_and_author() {
        let scraper = PairScraper;
        let item = scraper.capture(&(Some("1"), vec!["@alice"])).unwrap();
        assert_eq!(item.author, "alice");
        assert!(scraper.capture(&(None, vec!["@alice"])).is_none());
        assert!(scraper.capture(&(Some("1"), vec![])).is_none());
    }
}
